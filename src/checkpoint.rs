//! Periodic best-effort backup of the record log

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use uuid::Uuid;

use crate::error::Result;
use crate::models::Record;

/// Receives the full record log at a fixed cadence. Failures stay inside the
/// implementation; the session never waits on or reacts to a backup.
pub trait Checkpoint: Send {
    fn backup(&mut self, records: &[Record]);
}

/// Discards every backup
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn backup(&mut self, _records: &[Record]) {}
}

#[derive(Serialize)]
struct Snapshot<'a> {
    session_id: Uuid,
    saved_at: DateTime<Utc>,
    records: &'a [Record],
}

/// Writes the record log to `<dir>/session_<id>.json`, replacing the previous backup.
///
/// Inside a tokio runtime the write runs on the blocking pool and `backup`
/// returns as soon as the records are copied. Outside one it writes inline.
#[derive(Debug, Clone)]
pub struct JsonCheckpoint {
    session_id: Uuid,
    path: PathBuf,
    generation: u64,
    written: Arc<Mutex<u64>>,
}

impl JsonCheckpoint {
    pub fn new<P: AsRef<Path>>(dir: P, session_id: Uuid) -> Self {
        let path = dir.as_ref().join(format!("session_{}.json", session_id));
        Self {
            session_id,
            path,
            generation: 0,
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, records: &[Record]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let snapshot = Snapshot {
            session_id: self.session_id,
            saved_at: Utc::now(),
            records,
        };
        let json = serde_json::to_string(&snapshot)?;

        // readers never see a half-written backup
        let staging = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&staging)?;
        file.write_all(json.as_bytes())?;
        fs::rename(&staging, &self.path)?;
        Ok(())
    }

    /// Write unless a later generation already landed
    fn write_generation(&self, generation: u64, records: &[Record]) {
        let mut written = self.written.lock().unwrap_or_else(|e| e.into_inner());
        if *written > generation {
            tracing::debug!(generation, "Skipping superseded checkpoint");
            return;
        }

        match self.write(records) {
            Ok(()) => {
                *written = generation;
                tracing::debug!(
                    records = records.len(),
                    path = %self.path.display(),
                    "Session checkpoint written"
                );
            }
            Err(e) => tracing::warn!(
                error = %e,
                path = %self.path.display(),
                "Session checkpoint failed"
            ),
        }
    }
}

impl Checkpoint for JsonCheckpoint {
    fn backup(&mut self, records: &[Record]) {
        self.generation += 1;
        let generation = self.generation;

        match Handle::try_current() {
            Ok(runtime) => {
                let writer = self.clone();
                let records = records.to_vec();
                runtime.spawn_blocking(move || writer.write_generation(generation, &records));
            }
            Err(_) => self.write_generation(generation, records),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(power: u16) -> Record {
        Record {
            timestamp: Utc::now(),
            power,
            cadence: 85,
            speed: 32.1,
            heart_rate: 140,
            distance: 1200.0,
            grade: 0.0,
            altitude: None,
            position_lat: None,
            position_long: None,
            saturated_hemoglobin_percent: None,
            total_hemoglobin_conc: None,
            core_temperature: None,
            skin_temperature: None,
            device_index: 0,
        }
    }

    #[test]
    fn test_json_checkpoint_writes_records() {
        let dir = tempdir().unwrap();
        let id = Uuid::new_v4();
        let mut checkpoint = JsonCheckpoint::new(dir.path().join("sessions"), id);

        checkpoint.backup(&[record(200), record(210)]);

        let content = fs::read_to_string(checkpoint.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["session_id"], id.to_string());
        assert_eq!(value["records"].as_array().unwrap().len(), 2);
        assert_eq!(value["records"][1]["power"], 210);
    }

    #[test]
    fn test_failed_checkpoint_is_swallowed() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        fs::write(&blocker, "x").unwrap();

        let mut checkpoint = JsonCheckpoint::new(&blocker, Uuid::new_v4());
        assert!(checkpoint.write(&[record(100)]).is_err());

        // must not panic
        checkpoint.backup(&[record(100)]);
    }

    #[tokio::test]
    async fn test_backup_in_runtime_does_not_wait_for_write() {
        let dir = tempdir().unwrap();
        let mut checkpoint = JsonCheckpoint::new(dir.path(), Uuid::new_v4());
        let records: Vec<Record> = (0..500).map(|i| record(100 + i % 200)).collect();

        checkpoint.backup(&records[..250]);
        checkpoint.backup(&records);

        let mut saved = None;
        for _ in 0..200 {
            if let Ok(content) = fs::read_to_string(checkpoint.path()) {
                let value: serde_json::Value = serde_json::from_str(&content).unwrap();
                if value["records"].as_array().unwrap().len() == 500 {
                    saved = Some(value);
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert!(saved.is_some(), "latest checkpoint never landed");
        assert!(!checkpoint.path().with_extension("json.tmp").exists());
    }
}
