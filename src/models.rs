use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{PlanError, Result};

/// A structured workout: an ordered sequence of intervals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkoutPlan {
    /// Display name of the workout
    #[serde(default)]
    pub name: Option<String>,

    /// Intervals in riding order
    #[serde(default)]
    pub intervals: Vec<Interval>,
}

/// A group of steps, optionally carrying its own total duration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    /// Total interval duration in seconds
    #[serde(default)]
    pub duration: Option<u32>,

    /// Steps in riding order
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// The smallest unit of a workout, with optional targets
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step duration in seconds. Steps without a duration are not advanced by the clock.
    #[serde(default)]
    pub duration: Option<u32>,

    /// Power target relative to FTP (0.8 = 80% FTP)
    #[serde(default)]
    pub power: Option<f64>,

    /// Slope target in percent grade
    #[serde(default)]
    pub slope: Option<f64>,

    /// Cadence target in rpm
    #[serde(default)]
    pub cadence: Option<u16>,

    /// Distance target in meters
    #[serde(default)]
    pub distance: Option<f64>,
}

impl WorkoutPlan {
    /// Parse a plan from JSON, dropping intervals that have no steps
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: WorkoutPlan = serde_json::from_str(json).map_err(|e| PlanError::Invalid {
            reason: e.to_string(),
        })?;
        Ok(plan.sanitized())
    }

    /// Load a plan from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(PlanError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = fs::read_to_string(path)?;
        let plan = Self::from_json(&content)?;
        if plan.is_empty() {
            return Err(PlanError::Empty.into());
        }
        Ok(plan)
    }

    /// Remove intervals without steps so every interval index has a step 0
    pub fn sanitized(mut self) -> Self {
        let before = self.intervals.len();
        self.intervals.retain(|interval| !interval.steps.is_empty());
        let dropped = before - self.intervals.len();
        if dropped > 0 {
            tracing::warn!(dropped, "Dropped intervals without steps from workout plan");
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn interval(&self, index: usize) -> Option<&Interval> {
        self.intervals.get(index)
    }

    pub fn step(&self, position: Position) -> Option<&Step> {
        self.intervals
            .get(position.interval)
            .and_then(|interval| interval.steps.get(position.step))
    }

    /// Whether the interval at `position` has a step after the current one
    pub fn has_next_step(&self, position: Position) -> bool {
        self.intervals
            .get(position.interval)
            .map(|interval| position.step + 1 < interval.steps.len())
            .unwrap_or(false)
    }

    /// Whether another interval follows the one at `position`
    pub fn has_next_interval(&self, position: Position) -> bool {
        position.interval + 1 < self.intervals.len()
    }

    /// Total number of steps across all intervals
    pub fn total_steps(&self) -> usize {
        self.intervals.iter().map(|i| i.steps.len()).sum()
    }

    /// Sum of step durations in seconds, ignoring steps without one
    pub fn total_duration(&self) -> u32 {
        self.intervals
            .iter()
            .flat_map(|i| i.steps.iter())
            .filter_map(|s| s.duration)
            .sum()
    }
}

/// Pointer into a workout plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub interval: usize,
    pub step: usize,
}

impl Position {
    pub fn new(interval: usize, step: usize) -> Self {
        Self { interval, step }
    }
}

/// Session clock values in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    /// Seconds since the session started
    pub elapsed: u32,
    /// Seconds in the current interval (counts down during a workout)
    pub lap_time: u32,
    /// Seconds remaining in the current step
    pub step_time: u32,
}

/// Lifecycle of the session timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Stopped,
    Started,
    Paused,
}

/// Lifecycle of the structured workout, independent of the timer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkoutStatus {
    #[default]
    Stopped,
    Started,
    Done,
}

/// Trainer control mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlMode {
    /// Emulate road resistance from a slope
    #[default]
    Simulation,
    /// Hold a fixed power target (ERG)
    TargetPower,
    /// Fixed resistance level
    Resistance,
}

/// Where recorded speed is taken from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedSource {
    /// Speed reported by a sensor or the trainer
    Sensor,
    /// Speed computed from power by the simulation model
    #[default]
    Virtual,
}

/// Data source configuration published by the settings layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSources {
    pub speed_source: SpeedSource,
    pub auto_pause: bool,
}

/// Timer event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Stop,
}

/// A timer start/stop marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventType,
}

/// One-second measurement snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    pub power: u16,
    pub cadence: u16,
    /// Speed in km/h
    pub speed: f64,
    pub heart_rate: u16,
    /// Distance in meters
    pub distance: f64,
    /// Current slope target in percent
    pub grade: f64,
    pub altitude: Option<f64>,
    pub position_lat: Option<f64>,
    pub position_long: Option<f64>,
    pub saturated_hemoglobin_percent: Option<f64>,
    pub total_hemoglobin_conc: Option<f64>,
    pub core_temperature: Option<f64>,
    pub skin_temperature: Option<f64>,
    pub device_index: u8,
}

/// Summary of the records between two lap boundaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lap {
    /// When the lap was closed
    pub timestamp: DateTime<Utc>,
    pub start_time: DateTime<Utc>,
    /// Wall-clock seconds between start_time and timestamp
    pub total_elapsed_time: u32,
    pub avg_power: u16,
    pub max_power: u16,
    pub avg_cadence: u16,
    pub avg_heart_rate: u16,
    pub saturated_hemoglobin_percent: Option<Decimal>,
    pub total_hemoglobin_conc: Option<Decimal>,
    pub core_temperature: Option<Decimal>,
    pub skin_temperature: Option<Decimal>,
}

impl Lap {
    /// Build a lap summary from the records collected since the last boundary.
    ///
    /// Average power is not derived from the records: the live lap average is
    /// tracked upstream and passed in.
    pub fn summarize(
        records: &[Record],
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        total_elapsed_time: u32,
        avg_power: u16,
    ) -> Self {
        Self {
            timestamp: end_time,
            start_time,
            total_elapsed_time,
            avg_power,
            max_power: records.iter().map(|r| r.power).max().unwrap_or(0),
            avg_cadence: rounded_mean(records.iter().map(|r| r.cadence as f64)),
            avg_heart_rate: rounded_mean(records.iter().map(|r| r.heart_rate as f64)),
            saturated_hemoglobin_percent: channel_mean(records, |r| {
                r.saturated_hemoglobin_percent
            }),
            total_hemoglobin_conc: channel_mean(records, |r| r.total_hemoglobin_conc),
            core_temperature: channel_mean(records, |r| r.core_temperature),
            skin_temperature: channel_mean(records, |r| r.skin_temperature),
        }
    }
}

fn rounded_mean(values: impl Iterator<Item = f64>) -> u16 {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if count == 0 {
        return 0;
    }
    (sum / count as f64).round() as u16
}

/// Two-decimal mean over the records that carry the channel
fn channel_mean(records: &[Record], channel: impl Fn(&Record) -> Option<f64>) -> Option<Decimal> {
    let values: Vec<f64> = records.iter().filter_map(channel).collect();
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Decimal::from_f64(mean).map(|d| d.round_dp(2))
}

/// Convert an FTP-relative power target into watts
pub fn to_absolute_power(relative: f64, ftp: u16) -> u16 {
    (relative * ftp as f64).round().clamp(0.0, u16::MAX as f64) as u16
}
