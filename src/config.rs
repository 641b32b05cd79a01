use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::controller::PowerMatcherConfig;
use crate::logging::LogConfig;
use crate::models::{DataSources, SpeedSource};
use crate::session::{AutoPauseConfig, SessionConfig};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application metadata
    pub metadata: ConfigMetadata,

    /// Rider profile
    pub athlete: AthleteSettings,

    /// Adaptive power matching policy
    pub power_matcher: PowerMatcherConfig,

    /// Automatic pause on sustained zero power
    pub auto_pause: AutoPauseConfig,

    /// Session timer, countdown and checkpoint settings
    pub session: SessionSettings,

    /// Where measurements are taken from
    pub sources: SourceSettings,

    /// Logging output
    pub logging: LogConfig,
}

/// Configuration metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigMetadata {
    /// Configuration format version
    pub version: String,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    pub updated_at: DateTime<Utc>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: "1.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AthleteSettings {
    /// Functional Threshold Power (watts)
    pub ftp: u16,
}

impl Default for AthleteSettings {
    fn default() -> Self {
        Self { ftp: 200 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Interval seconds remaining when the countdown cue fires
    pub countdown_at: u32,

    /// Elapsed seconds between record checkpoints (0 disables)
    pub checkpoint_every: u32,

    /// Directory for record checkpoints (None disables)
    pub checkpoint_dir: Option<PathBuf>,

    /// Tick period in milliseconds
    pub tick_period_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            countdown_at: 4,
            checkpoint_every: 60,
            checkpoint_dir: None,
            tick_period_ms: 1000,
        }
    }
}

impl SessionSettings {
    pub fn timer(&self) -> SessionConfig {
        SessionConfig {
            countdown_at: self.countdown_at,
            checkpoint_every: self.checkpoint_every,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    pub speed_source: SpeedSource,
}

impl AppConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.metadata.updated_at = Utc::now();

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml_content = toml::to_string_pretty(self)
            .with_context(|| "Failed to serialize configuration to TOML")?;

        fs::write(&path, toml_content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        Ok(())
    }

    /// Get default configuration file path
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".trainctl")
            .join("config.toml")
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default() -> Self {
        let config_path = Self::default_config_path();

        match Self::load_from_file(&config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(
                    path = %config_path.display(),
                    error = %e,
                    "Using default configuration"
                );
                Self::default()
            }
        }
    }

    /// Save configuration to default location
    pub fn save_default(&mut self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to_file(config_path)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.athlete.ftp == 0 {
            bail!("athlete.ftp must be greater than zero");
        }
        if self.power_matcher.window == 0 {
            bail!("power_matcher.window must be at least 1");
        }
        if self.power_matcher.max_adjustment < 0 || self.power_matcher.step < 0 {
            bail!("power_matcher.step and power_matcher.max_adjustment must not be negative");
        }
        if self.auto_pause.zero_readings == 0 {
            bail!("auto_pause.zero_readings must be at least 1");
        }
        if self.session.tick_period_ms == 0 {
            bail!("session.tick_period_ms must be greater than zero");
        }
        Ok(())
    }

    /// Initial data source settings published on the bus
    pub fn data_sources(&self) -> DataSources {
        DataSources {
            speed_source: self.sources.speed_source,
            auto_pause: self.auto_pause.enabled,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            metadata: ConfigMetadata::default(),
            athlete: AthleteSettings::default(),
            power_matcher: PowerMatcherConfig::default(),
            auto_pause: AutoPauseConfig::default(),
            session: SessionSettings::default(),
            sources: SourceSettings::default(),
            logging: LogConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_serialization() {
        let config = AppConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: AppConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.metadata.version, deserialized.metadata.version);
        assert_eq!(config.athlete, deserialized.athlete);
        assert_eq!(config.power_matcher, deserialized.power_matcher);
        assert_eq!(config.session, deserialized.session);
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.athlete.ftp, 200);
        assert_eq!(config.power_matcher.initial_offset, -10);
        assert_eq!(config.power_matcher.max_adjustment, 25);
        assert_eq!(config.auto_pause.zero_readings, 4);
        assert_eq!(config.auto_pause.resume_watts, 40);
        assert_eq!(config.session.countdown_at, 4);
        assert_eq!(config.session.checkpoint_every, 60);
        assert_eq!(config.session.tick_period_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [athlete]
            ftp = 275

            [auto_pause]
            enabled = true
            zero_readings = 4
            resume_watts = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.athlete.ftp, 275);
        assert!(config.data_sources().auto_pause);
        assert_eq!(config.auto_pause.resume_watts, 50);
        assert_eq!(config.power_matcher.window, 5);
        assert_eq!(config.sources.speed_source, SpeedSource::Virtual);
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = AppConfig::default();
        original.athlete.ftp = 310;
        original.session.checkpoint_dir = Some(temp_dir.path().join("sessions"));

        original.save_to_file(&config_path).unwrap();
        let loaded = AppConfig::load_from_file(&config_path).unwrap();

        assert_eq!(loaded.athlete.ftp, 310);
        assert_eq!(loaded.session.checkpoint_dir, original.session.checkpoint_dir);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "[athlete]\nftp = 0\n").unwrap();

        let err = AppConfig::load_from_file(&config_path).unwrap_err();
        assert!(err.to_string().contains("ftp"));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = AppConfig::load_from_file("/no/such/trainctl.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
