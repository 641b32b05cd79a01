//! Unified error hierarchy for trainctl
//!
//! The session engine itself never fails: bad plan data degrades to defaults
//! and invalid commands are ignored. Errors only surface at the edges, when
//! loading configuration or plans, writing checkpoints, or when the runtime's
//! channels shut down.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for all trainctl operations
#[derive(Debug, Error)]
pub enum TrainCtlError {
    /// Workout plan loading errors
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A runtime channel closed underneath us
    #[error("Channel closed: {channel}")]
    Channel { channel: String },

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Workout plan loading errors
#[derive(Debug, Error)]
pub enum PlanError {
    /// File not found at specified path
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Plan could not be parsed
    #[error("Invalid plan: {reason}")]
    Invalid { reason: String },

    /// Plan has no usable intervals
    #[error("Plan has no intervals with steps")]
    Empty,
}

/// Result type alias for trainctl operations
pub type Result<T> = std::result::Result<T, TrainCtlError>;

impl TrainCtlError {
    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TrainCtlError::Plan(PlanError::FileNotFound { .. }) => ErrorSeverity::Warning,
            TrainCtlError::Plan(PlanError::Empty) => ErrorSeverity::Warning,
            TrainCtlError::Plan(_) => ErrorSeverity::Error,
            TrainCtlError::Channel { .. } => ErrorSeverity::Info,
            TrainCtlError::Internal(_) => ErrorSeverity::Critical,
            _ => ErrorSeverity::Error,
        }
    }

    /// Log the error at the level its severity calls for
    pub fn log(&self, context: &str) {
        let severity = self.severity();
        match severity.to_tracing_level() {
            tracing::Level::ERROR => tracing::error!(error = %self, ?severity, "{}", context),
            tracing::Level::WARN => tracing::warn!(error = %self, ?severity, "{}", context),
            _ => tracing::info!(error = %self, ?severity, "{}", context),
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            TrainCtlError::Plan(PlanError::FileNotFound { path }) => {
                format!("Could not find workout plan: {}", path.display())
            }
            TrainCtlError::Plan(PlanError::Empty) => {
                "The workout plan has no steps to ride.".to_string()
            }
            TrainCtlError::Plan(PlanError::Invalid { reason }) => {
                format!("Workout plan could not be read: {}", reason)
            }
            _ => self.to_string(),
        }
    }
}

/// Error severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical system error requiring immediate attention
    Critical,
    /// Error that prevents operation but system can continue
    Error,
    /// Warning that doesn't prevent operation
    Warning,
    /// Informational message
    Info,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Critical => tracing::Level::ERROR,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Info => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_severity() {
        let err = TrainCtlError::Plan(PlanError::FileNotFound {
            path: PathBuf::from("/plans/sweetspot.json"),
        });
        assert_eq!(err.severity(), ErrorSeverity::Warning);

        let err = TrainCtlError::Internal("test".to_string());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::ERROR);
    }

    #[test]
    fn test_severity_levels() {
        let err = TrainCtlError::Plan(PlanError::Empty);
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::WARN);

        let err = TrainCtlError::Channel {
            channel: "ticks".to_string(),
        };
        assert_eq!(err.severity().to_tracing_level(), tracing::Level::INFO);

        // must not panic without a subscriber installed
        err.log("Session ended with an error");
    }

    #[test]
    fn test_user_messages() {
        let err = TrainCtlError::Plan(PlanError::FileNotFound {
            path: PathBuf::from("plan.json"),
        });
        assert!(err.user_message().contains("Could not find"));

        let err = TrainCtlError::Plan(PlanError::Empty);
        assert!(err.user_message().contains("no steps"));
    }
}
