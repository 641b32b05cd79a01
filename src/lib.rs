// Library interface for trainctl modules
// This allows integration tests and benches to drive the session engine

pub mod bus;
pub mod checkpoint;
pub mod clock;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod runtime;
pub mod session;
pub mod simulator;
pub mod tick;

// Re-export commonly used types for convenience
pub use models::*;
pub use bus::{BusEvent, Command, EventBus, Measurement, Outbox, Store, Subscriber, TimerCommand};
pub use controller::{AdaptivePowerController, PowerMatcherConfig};
pub use engine::Engine;
pub use session::{AutoPauseConfig, SessionConfig, SessionStateMachine};
pub use error::{PlanError, Result, TrainCtlError};
pub use logging::{LogConfig, LogFormat, LogLevel};
