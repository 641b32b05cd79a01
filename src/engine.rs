//! Session engine: the state machine and the power matcher behind one subscriber

use std::sync::Arc;

use crate::bus::{BusEvent, EventBus, Outbox, Store, Subscriber};
use crate::checkpoint::Checkpoint;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::controller::AdaptivePowerController;
use crate::session::SessionStateMachine;

/// Core subscriber of the bus. The session sees every event before the
/// controller so target changes reach the controller in plan order.
pub struct Engine {
    pub session: SessionStateMachine,
    pub controller: AdaptivePowerController,
}

impl Engine {
    pub fn new(session: SessionStateMachine, controller: AdaptivePowerController) -> Self {
        Self {
            session,
            controller,
        }
    }

    pub fn from_config(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        checkpoint: Box<dyn Checkpoint>,
    ) -> Self {
        let session = SessionStateMachine::new(config.session.timer(), config.auto_pause.clone())
            .with_clock(clock)
            .with_checkpoint(checkpoint);
        let controller = AdaptivePowerController::new(config.power_matcher.clone());
        Self::new(session, controller)
    }

    /// Build a bus seeded with the configured FTP and data sources
    pub fn into_bus(self, config: &AppConfig) -> EventBus<Engine> {
        let mut store = Store::new(config.athlete.ftp);
        store.sources = config.data_sources();
        EventBus::new(store, self)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(
            SessionStateMachine::default(),
            AdaptivePowerController::default(),
        )
    }
}

impl Subscriber for Engine {
    fn handle(&mut self, event: &BusEvent, store: &Store, out: &mut Outbox) {
        self.session.handle(event, store, out);
        self.controller.handle(event, store, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Command;
    use crate::checkpoint::NoCheckpoint;
    use crate::clock::SystemClock;
    use crate::models::{Interval, RunStatus, Step, WorkoutPlan};

    #[test]
    fn test_plan_target_reaches_controller() {
        let mut config = AppConfig::default();
        config.athlete.ftp = 300;
        let engine = Engine::from_config(&config, Arc::new(SystemClock), Box::new(NoCheckpoint));
        let mut bus = engine.into_bus(&config);

        bus.dispatch(BusEvent::WorkoutLoaded(WorkoutPlan {
            name: None,
            intervals: vec![Interval {
                duration: Some(60),
                steps: vec![Step {
                    duration: Some(60),
                    power: Some(0.75),
                    ..Step::default()
                }],
            }],
        }));
        let delivered = bus.dispatch(BusEvent::Command(Command::WorkoutStart));

        let set = delivered
            .iter()
            .position(|e| *e == BusEvent::PowerTargetSet(225))
            .unwrap();
        let adjusted = delivered
            .iter()
            .position(|e| *e == BusEvent::AdjustedPowerTarget(215))
            .unwrap();
        assert!(set < adjusted);
        assert_eq!(bus.core().controller.nominal_target(), 225);
        assert_eq!(bus.store().adjusted_power_target, 215);
        assert_eq!(bus.store().watch_status, RunStatus::Started);
    }
}
