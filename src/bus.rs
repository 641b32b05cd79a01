//! Typed event bus and shared store
//!
//! Every notification in the system is a [`BusEvent`]. The [`Store`] keeps the
//! latest value of each channel and is updated by the bus itself before any
//! subscriber sees the event. Subscribers never mutate the store: they react
//! to an event by pushing follow-up events into an [`Outbox`], which the bus
//! delivers after the current event (FIFO).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::models::{
    ControlMode, DataSources, Event, Lap, Position, Record, RunStatus, WorkoutPlan, WorkoutStatus,
};

/// Commands sent to the tick source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerCommand {
    Start,
    Pause,
    Stop,
}

/// Commands issued by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
    WorkoutStart,
    WorkoutRestore,
    WatchStart,
    WatchPause,
    WatchResume,
    WatchStop,
    WatchLap,
}

/// Live sensor channels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "value", rename_all = "snake_case")]
pub enum Measurement {
    /// Instantaneous power sample
    Power(u16),
    /// Power averaged over the last second
    Power1s(u16),
    /// Running average power of the current lap
    PowerLap(u16),
    Cadence(u16),
    Speed(f64),
    SpeedVirtual(f64),
    HeartRate(u16),
    Distance(f64),
    Altitude(f64),
    Position { lat: f64, long: f64 },
    SaturatedHemoglobin(f64),
    TotalHemoglobin(f64),
    CoreTemperature(f64),
    SkinTemperature(f64),
}

/// Every notification routed through the bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    // inbound
    Tick,
    WorkoutLoaded(WorkoutPlan),
    Measurement(Measurement),
    Ftp(u16),
    Sources(DataSources),
    Command(Command),

    // outbound
    TimerControl(TimerCommand),
    WatchStatus(RunStatus),
    WorkoutStatus(WorkoutStatus),
    Elapsed(u32),
    LapTime(u32),
    StepTime(u32),
    IntervalDuration(u32),
    StepDuration(u32),
    IntervalIndex(usize),
    StepIndex(usize),
    PowerTargetSet(u16),
    SlopeTargetSet(f64),
    CadenceTargetSet(u16),
    DistanceTargetSet(f64),
    ModeSet(ControlMode),
    AdjustedPowerTarget(u16),
    Countdown,
    /// A step boundary was crossed
    StepBoundary,
    /// A lap boundary was crossed
    LapBoundary,
    RecordAppended(Record),
    LapAppended(Lap),
    EventAppended(Event),
}

/// Latest value of every channel
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Store {
    pub workout: Option<WorkoutPlan>,
    pub ftp: u16,
    pub mode: ControlMode,
    pub sources: DataSources,

    pub power: u16,
    pub power_1s: u16,
    pub power_lap: u16,
    pub cadence: u16,
    pub speed: f64,
    pub speed_virtual: f64,
    pub heart_rate: u16,
    pub distance: f64,
    pub altitude: Option<f64>,
    pub position_lat: Option<f64>,
    pub position_long: Option<f64>,
    pub smo2: Option<f64>,
    pub thb: Option<f64>,
    pub core_temperature: Option<f64>,
    pub skin_temperature: Option<f64>,

    pub watch_status: RunStatus,
    pub workout_status: WorkoutStatus,
    pub elapsed: u32,
    pub lap_time: u32,
    pub step_time: u32,
    pub interval_duration: u32,
    pub step_duration: u32,
    pub position: Position,
    pub power_target: u16,
    pub slope_target: f64,
    pub cadence_target: u16,
    pub distance_target: f64,
    pub adjusted_power_target: u16,
}

impl Store {
    pub fn new(ftp: u16) -> Self {
        Self {
            ftp,
            ..Self::default()
        }
    }

    /// Fold an event into the store
    pub fn apply(&mut self, event: &BusEvent) {
        match event {
            BusEvent::WorkoutLoaded(plan) => self.workout = Some(plan.clone()),
            BusEvent::Measurement(m) => self.apply_measurement(*m),
            BusEvent::Ftp(ftp) => self.ftp = *ftp,
            BusEvent::Sources(sources) => self.sources = *sources,
            BusEvent::WatchStatus(status) => self.watch_status = *status,
            BusEvent::WorkoutStatus(status) => self.workout_status = *status,
            BusEvent::Elapsed(v) => self.elapsed = *v,
            BusEvent::LapTime(v) => self.lap_time = *v,
            BusEvent::StepTime(v) => self.step_time = *v,
            BusEvent::IntervalDuration(v) => self.interval_duration = *v,
            BusEvent::StepDuration(v) => self.step_duration = *v,
            BusEvent::IntervalIndex(i) => self.position.interval = *i,
            BusEvent::StepIndex(i) => self.position.step = *i,
            BusEvent::PowerTargetSet(w) => self.power_target = *w,
            BusEvent::SlopeTargetSet(s) => self.slope_target = *s,
            BusEvent::CadenceTargetSet(c) => self.cadence_target = *c,
            BusEvent::DistanceTargetSet(d) => self.distance_target = *d,
            BusEvent::ModeSet(mode) => self.mode = *mode,
            BusEvent::AdjustedPowerTarget(w) => self.adjusted_power_target = *w,
            BusEvent::Tick
            | BusEvent::Command(_)
            | BusEvent::TimerControl(_)
            | BusEvent::Countdown
            | BusEvent::StepBoundary
            | BusEvent::LapBoundary
            | BusEvent::RecordAppended(_)
            | BusEvent::LapAppended(_)
            | BusEvent::EventAppended(_) => {}
        }
    }

    fn apply_measurement(&mut self, measurement: Measurement) {
        match measurement {
            Measurement::Power(w) => self.power = w,
            Measurement::Power1s(w) => self.power_1s = w,
            Measurement::PowerLap(w) => self.power_lap = w,
            Measurement::Cadence(c) => self.cadence = c,
            Measurement::Speed(s) => self.speed = s,
            Measurement::SpeedVirtual(s) => self.speed_virtual = s,
            Measurement::HeartRate(hr) => self.heart_rate = hr,
            Measurement::Distance(d) => self.distance = d,
            Measurement::Altitude(a) => self.altitude = Some(a),
            Measurement::Position { lat, long } => {
                self.position_lat = Some(lat);
                self.position_long = Some(long);
            }
            Measurement::SaturatedHemoglobin(v) => self.smo2 = Some(v),
            Measurement::TotalHemoglobin(v) => self.thb = Some(v),
            Measurement::CoreTemperature(v) => self.core_temperature = Some(v),
            Measurement::SkinTemperature(v) => self.skin_temperature = Some(v),
        }
    }
}

/// Follow-up publications produced while handling one event
#[derive(Debug, Default)]
pub struct Outbox {
    events: Vec<BusEvent>,
}

impl Outbox {
    pub fn publish(&mut self, event: BusEvent) {
        self.events.push(event);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, BusEvent> {
        self.events.drain(..)
    }
}

/// A component that reacts to bus events
pub trait Subscriber: Send {
    fn handle(&mut self, event: &BusEvent, store: &Store, out: &mut Outbox);
}

/// Ordered delivery of events: the store first, then the core component,
/// then any observers in registration order
pub struct EventBus<C: Subscriber> {
    store: Store,
    core: C,
    observers: Vec<Box<dyn Subscriber>>,
}

impl<C: Subscriber> EventBus<C> {
    pub fn new(store: Store, core: C) -> Self {
        Self {
            store,
            core,
            observers: Vec::new(),
        }
    }

    /// Register an observer. Delivery follows registration order.
    pub fn subscribe(&mut self, observer: Box<dyn Subscriber>) {
        self.observers.push(observer);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn core(&self) -> &C {
        &self.core
    }

    /// Publish an event and run its whole cascade.
    ///
    /// Returns every event delivered, in delivery order.
    pub fn dispatch(&mut self, event: BusEvent) -> Vec<BusEvent> {
        let mut delivered = Vec::new();
        let mut queue = VecDeque::from([event]);
        let mut out = Outbox::default();

        while let Some(event) = queue.pop_front() {
            self.store.apply(&event);
            self.core.handle(&event, &self.store, &mut out);
            for observer in self.observers.iter_mut() {
                observer.handle(&event, &self.store, &mut out);
            }
            queue.extend(out.drain());
            delivered.push(event);
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Subscriber for Echo {
        fn handle(&mut self, event: &BusEvent, store: &Store, out: &mut Outbox) {
            if let BusEvent::PowerTargetSet(w) = event {
                // the store already reflects the event being handled
                assert_eq!(store.power_target, *w);
                out.publish(BusEvent::AdjustedPowerTarget(w.saturating_sub(10)));
            }
        }
    }

    #[test]
    fn test_store_applies_measurements() {
        let mut store = Store::new(250);
        store.apply(&BusEvent::Measurement(Measurement::Power1s(180)));
        store.apply(&BusEvent::Measurement(Measurement::Position {
            lat: 46.5,
            long: 6.6,
        }));
        store.apply(&BusEvent::IntervalIndex(2));
        store.apply(&BusEvent::StepIndex(1));

        assert_eq!(store.ftp, 250);
        assert_eq!(store.power_1s, 180);
        assert_eq!(store.position_lat, Some(46.5));
        assert_eq!(store.position, Position::new(2, 1));
    }

    #[test]
    fn test_dispatch_delivers_follow_ups_in_order() {
        let mut bus = EventBus::new(Store::default(), Echo);

        let delivered = bus.dispatch(BusEvent::PowerTargetSet(200));

        assert_eq!(
            delivered,
            vec![
                BusEvent::PowerTargetSet(200),
                BusEvent::AdjustedPowerTarget(190)
            ]
        );
        assert_eq!(bus.store().adjusted_power_target, 190);
    }

    #[test]
    fn test_observers_follow_core() {
        struct Counter(std::sync::Arc<std::sync::atomic::AtomicUsize>);

        impl Subscriber for Counter {
            fn handle(&mut self, event: &BusEvent, _store: &Store, _out: &mut Outbox) {
                if matches!(event, BusEvent::AdjustedPowerTarget(_)) {
                    self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
        }

        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut bus = EventBus::new(Store::default(), Echo);
        bus.subscribe(Box::new(Counter(seen.clone())));

        bus.dispatch(BusEvent::PowerTargetSet(150));
        bus.dispatch(BusEvent::Tick);

        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_measurement_serde_shape() {
        let json = serde_json::to_string(&Measurement::HeartRate(150)).unwrap();
        assert_eq!(json, r#"{"channel":"heart_rate","value":150}"#);
    }
}
