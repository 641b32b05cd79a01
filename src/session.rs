//! Session state machine
//!
//! Drives two independent lifecycles from a one-second tick:
//! - the run status of the session timer (stopped, started, paused)
//! - the status of the structured workout (stopped, started, done)
//!
//! While a workout is running every tick counts the current step down; when
//! a step runs out the machine advances to the next step, then the next
//! interval, and finally marks the workout done. Each step change pushes the
//! step's targets to the device path. Independently of the workout, every
//! elapsed second is recorded and grouped into laps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::bus::{BusEvent, Command, Measurement, Outbox, Store, Subscriber, TimerCommand};
use crate::checkpoint::{Checkpoint, NoCheckpoint};
use crate::clock::{Clock, SystemClock};
use crate::models::{
    to_absolute_power, ControlMode, Event, EventType, Lap, Position, Record, RunStatus,
    SpeedSource, Step, TimerState, WorkoutPlan, WorkoutStatus,
};

/// Session timing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Emit a countdown cue when the interval has this many seconds left
    pub countdown_at: u32,

    /// Checkpoint the record log every this many elapsed seconds (0 disables)
    pub checkpoint_every: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            countdown_at: 4,
            checkpoint_every: 60,
        }
    }
}

/// Auto-pause detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPauseConfig {
    /// Initial state of the auto-pause switch
    pub enabled: bool,

    /// Consecutive zero-power seconds before pausing
    pub zero_readings: u32,

    /// Power (watts) above which an auto-paused session resumes
    pub resume_watts: u16,
}

impl Default for AutoPauseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            zero_readings: 4,
            resume_watts: 40,
        }
    }
}

/// How the current step is advanced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StepMode {
    /// The tick counts the step down and advances it at zero
    #[default]
    Duration,
    /// The step has no duration and is only left through an explicit lap
    Distance,
}

impl StepMode {
    fn for_step(step: &Step) -> Self {
        if step.duration.is_some() {
            StepMode::Duration
        } else {
            StepMode::Distance
        }
    }
}

pub struct SessionStateMachine {
    config: SessionConfig,
    auto_pause: AutoPauseConfig,
    clock: Arc<dyn Clock>,
    checkpoint: Box<dyn Checkpoint>,

    plan: Option<WorkoutPlan>,
    run_status: RunStatus,
    workout_status: WorkoutStatus,
    timer: TimerState,
    position: Position,
    step_mode: StepMode,
    interval_duration: u32,
    step_duration: u32,

    zero_power_count: u32,
    auto_paused: bool,

    records: Vec<Record>,
    lap_records: Vec<Record>,
    laps: Vec<Lap>,
    events: Vec<Event>,
    lap_start: Option<DateTime<Utc>>,
}

impl SessionStateMachine {
    pub fn new(config: SessionConfig, auto_pause: AutoPauseConfig) -> Self {
        Self {
            config,
            auto_pause,
            clock: Arc::new(SystemClock),
            checkpoint: Box::new(NoCheckpoint),
            plan: None,
            run_status: RunStatus::Stopped,
            workout_status: WorkoutStatus::Stopped,
            timer: TimerState::default(),
            position: Position::default(),
            step_mode: StepMode::Duration,
            interval_duration: 0,
            step_duration: 0,
            zero_power_count: 0,
            auto_paused: false,
            records: Vec::new(),
            lap_records: Vec::new(),
            laps: Vec::new(),
            events: Vec::new(),
            lap_start: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: Box<dyn Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn run_status(&self) -> RunStatus {
        self.run_status
    }

    pub fn workout_status(&self) -> WorkoutStatus {
        self.workout_status
    }

    pub fn timer(&self) -> TimerState {
        self.timer
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    pub fn interval_duration(&self) -> u32 {
        self.interval_duration
    }

    pub fn step_duration(&self) -> u32 {
        self.step_duration
    }

    pub fn is_auto_paused(&self) -> bool {
        self.auto_paused
    }

    pub fn plan(&self) -> Option<&WorkoutPlan> {
        self.plan.as_ref()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn laps(&self) -> &[Lap] {
        &self.laps
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Accept a new plan. A plan cannot be swapped under a running workout.
    pub fn load_plan(&mut self, plan: WorkoutPlan, out: &mut Outbox) {
        if self.workout_status == WorkoutStatus::Started {
            tracing::warn!("Ignoring workout plan received while a workout is running");
            return;
        }

        let plan = plan.sanitized();
        tracing::info!(
            name = plan.name.as_deref().unwrap_or("unnamed"),
            intervals = plan.intervals.len(),
            steps = plan.total_steps(),
            "Workout plan loaded"
        );
        self.plan = Some(plan);

        if self.workout_status == WorkoutStatus::Done {
            self.set_workout_status(WorkoutStatus::Stopped, out);
        }
    }

    /// Start the timer, or pause it when it is running without a workout
    pub fn start(&mut self, out: &mut Outbox) {
        if self.run_status == RunStatus::Started && self.workout_status != WorkoutStatus::Started {
            self.pause(out);
            return;
        }

        out.publish(BusEvent::TimerControl(TimerCommand::Start));
        self.set_run_status(RunStatus::Started, out);
        self.log_event(EventType::Start, out);
    }

    pub fn resume(&mut self, out: &mut Outbox) {
        if self.run_status == RunStatus::Started {
            return;
        }

        out.publish(BusEvent::TimerControl(TimerCommand::Start));
        self.set_run_status(RunStatus::Started, out);
        self.log_event(EventType::Start, out);
        self.auto_paused = false;
    }

    pub fn pause(&mut self, out: &mut Outbox) {
        if self.run_status != RunStatus::Started {
            tracing::debug!(status = ?self.run_status, "Pause ignored, timer not running");
            return;
        }

        out.publish(BusEvent::TimerControl(TimerCommand::Pause));
        self.set_run_status(RunStatus::Paused, out);
        self.log_event(EventType::Stop, out);
    }

    pub fn stop(&mut self, store: &Store, out: &mut Outbox) {
        if self.run_status == RunStatus::Stopped {
            return;
        }

        out.publish(BusEvent::TimerControl(TimerCommand::Stop));
        self.set_run_status(RunStatus::Stopped, out);
        self.log_event(EventType::Stop, out);

        if self.workout_status == WorkoutStatus::Started {
            self.set_workout_status(WorkoutStatus::Stopped, out);
        }

        self.lap(store, out);

        if self.plan.is_some() {
            self.reset_position(store, out);
        }

        self.timer.elapsed = 0;
        self.publish_elapsed(store, out);
        self.timer.lap_time = 0;
        out.publish(BusEvent::LapTime(0));
    }

    pub fn start_workout(&mut self, store: &Store, out: &mut Outbox) {
        if matches!(
            self.workout_status,
            WorkoutStatus::Started | WorkoutStatus::Done
        ) {
            return;
        }

        let (interval_time, step_time, step_mode) = match self.plan.as_ref() {
            Some(plan) if !plan.is_empty() => {
                let interval = &plan.intervals[0];
                let step = &interval.steps[0];
                (
                    interval.duration.unwrap_or(0),
                    step.duration.unwrap_or(0),
                    StepMode::for_step(step),
                )
            }
            _ => {
                tracing::debug!("Workout start ignored, no plan loaded");
                return;
            }
        };

        self.reset_position(store, out);
        self.set_workout_status(WorkoutStatus::Started, out);

        self.interval_duration = interval_time;
        self.step_duration = step_time;
        self.step_mode = step_mode;
        self.timer.lap_time = interval_time;
        self.timer.step_time = step_time;
        out.publish(BusEvent::IntervalDuration(interval_time));
        out.publish(BusEvent::StepDuration(step_time));
        out.publish(BusEvent::LapTime(interval_time));
        out.publish(BusEvent::StepTime(step_time));

        if self.run_status != RunStatus::Started {
            self.start(out);
        }
    }

    /// Bring a reloaded session back into a safe, non-ticking state
    pub fn restore_workout(&mut self, out: &mut Outbox) {
        if self.workout_status == WorkoutStatus::Started {
            out.publish(BusEvent::WorkoutStatus(WorkoutStatus::Started));
        }
        if self.run_status == RunStatus::Started {
            self.pause(out);
        }
    }

    pub fn on_tick(&mut self, store: &Store, out: &mut Outbox) {
        // ticks queued before a pause or stop can still arrive
        if self.run_status != RunStatus::Started {
            tracing::trace!(status = ?self.run_status, "Dropping tick, timer not running");
            return;
        }

        let workout_running = self.workout_status == WorkoutStatus::Started;

        // an interval without a duration has nothing to count down from, so
        // its lap time counts up from 0
        let lap_counts_down = self.interval_duration > 0;

        self.timer.elapsed += 1;
        if workout_running && self.timer.step_time != 0 {
            self.timer.step_time -= 1;
            if lap_counts_down {
                self.timer.lap_time = self.timer.lap_time.saturating_sub(1);
            } else {
                self.timer.lap_time += 1;
            }
        } else {
            self.timer.lap_time += 1;
        }

        if lap_counts_down
            && self.timer.lap_time == self.config.countdown_at
            && self.timer.step_time > 0
        {
            out.publish(BusEvent::Countdown);
        }

        self.publish_elapsed(store, out);
        out.publish(BusEvent::LapTime(self.timer.lap_time));
        out.publish(BusEvent::StepTime(self.timer.step_time));

        if workout_running && self.timer.step_time == 0 && self.step_mode == StepMode::Duration {
            self.step(store, out);
        }
    }

    /// Advance to the next step, the next interval, or finish the workout
    pub fn step(&mut self, store: &Store, out: &mut Outbox) {
        let position = self.position;
        let (has_next_step, has_next_interval) = match self.plan.as_ref() {
            Some(plan) => (
                plan.has_next_step(position),
                plan.has_next_interval(position),
            ),
            None => return,
        };

        if has_next_step {
            self.next_step(Position::new(position.interval, position.step + 1), store, out);
        } else if has_next_interval {
            self.next_interval(position.interval + 1, store, out);
        } else {
            self.set_workout_status(WorkoutStatus::Done, out);
            self.finish_workout(store, out);
        }
    }

    /// Explicit lap: skip to the next interval during a workout, otherwise
    /// close the current lap
    pub fn lap(&mut self, store: &Store, out: &mut Outbox) {
        if self.workout_status == WorkoutStatus::Started {
            let has_next = self
                .plan
                .as_ref()
                .map(|plan| plan.has_next_interval(self.position))
                .unwrap_or(false);

            if has_next {
                self.next_interval(self.position.interval + 1, store, out);
            } else {
                self.set_workout_status(WorkoutStatus::Done, out);
                self.finish_workout(store, out);
            }
        } else {
            self.lap_boundary(store, out);
            self.timer.lap_time = 0;
            out.publish(BusEvent::LapTime(0));
        }
    }

    fn on_command(&mut self, command: Command, store: &Store, out: &mut Outbox) {
        tracing::debug!(?command, "Session command");
        match command {
            Command::WorkoutStart => self.start_workout(store, out),
            Command::WorkoutRestore => self.restore_workout(out),
            Command::WatchStart => self.start(out),
            Command::WatchPause => self.pause(out),
            Command::WatchResume => self.resume(out),
            Command::WatchStop => self.stop(store, out),
            Command::WatchLap => self.lap(store, out),
        }
    }

    /// Auto-pause on sustained zero power, auto-resume when pedaling again
    fn on_power_1s(&mut self, power: u16, store: &Store, out: &mut Outbox) {
        if !store.sources.auto_pause {
            return;
        }

        if power == 0 && self.run_status == RunStatus::Started {
            self.zero_power_count += 1;
        } else {
            self.zero_power_count = 0;
        }

        if self.zero_power_count >= self.auto_pause.zero_readings {
            self.zero_power_count = 0;
            tracing::info!("Auto-pausing session after sustained zero power");
            self.pause(out);
            self.auto_paused = true;
        }

        if power > self.auto_pause.resume_watts && self.auto_paused {
            tracing::info!(power, "Auto-resuming session");
            self.resume(out);
        }
    }

    fn next_interval(&mut self, interval: usize, store: &Store, out: &mut Outbox) {
        let duration = self
            .plan
            .as_ref()
            .and_then(|plan| plan.interval(interval))
            .and_then(|i| i.duration)
            .unwrap_or(0);

        self.interval_duration = duration;
        self.timer.lap_time = duration;
        self.position.interval = interval;
        out.publish(BusEvent::IntervalDuration(duration));
        out.publish(BusEvent::LapTime(duration));
        out.publish(BusEvent::IntervalIndex(interval));
        self.lap_boundary(store, out);

        self.next_step(Position::new(interval, 0), store, out);
    }

    fn next_step(&mut self, position: Position, store: &Store, out: &mut Outbox) {
        let Some(step) = self.plan.as_ref().and_then(|plan| plan.step(position)) else {
            return;
        };
        let duration = step.duration.unwrap_or(0);
        self.step_mode = StepMode::for_step(step);

        self.step_duration = duration;
        self.timer.step_time = duration;
        self.position = position;
        out.publish(BusEvent::StepDuration(duration));
        out.publish(BusEvent::StepTime(duration));
        out.publish(BusEvent::StepIndex(position.step));
        self.propagate_targets(store, out);
        out.publish(BusEvent::StepBoundary);

        tracing::debug!(
            interval = position.interval,
            step = position.step,
            duration,
            "Advanced to next step"
        );
    }

    fn reset_position(&mut self, store: &Store, out: &mut Outbox) {
        self.position = Position::default();
        out.publish(BusEvent::IntervalIndex(0));
        out.publish(BusEvent::StepIndex(0));
        self.propagate_targets(store, out);
    }

    /// Push the current step's targets to the device path.
    ///
    /// A slope selects simulation mode and wins over a power target; cadence
    /// and power are always published so stale targets get cleared.
    fn propagate_targets(&self, store: &Store, out: &mut Outbox) {
        let Some(step) = self.plan.as_ref().and_then(|plan| plan.step(self.position)) else {
            return;
        };

        if let Some(slope) = step.slope {
            out.publish(BusEvent::SlopeTargetSet(slope));
            if store.mode != ControlMode::Simulation {
                out.publish(BusEvent::ModeSet(ControlMode::Simulation));
            }
        }

        if let Some(distance) = step.distance {
            out.publish(BusEvent::DistanceTargetSet(distance));
        }

        out.publish(BusEvent::CadenceTargetSet(step.cadence.unwrap_or(0)));

        match step.power {
            Some(relative) => {
                out.publish(BusEvent::PowerTargetSet(to_absolute_power(
                    relative, store.ftp,
                )));
                if step.slope.is_none() && store.mode != ControlMode::TargetPower {
                    out.publish(BusEvent::ModeSet(ControlMode::TargetPower));
                }
            }
            None => out.publish(BusEvent::PowerTargetSet(0)),
        }
    }

    fn finish_workout(&mut self, store: &Store, out: &mut Outbox) {
        self.lap_boundary(store, out);
        out.publish(BusEvent::SlopeTargetSet(0.0));
        out.publish(BusEvent::ModeSet(ControlMode::Simulation));
        tracing::info!(
            elapsed = self.timer.elapsed,
            laps = self.laps.len(),
            "Workout done"
        );
    }

    fn set_run_status(&mut self, status: RunStatus, out: &mut Outbox) {
        if status == RunStatus::Started && self.lap_start.is_none() {
            self.lap_start = Some(self.clock.now());
        }
        tracing::info!(from = ?self.run_status, to = ?status, "Timer status changed");
        self.run_status = status;
        out.publish(BusEvent::WatchStatus(status));
    }

    fn set_workout_status(&mut self, status: WorkoutStatus, out: &mut Outbox) {
        tracing::info!(from = ?self.workout_status, to = ?status, "Workout status changed");
        self.workout_status = status;
        out.publish(BusEvent::WorkoutStatus(status));
    }

    /// Append a start/stop marker unless it repeats the previous one
    fn log_event(&mut self, kind: EventType, out: &mut Outbox) {
        if self.events.last().map(|e| e.kind) == Some(kind) {
            return;
        }

        let event = Event {
            timestamp: self.clock.now(),
            kind,
        };
        self.events.push(event.clone());
        out.publish(BusEvent::EventAppended(event));
    }

    fn publish_elapsed(&mut self, store: &Store, out: &mut Outbox) {
        out.publish(BusEvent::Elapsed(self.timer.elapsed));

        if self.run_status == RunStatus::Stopped {
            return;
        }

        let record = self.snapshot(store);
        self.records.push(record.clone());
        self.lap_records.push(record.clone());
        out.publish(BusEvent::RecordAppended(record));

        let every = self.config.checkpoint_every;
        if every > 0 && self.timer.elapsed % every == 0 {
            tracing::debug!(records = self.records.len(), "Checkpointing session records");
            self.checkpoint.backup(&self.records);
        }
    }

    fn snapshot(&self, store: &Store) -> Record {
        let speed = match store.sources.speed_source {
            SpeedSource::Sensor => store.speed,
            SpeedSource::Virtual => store.speed_virtual,
        };

        Record {
            timestamp: self.clock.now(),
            power: store.power_1s,
            cadence: store.cadence,
            speed,
            heart_rate: store.heart_rate,
            distance: store.distance,
            grade: store.slope_target,
            altitude: store.altitude,
            position_lat: store.position_lat,
            position_long: store.position_long,
            saturated_hemoglobin_percent: store.smo2,
            total_hemoglobin_conc: store.thb,
            core_temperature: store.core_temperature,
            skin_temperature: store.skin_temperature,
            device_index: 0,
        }
    }

    /// Close the lap that started at the previous boundary
    fn lap_boundary(&mut self, store: &Store, out: &mut Outbox) {
        out.publish(BusEvent::LapBoundary);

        let end = self.clock.now();
        let start = self.lap_start.unwrap_or(end);
        let elapsed = (end - start).num_seconds();

        // whole seconds only: a boundary less than a second after the last
        // one closes no lap
        if elapsed > 0 {
            let lap = Lap::summarize(
                &self.lap_records,
                start,
                end,
                elapsed as u32,
                store.power_lap,
            );
            tracing::info!(
                lap = self.laps.len() + 1,
                seconds = elapsed,
                records = self.lap_records.len(),
                "Lap recorded"
            );
            self.laps.push(lap.clone());
            self.lap_records.clear();
            out.publish(BusEvent::LapAppended(lap));
        }

        self.lap_start = Some(end);
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new(SessionConfig::default(), AutoPauseConfig::default())
    }
}

impl Subscriber for SessionStateMachine {
    fn handle(&mut self, event: &BusEvent, store: &Store, out: &mut Outbox) {
        match event {
            BusEvent::Tick => self.on_tick(store, out),
            BusEvent::Command(command) => self.on_command(*command, store, out),
            BusEvent::WorkoutLoaded(plan) => self.load_plan(plan.clone(), out),
            BusEvent::Measurement(Measurement::Power1s(power)) => {
                self.on_power_1s(*power, store, out)
            }
            _ => {}
        }
    }
}
