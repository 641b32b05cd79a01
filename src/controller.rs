//! Adaptive power matching
//!
//! A trainer in target-power mode rarely delivers exactly the instructed
//! wattage: the realized output lags and jitters around it. The controller
//! watches measured power and nudges the instruction one step at a time so
//! that the realized average converges on the plan's nominal target.
//!
//! Two windows of samples are kept:
//! - a bounded recent window of `window` samples, cleared after every nudge
//! - an unbounded interval window covering everything since the nominal
//!   target changed
//!
//! A nudge only happens when both windows agree on the direction. A sample
//! below `dropout_threshold` of the nominal target is treated as a dropout
//! and discards both windows.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::bus::{BusEvent, Measurement, Outbox, Store, Subscriber};

/// Power matching policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerMatcherConfig {
    /// Offset applied when a new nominal target arrives (watts)
    pub initial_offset: i32,

    /// Number of samples evaluated per decision
    pub window: usize,

    /// Watts added or removed per nudge
    pub step: i32,

    /// Maximum distance of the instruction from the nominal target (watts)
    pub max_adjustment: i32,

    /// Fraction of the nominal target below which a sample is a dropout
    pub dropout_threshold: f64,
}

impl Default for PowerMatcherConfig {
    fn default() -> Self {
        Self {
            initial_offset: -10,
            window: 5,
            step: 1,
            max_adjustment: 25,
            dropout_threshold: 0.1,
        }
    }
}

/// Direction of a single adjustment decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Increase,
    Decrease,
    Hold,
}

/// Closed-loop power target adjuster
#[derive(Debug, Clone)]
pub struct AdaptivePowerController {
    config: PowerMatcherConfig,
    nominal_target: i32,
    adjusted_target: i32,
    recent: VecDeque<u16>,
    interval: Vec<u16>,
}

impl AdaptivePowerController {
    pub fn new(config: PowerMatcherConfig) -> Self {
        Self {
            recent: VecDeque::with_capacity(config.window + 1),
            config,
            nominal_target: 0,
            adjusted_target: 0,
            interval: Vec::new(),
        }
    }

    pub fn nominal_target(&self) -> i32 {
        self.nominal_target
    }

    /// The instruction currently in force. May be negative for a zero target.
    pub fn adjusted_target(&self) -> i32 {
        self.adjusted_target
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn interval_len(&self) -> usize {
        self.interval.len()
    }

    /// Value published to the device path; instructions are never negative
    pub fn instruction(&self) -> u16 {
        self.adjusted_target.clamp(0, u16::MAX as i32) as u16
    }

    /// A new nominal target: start slightly off and forget all history
    pub fn on_power_target(&mut self, target: u16, out: &mut Outbox) {
        tracing::debug!(target, "Power matcher received new target");
        self.nominal_target = target as i32;
        self.adjusted_target = self.nominal_target + self.config.initial_offset;
        self.recent.clear();
        self.interval.clear();
        self.publish(out);
    }

    /// Feed one measured power sample
    pub fn on_power(&mut self, sample: u16, out: &mut Outbox) -> Adjustment {
        let dropout = (self.nominal_target as f64 * self.config.dropout_threshold).round();
        if (sample as f64) < dropout {
            tracing::debug!(
                sample,
                dropout,
                "Power below dropout threshold, resetting history"
            );
            self.recent.clear();
            self.interval.clear();
            return Adjustment::Hold;
        }

        self.recent.push_back(sample);
        self.interval.push(sample);

        if self.recent.len() < self.config.window {
            return Adjustment::Hold;
        }
        while self.recent.len() > self.config.window {
            self.recent.pop_front();
        }

        let avg_recent = rounded_mean(self.recent.iter().copied());
        let avg_interval = rounded_mean(self.interval.iter().copied());
        let target = self.nominal_target;

        tracing::debug!(avg_recent, avg_interval, target, "Evaluating power window");

        let adjustment = if avg_interval > target && avg_recent >= target {
            Adjustment::Decrease
        } else if avg_interval < target && avg_recent <= target {
            Adjustment::Increase
        } else if avg_interval == target {
            if avg_recent > target {
                Adjustment::Decrease
            } else if avg_recent < target {
                Adjustment::Increase
            } else {
                Adjustment::Hold
            }
        } else {
            Adjustment::Hold
        };

        match adjustment {
            Adjustment::Increase => self.increase(out),
            Adjustment::Decrease => self.decrease(out),
            Adjustment::Hold => {}
        }
        adjustment
    }

    fn increase(&mut self, out: &mut Outbox) {
        let ceiling = self.nominal_target + self.config.max_adjustment;
        self.adjusted_target = (self.adjusted_target + self.config.step).min(ceiling);
        self.recent.clear();
        self.publish(out);
    }

    fn decrease(&mut self, out: &mut Outbox) {
        let floor = self.nominal_target - self.config.max_adjustment;
        self.adjusted_target = (self.adjusted_target - self.config.step).max(floor);
        self.recent.clear();
        self.publish(out);
    }

    fn publish(&self, out: &mut Outbox) {
        out.publish(BusEvent::AdjustedPowerTarget(self.instruction()));
    }
}

impl Default for AdaptivePowerController {
    fn default() -> Self {
        Self::new(PowerMatcherConfig::default())
    }
}

impl Subscriber for AdaptivePowerController {
    fn handle(&mut self, event: &BusEvent, _store: &Store, out: &mut Outbox) {
        match event {
            BusEvent::PowerTargetSet(target) => self.on_power_target(*target, out),
            BusEvent::Measurement(Measurement::Power(sample)) => {
                self.on_power(*sample, out);
            }
            _ => {}
        }
    }
}

fn rounded_mean(samples: impl Iterator<Item = u16>) -> i32 {
    let (sum, count) = samples.fold((0u64, 0u64), |(sum, n), s| (sum + s as u64, n + 1));
    if count == 0 {
        return 0;
    }
    (sum as f64 / count as f64).round() as i32
}
