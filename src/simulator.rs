//! Simulated rider for running sessions without a trainer
//!
//! Follows the adjusted power instruction with a small positive bias and an
//! occasional dropout sample, which is what a real ERG trainer tends to do.
//! Seeded, so a given seed always produces the same ride.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::bus::{BusEvent, Measurement, Outbox, Store, Subscriber};
use crate::models::RunStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub seed: u64,

    /// Lowest overshoot of the instruction (watts)
    pub offset_low: u16,

    /// Highest overshoot of the instruction (watts)
    pub offset_high: u16,

    pub cadence: u16,
    pub resting_heart_rate: u16,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            offset_low: 2,
            offset_high: 11,
            cadence: 90,
            resting_heart_rate: 60,
        }
    }
}

pub struct PowerSimulator {
    config: SimulatorConfig,
    rng: StdRng,
    target: u16,
    heart_rate: f64,
    distance: f64,
    lap_sum: u64,
    lap_count: u64,
}

impl PowerSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            heart_rate: config.resting_heart_rate as f64,
            config,
            target: 0,
            distance: 0.0,
            lap_sum: 0,
            lap_count: 0,
        }
    }

    pub fn target(&self) -> u16 {
        self.target
    }

    /// Draw one power sample around the current instruction
    pub fn sample(&mut self) -> u16 {
        if self.target == 0 {
            return 0;
        }

        let bad = self.rng.gen_range(0..=self.target);
        if (bad as f64) < self.target as f64 / 50.0 {
            return bad;
        }

        let low = self.target.saturating_add(self.config.offset_low);
        let high = self
            .target
            .saturating_add(self.config.offset_high)
            .max(low);
        self.rng.gen_range(low..=high)
    }

    /// Emit one second worth of measurements
    fn ride_one_second(&mut self, out: &mut Outbox) {
        let power = self.sample();

        self.lap_sum += power as u64;
        self.lap_count += 1;
        let lap_avg = (self.lap_sum as f64 / self.lap_count as f64).round() as u16;

        // crude aero-only speed model, m/s
        let speed = (power as f64 / 0.25).cbrt();
        self.distance += speed;

        let steady_hr = self.config.resting_heart_rate as f64 + power as f64 * 0.4;
        self.heart_rate += (steady_hr - self.heart_rate) * 0.05;

        let cadence = if power == 0 { 0 } else { self.config.cadence };

        out.publish(BusEvent::Measurement(Measurement::Power(power)));
        out.publish(BusEvent::Measurement(Measurement::Power1s(power)));
        out.publish(BusEvent::Measurement(Measurement::PowerLap(lap_avg)));
        out.publish(BusEvent::Measurement(Measurement::Cadence(cadence)));
        out.publish(BusEvent::Measurement(Measurement::HeartRate(
            self.heart_rate.round() as u16,
        )));
        out.publish(BusEvent::Measurement(Measurement::SpeedVirtual(
            speed * 3.6,
        )));
        out.publish(BusEvent::Measurement(Measurement::Distance(self.distance)));
    }
}

impl Default for PowerSimulator {
    fn default() -> Self {
        Self::new(SimulatorConfig::default())
    }
}

impl Subscriber for PowerSimulator {
    fn handle(&mut self, event: &BusEvent, store: &Store, out: &mut Outbox) {
        match event {
            BusEvent::AdjustedPowerTarget(target) => self.target = *target,
            BusEvent::LapBoundary => {
                self.lap_sum = 0;
                self.lap_count = 0;
            }
            BusEvent::Elapsed(_) if store.watch_status == RunStatus::Started => {
                self.ride_one_second(out)
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_follow_target() {
        let mut sim = PowerSimulator::default();
        sim.target = 200;

        let samples: Vec<u16> = (0..500).map(|_| sim.sample()).collect();
        let normal = samples.iter().filter(|&&p| (202..=211).contains(&p)).count();
        let dropouts = samples.iter().filter(|&&p| p < 4).count();

        assert_eq!(normal + dropouts, samples.len());
        assert!(normal > 450);
    }

    #[test]
    fn test_same_seed_same_ride() {
        let mut a = PowerSimulator::default();
        let mut b = PowerSimulator::default();
        a.target = 180;
        b.target = 180;

        let ride_a: Vec<u16> = (0..50).map(|_| a.sample()).collect();
        let ride_b: Vec<u16> = (0..50).map(|_| b.sample()).collect();
        assert_eq!(ride_a, ride_b);
    }

    #[test]
    fn test_zero_target_is_silent() {
        let mut sim = PowerSimulator::default();
        assert_eq!(sim.sample(), 0);
    }

    #[test]
    fn test_rides_only_while_started() {
        let mut sim = PowerSimulator::default();
        let mut store = Store::default();
        let mut out = Outbox::default();

        sim.handle(&BusEvent::AdjustedPowerTarget(150), &store, &mut out);
        sim.handle(&BusEvent::Elapsed(1), &store, &mut out);
        assert!(out.is_empty());

        store.watch_status = RunStatus::Started;
        sim.handle(&BusEvent::Elapsed(2), &store, &mut out);
        let events: Vec<BusEvent> = out.drain().collect();
        assert_eq!(events.len(), 7);
        assert!(matches!(
            events[0],
            BusEvent::Measurement(Measurement::Power(_))
        ));
        assert_eq!(sim.target(), 150);
    }
}
