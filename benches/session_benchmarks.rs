use chrono::{Duration, TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use trainctl::checkpoint::NoCheckpoint;
use trainctl::clock::ManualClock;
use trainctl::config::AppConfig;
use trainctl::simulator::PowerSimulator;
use trainctl::{
    AdaptivePowerController, BusEvent, Command, Engine, EventBus, Interval, Outbox, Step,
    WorkoutPlan,
};

/// Benchmarks for the per-second session cascade
///
/// A session handles one tick per second plus a handful of measurements, so
/// these mostly guard against accidental quadratic behaviour as the record
/// log grows over a long ride.

fn create_plan(intervals: usize) -> WorkoutPlan {
    WorkoutPlan {
        name: Some("Bench".to_string()),
        intervals: (0..intervals)
            .map(|i| Interval {
                duration: Some(120),
                steps: vec![
                    Step {
                        duration: Some(60),
                        power: Some(0.6 + (i % 5) as f64 * 0.1),
                        ..Step::default()
                    },
                    Step {
                        duration: Some(60),
                        slope: Some((i % 7) as f64),
                        ..Step::default()
                    },
                ],
            })
            .collect(),
    }
}

fn create_bus(clock: &ManualClock, simulate: bool) -> EventBus<Engine> {
    let config = AppConfig::default();
    let mut bus = Engine::from_config(&config, Arc::new(clock.clone()), Box::new(NoCheckpoint))
        .into_bus(&config);
    if simulate {
        bus.subscribe(Box::new(PowerSimulator::default()));
    }
    bus
}

fn bench_tick_cascade(c: &mut Criterion) {
    let mut group = c.benchmark_group("Tick Cascade");

    for &seconds in &[60u64, 600, 3600] {
        group.throughput(Throughput::Elements(seconds));
        group.bench_with_input(
            BenchmarkId::new("workout_with_simulator", seconds),
            &seconds,
            |b, &seconds| {
                b.iter(|| {
                    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap());
                    let mut bus = create_bus(&clock, true);
                    bus.dispatch(BusEvent::WorkoutLoaded(create_plan(30)));
                    bus.dispatch(BusEvent::Command(Command::WorkoutStart));
                    for _ in 0..seconds {
                        clock.advance(Duration::seconds(1));
                        black_box(bus.dispatch(BusEvent::Tick));
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_power_matcher(c: &mut Criterion) {
    let mut group = c.benchmark_group("Power Matcher");

    for &samples in &[100usize, 1000, 10000] {
        let stream: Vec<u16> = (0..samples).map(|i| 190 + (i % 23) as u16).collect();

        group.throughput(Throughput::Elements(samples as u64));
        group.bench_with_input(
            BenchmarkId::new("on_power", samples),
            &stream,
            |b, stream| {
                b.iter(|| {
                    let mut controller = AdaptivePowerController::default();
                    let mut out = Outbox::default();
                    controller.on_power_target(200, &mut out);
                    for &sample in stream {
                        black_box(controller.on_power(sample, &mut out));
                        out.drain();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_tick_cascade, bench_power_matcher);
criterion_main!(benches);
