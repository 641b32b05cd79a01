use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use trainctl::checkpoint::{Checkpoint, JsonCheckpoint, NoCheckpoint};
use trainctl::clock::{Clock, ScaledClock, SystemClock};
use trainctl::config::AppConfig;
use trainctl::logging::{init_logging, LogFormat, LogLevel};
use trainctl::runtime::SessionRuntime;
use trainctl::simulator::{PowerSimulator, SimulatorConfig};
use trainctl::{BusEvent, Command, Engine, Lap, TrainCtlError, WorkoutPlan, WorkoutStatus};

/// trainctl - Structured workout runner for smart trainers
///
/// Steps through a workout plan second by second, pushes targets to the
/// trainer and records the ride.
#[derive(Parser)]
#[command(name = "trainctl")]
#[command(version)]
#[command(about = "Structured workout runner", long_about = None)]
struct Cli {
    /// Sets a custom config file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity of output
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log level (error, warn, info, debug, trace), overrides the config file
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<LogLevel>,

    /// Log format (pretty, json, compact), overrides the config file
    #[arg(long, value_name = "FORMAT", global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ride a workout plan
    Run {
        /// Workout plan (JSON)
        #[arg(short, long)]
        plan: PathBuf,

        /// Override the configured FTP (watts)
        #[arg(long)]
        ftp: Option<u16>,

        /// Run the clock this many times faster than real time
        #[arg(long, default_value = "1")]
        speedup: u32,

        /// Do not attach the simulated rider
        #[arg(long)]
        no_simulate: bool,
    },

    /// Show or create the configuration file
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Write a default configuration file
        #[arg(short, long)]
        init: bool,
    },
}

#[derive(Tabled)]
struct LapRow {
    #[tabled(rename = "Lap")]
    number: usize,
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Avg W")]
    avg_power: u16,
    #[tabled(rename = "Max W")]
    max_power: u16,
    #[tabled(rename = "Cadence")]
    avg_cadence: u16,
    #[tabled(rename = "HR")]
    avg_heart_rate: u16,
}

impl LapRow {
    fn new(number: usize, lap: &Lap) -> Self {
        Self {
            number,
            time: format_seconds(lap.total_elapsed_time),
            avg_power: lap.avg_power,
            max_power: lap.max_power,
            avg_cadence: lap.avg_cadence,
            avg_heart_rate: lap.avg_heart_rate,
        }
    }
}

fn format_seconds(seconds: u32) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from_file(path),
        None => Ok(AppConfig::load_or_default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    config.logging.level = config.logging.level.raised_by(cli.verbose);
    init_logging(&config.logging)?;

    match cli.command {
        Commands::Run {
            plan,
            ftp,
            speedup,
            no_simulate,
        } => {
            if let Some(ftp) = ftp {
                config.athlete.ftp = ftp;
                config.validate()?;
            }
            run_session(config, plan, speedup, !no_simulate).await
        }

        Commands::Config { show, init } => {
            if init {
                let mut fresh = AppConfig::default();
                let path = match cli.config.clone() {
                    Some(path) => {
                        fresh.save_to_file(&path)?;
                        path
                    }
                    None => {
                        fresh.save_default()?;
                        AppConfig::default_config_path()
                    }
                };
                println!(
                    "{}",
                    format!("✓ Configuration written to {}", path.display()).green()
                );
            }
            if show || !init {
                let rendered = toml::to_string_pretty(&config)
                    .context("Failed to render configuration")?;
                println!("{}", rendered);
            }
            Ok(())
        }
    }
}

async fn run_session(
    config: AppConfig,
    plan_path: PathBuf,
    speedup: u32,
    simulate: bool,
) -> Result<()> {
    let plan = match WorkoutPlan::load_from_file(&plan_path) {
        Ok(plan) => plan,
        Err(e) => {
            e.log("Failed to load workout plan");
            anyhow::bail!(e.user_message());
        }
    };

    let speedup = speedup.max(1);
    let clock: Arc<dyn Clock> = if speedup > 1 {
        Arc::new(ScaledClock::new(speedup))
    } else {
        Arc::new(SystemClock)
    };
    let checkpoint: Box<dyn Checkpoint> = match &config.session.checkpoint_dir {
        Some(dir) => Box::new(JsonCheckpoint::new(dir, Uuid::new_v4())),
        None => Box::new(NoCheckpoint),
    };

    let mut bus = Engine::from_config(&config, clock, checkpoint).into_bus(&config);
    if simulate {
        bus.subscribe(Box::new(PowerSimulator::new(SimulatorConfig::default())));
    }

    let period = Duration::from_millis((config.session.tick_period_ms / speedup as u64).max(1));
    let (runtime, handle) = SessionRuntime::new(bus, period);
    let mut events = handle.subscribe();
    let task = tokio::spawn(runtime.run());

    println!(
        "{}",
        format!(
            "Riding {} ({} intervals, {}) at FTP {} W",
            plan.name.as_deref().unwrap_or("workout"),
            plan.intervals.len(),
            format_seconds(plan.total_duration()),
            config.athlete.ftp
        )
        .cyan()
        .bold()
    );

    handle.publish(BusEvent::Sources(config.data_sources()))?;
    handle.publish(BusEvent::WorkoutLoaded(plan))?;
    handle.command(Command::WorkoutStart)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if report(&event) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Display fell behind the session");
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut ctrl_c => {
                println!("{}", "Stopping session...".yellow());
                break;
            }
        }
    }

    handle.command(Command::WatchStop)?;
    drop(events);
    drop(handle);

    let bus = task
        .await
        .map_err(|e| TrainCtlError::Internal(format!("session runtime failed: {}", e)))
        .and_then(|result| result)
        .map_err(|e| {
            e.log("Session ended with an error");
            anyhow::anyhow!(e.user_message())
        })?;

    let session = &bus.core().session;
    let rows: Vec<LapRow> = session
        .laps()
        .iter()
        .enumerate()
        .map(|(i, lap)| LapRow::new(i + 1, lap))
        .collect();

    println!();
    if rows.is_empty() {
        println!("{}", "No laps recorded".dimmed());
    } else {
        println!("{}", Table::new(rows).with(Style::rounded()));
    }
    println!(
        "{}",
        format!(
            "✓ {} records, {} laps, {} events",
            session.records().len(),
            session.laps().len(),
            session.events().len()
        )
        .green()
    );

    Ok(())
}

/// Print progress for one delivered event. Returns true once the workout is done.
fn report(event: &BusEvent) -> bool {
    match event {
        BusEvent::IntervalIndex(i) => {
            println!("{}", format!("Interval {}", i + 1).blue().bold());
        }
        BusEvent::PowerTargetSet(w) if *w > 0 => {
            println!("  target {} W", w.to_string().bold());
        }
        BusEvent::SlopeTargetSet(s) => {
            println!("  slope {:.1}%", s);
        }
        BusEvent::Countdown => {
            println!("{}", "  ...".dimmed());
        }
        BusEvent::LapAppended(lap) => {
            println!(
                "{}",
                format!(
                    "  lap {} avg {} W max {} W",
                    format_seconds(lap.total_elapsed_time),
                    lap.avg_power,
                    lap.max_power
                )
                .magenta()
            );
        }
        BusEvent::WorkoutStatus(WorkoutStatus::Done) => {
            println!("{}", "Workout complete".green().bold());
            return true;
        }
        _ => {}
    }
    false
}
