//! One-second tick source
//!
//! Runs as its own tokio task. The session controls it over a command
//! channel and receives ticks over a bounded channel; nothing else is shared.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bus::TimerCommand;
use crate::error::{Result, TrainCtlError};

/// A single elapsed period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick;

const TICK_BUFFER: usize = 16;

pub struct TickSource {
    control: mpsc::UnboundedSender<TimerCommand>,
    task: JoinHandle<()>,
}

impl TickSource {
    /// Spawn the tick task in the stopped state. Must be called within a
    /// tokio runtime.
    pub fn spawn(period: Duration) -> (Self, mpsc::Receiver<Tick>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER);
        let task = tokio::spawn(run(period, control_rx, tick_tx));

        (
            Self {
                control: control_tx,
                task,
            },
            tick_rx,
        )
    }

    pub fn send(&self, command: TimerCommand) -> Result<()> {
        self.control
            .send(command)
            .map_err(|_| TrainCtlError::Channel {
                channel: "tick control".to_string(),
            })
    }

    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn run(
    period: Duration,
    mut control: mpsc::UnboundedReceiver<TimerCommand>,
    ticks: mpsc::Sender<Tick>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut running = false;

    loop {
        tokio::select! {
            command = control.recv() => match command {
                Some(TimerCommand::Start) => {
                    if !running {
                        // first tick one full period after starting
                        interval.reset();
                        running = true;
                        tracing::debug!(?period, "Tick source started");
                    }
                }
                Some(TimerCommand::Pause) | Some(TimerCommand::Stop) => {
                    if running {
                        running = false;
                        tracing::debug!(?command, "Tick source halted");
                    }
                }
                None => break,
            },
            _ = interval.tick(), if running => {
                if ticks.send(Tick).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!("Tick source exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Instant};

    #[tokio::test(start_paused = true)]
    async fn test_ticks_once_per_period_while_running() {
        let (source, mut ticks) = TickSource::spawn(Duration::from_secs(1));
        let started = Instant::now();
        source.send(TimerCommand::Start).unwrap();

        for _ in 0..3 {
            assert_eq!(ticks.recv().await, Some(Tick));
        }

        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_ticks_before_start_or_after_pause() {
        let (source, mut ticks) = TickSource::spawn(Duration::from_secs(1));

        assert!(timeout(Duration::from_secs(5), ticks.recv()).await.is_err());

        source.send(TimerCommand::Start).unwrap();
        assert_eq!(ticks.recv().await, Some(Tick));

        source.send(TimerCommand::Pause).unwrap();
        assert!(timeout(Duration::from_secs(5), ticks.recv()).await.is_err());

        source.send(TimerCommand::Start).unwrap();
        let resumed = Instant::now();
        assert_eq!(ticks.recv().await, Some(Tick));
        assert!(resumed.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_start_does_not_double_rate() {
        let (source, mut ticks) = TickSource::spawn(Duration::from_secs(1));
        source.send(TimerCommand::Start).unwrap();
        assert_eq!(ticks.recv().await, Some(Tick));

        let before = Instant::now();
        source.send(TimerCommand::Start).unwrap();
        assert_eq!(ticks.recv().await, Some(Tick));
        assert!(before.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test]
    async fn test_dropping_control_ends_task() {
        let (source, _ticks) = TickSource::spawn(Duration::from_millis(10));
        let TickSource { control, task } = source;
        drop(control);

        assert!(timeout(Duration::from_secs(1), task).await.is_ok());
    }
}
