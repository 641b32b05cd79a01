//! Async session runtime
//!
//! The runtime owns the bus and is its only consumer. Ticks and inbound
//! events are taken one at a time and each cascade runs to completion before
//! the next input is accepted. Delivered events are broadcast to observers
//! outside the engine (display, device path); timer commands are forwarded
//! to the tick source.

use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::bus::{BusEvent, Command, EventBus, Subscriber, TimerCommand};
use crate::error::{Result, TrainCtlError};
use crate::tick::{Tick, TickSource};

const EVENT_BUFFER: usize = 1024;

/// Cloneable entry point for feeding a running session
#[derive(Clone)]
pub struct SessionHandle {
    inbound: mpsc::UnboundedSender<BusEvent>,
    events: broadcast::Sender<BusEvent>,
}

impl SessionHandle {
    pub fn publish(&self, event: BusEvent) -> Result<()> {
        self.inbound
            .send(event)
            .map_err(|_| TrainCtlError::Channel {
                channel: "session inbound".to_string(),
            })
    }

    pub fn command(&self, command: Command) -> Result<()> {
        self.publish(BusEvent::Command(command))
    }

    /// Receive every event the bus delivers from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}

pub struct SessionRuntime<C: Subscriber> {
    bus: EventBus<C>,
    tick_source: TickSource,
    ticks: mpsc::Receiver<Tick>,
    inbound: mpsc::UnboundedReceiver<BusEvent>,
    events: broadcast::Sender<BusEvent>,
}

impl<C: Subscriber> SessionRuntime<C> {
    /// Must be called within a tokio runtime: spawns the tick source.
    pub fn new(bus: EventBus<C>, tick_period: Duration) -> (Self, SessionHandle) {
        let (tick_source, ticks) = TickSource::spawn(tick_period);
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let handle = SessionHandle {
            inbound: inbound_tx,
            events: events.clone(),
        };

        (
            Self {
                bus,
                tick_source,
                ticks,
                inbound,
                events,
            },
            handle,
        )
    }

    /// Run until every [`SessionHandle`] is dropped, then hand back the bus.
    pub async fn run(mut self) -> Result<EventBus<C>> {
        tracing::info!("Session runtime started");

        loop {
            tokio::select! {
                biased;

                event = self.inbound.recv() => match event {
                    Some(event) => self.process(event)?,
                    None => break,
                },
                tick = self.ticks.recv() => match tick {
                    Some(Tick) => self.process(BusEvent::Tick)?,
                    None => {
                        tracing::error!("Tick source stopped unexpectedly");
                        return Err(TrainCtlError::Channel {
                            channel: "ticks".to_string(),
                        });
                    }
                },
            }
        }

        self.tick_source.shutdown();
        tracing::info!("Session runtime stopped");
        Ok(self.bus)
    }

    fn process(&mut self, event: BusEvent) -> Result<()> {
        for delivered in self.bus.dispatch(event) {
            if let BusEvent::TimerControl(command) = delivered {
                self.tick_source.send(command)?;
                if command != TimerCommand::Start {
                    self.discard_pending_ticks();
                }
            }
            // no subscribers is fine
            let _ = self.events.send(delivered);
        }
        Ok(())
    }

    fn discard_pending_ticks(&mut self) {
        let mut dropped = 0;
        while let Ok(Tick) = self.ticks.try_recv() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded ticks queued before the timer halted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Store;
    use crate::engine::Engine;
    use crate::models::{RunStatus, WorkoutStatus};

    #[tokio::test(start_paused = true)]
    async fn test_runtime_ticks_after_start() {
        let bus = EventBus::new(Store::new(200), Engine::default());
        let (runtime, handle) = SessionRuntime::new(bus, Duration::from_secs(1));
        let mut events = handle.subscribe();
        let task = tokio::spawn(runtime.run());

        handle.command(Command::WatchStart).unwrap();

        let mut elapsed = Vec::new();
        while elapsed.len() < 3 {
            if let BusEvent::Elapsed(e) = events.recv().await.unwrap() {
                elapsed.push(e);
            }
        }
        assert_eq!(elapsed, vec![1, 2, 3]);

        handle.command(Command::WatchStop).unwrap();
        drop(events);
        drop(handle);

        let bus = task.await.unwrap().unwrap();
        assert_eq!(bus.store().watch_status, RunStatus::Stopped);
        assert_eq!(bus.store().workout_status, WorkoutStatus::Stopped);
        assert_eq!(bus.store().elapsed, 0);
        assert_eq!(bus.core().session.records().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_elapsed_after_pause() {
        let bus = EventBus::new(Store::new(200), Engine::default());
        let (runtime, handle) = SessionRuntime::new(bus, Duration::from_millis(1));
        let mut events = handle.subscribe();
        let task = tokio::spawn(runtime.run());

        handle.command(Command::WatchStart).unwrap();
        loop {
            if let BusEvent::Elapsed(5) = events.recv().await.unwrap() {
                break;
            }
        }
        handle.command(Command::WatchPause).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(handle);

        let mut paused = false;
        while let Ok(event) = events.recv().await {
            match event {
                BusEvent::WatchStatus(RunStatus::Paused) => paused = true,
                BusEvent::Elapsed(e) => assert!(!paused, "elapsed {} after pause", e),
                _ => {}
            }
        }
        assert!(paused);

        let bus = task.await.unwrap().unwrap();
        assert_eq!(bus.store().watch_status, RunStatus::Paused);
        assert_eq!(
            bus.core().session.records().len() as u32,
            bus.store().elapsed
        );
    }
}
