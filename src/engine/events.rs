//! Typed engine event channel.
//!
//! Zero-or-more subscribers receive state snapshots and lifecycle
//! transitions over a broadcast channel. This is the engine's only
//! observability contract; `tracing` output is diagnostic, not contractual.

use crate::engine::metrics::MetricsSnapshot;
use tokio::sync::broadcast;

/// Capacity before slow subscribers start lagging. A lagged subscriber
/// loses old events, never blocks the engine.
const EVENT_CAPACITY: usize = 64;

/// Events published by a [`TaskEngine`](crate::engine::TaskEngine).
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Periodic metrics snapshot from the sampler
    Metrics(MetricsSnapshot),
    /// New dispatch was suspended
    Paused,
    /// Dispatch resumed
    Resumed,
    /// Queued tasks were discarded; carries how many
    QueueCleared(usize),
    /// The engine finished draining and stopped
    Shutdown,
    /// A task exhausted retries or failed permanently
    Error(String),
}

/// Broadcast fan-out for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}
