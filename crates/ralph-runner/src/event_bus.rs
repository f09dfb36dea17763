//! Broadcast bus for loop events.
//!
//! Wraps `tokio::sync::broadcast` so the CLI renderer and any other
//! consumer each receive their own copy of every event. A consumer that
//! falls behind sees `RecvError::Lagged` and loses events; the loop is
//! never blocked by it.

use ralph_core::event::{EventKind, LogLevel, PipelineEvent};
use std::sync::Arc;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 4096;

/// Clone-friendly handle; all clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Emit to all current subscribers. Dropped silently when there are none.
    pub fn emit(&self, kind: EventKind) {
        let _ = self.tx.send(PipelineEvent::new(kind));
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(EventKind::EngineLog {
            level,
            message: message.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything already buffered for `rx`, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                tracing::warn!(missed = n, "event consumer lagged");
            }
            Err(_) => return events,
        }
    }
}
