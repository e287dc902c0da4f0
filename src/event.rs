//! Event system for change queue lifecycle notifications

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Queue lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEvent {
    /// Event kind, one of [`events`]
    pub kind: String,

    /// Structured attributes (record counts, worker ids, errors)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,

    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl QueueEvent {
    /// Create an event without attributes
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Attach an attribute (builder pattern)
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }
}

/// Broadcasts [`QueueEvent`]s to any number of subscribers.
///
/// Emitting never blocks; with no subscribers the event is dropped, and a
/// subscriber that falls behind loses the oldest events.
#[derive(Clone)]
pub struct EventEmitter {
    sender: Arc<broadcast::Sender<QueueEvent>>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events accepted by `filter`
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&QueueEvent) -> bool + Send + Sync + 'static,
    ) -> EventStream {
        use tokio_stream::wrappers::BroadcastStream;
        use tokio_stream::StreamExt as TokioStreamExt;
        let stream = BroadcastStream::new(self.sender.subscribe())
            .filter_map(|r| r.ok())
            .filter(move |e| filter(e));
        EventStream {
            inner: Box::pin(stream),
        }
    }

    /// Subscribe to every event
    pub fn subscribe_stream(&self) -> EventStream {
        self.subscribe_filtered(|_| true)
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Stream of queue events, skipping any lost to lag
pub struct EventStream {
    inner: Pin<Box<dyn Stream<Item = QueueEvent> + Send>>,
}

impl Stream for EventStream {
    type Item = QueueEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl EventStream {
    /// Receive the next matching event
    pub async fn recv(&mut self) -> Option<QueueEvent> {
        use tokio_stream::StreamExt;
        self.next().await
    }
}

/// Event catalog
pub mod events {
    pub const SNAPSHOT_EMITTED: &str = "changes.snapshot.emitted";
    pub const DRAIN_TIMEOUT: &str = "changes.drain.timeout";
    pub const DRAIN_FAILED: &str = "changes.drain.failed";
    pub const WORKER_STARTED: &str = "changes.worker.started";
    pub const WORKER_LOST: &str = "changes.worker.lost";
    pub const QUEUE_SHUTDOWN: &str = "changes.queue.shutdown";
    pub const BUFFER_PRESSURE: &str = "changes.buffer.pressure";
    pub const BUFFER_RELIEVED: &str = "changes.buffer.relieved";
}
