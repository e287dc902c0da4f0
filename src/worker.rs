//! Single-owner worker for the coalescing buffer.
//!
//! One task owns the [`CoalescingBuffer`] and is the only code that ever
//! touches it. Producers and the drain consumer talk to it through a
//! control-aware [`Mailbox`]: pending control messages (drain, stats,
//! shutdown) are always served before the next queued enqueue.
//!
//! # Abandoned drains
//!
//! A drain requester may time out and drop its reply receiver. The worker
//! checks for that before taking the buffer, and if the reply still fails
//! after the take, puts the snapshot back. Either way no change is lost to a
//! late reply.

use crate::buffer::{CoalescingBuffer, MergeOutcome};
use crate::change::{ChangeKey, ChangeSnapshot, PendingChange};
use crate::mailbox::Mailbox;
use crate::message::{BufferStats, QueueMessage};
#[cfg(feature = "metrics")]
use crate::metrics::ChangeQueueMetrics;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Why a worker's event loop returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// A `Shutdown` message was processed
    Shutdown,
    /// Every sender was dropped
    Disconnected,
}

/// Worker owning one generation of the coalescing buffer
pub struct ChangeQueueWorker<K, P, W> {
    id: Uuid,
    buffer: CoalescingBuffer<K, P, W>,
    mailbox: Mailbox<QueueMessage<K, P, W>>,
    stats: BufferStats,
    #[cfg(feature = "metrics")]
    metrics: Option<ChangeQueueMetrics>,
}

impl<K, P, W> ChangeQueueWorker<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    /// Create a worker with an empty buffer
    pub fn new(mailbox: Mailbox<QueueMessage<K, P, W>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            buffer: CoalescingBuffer::new(),
            mailbox,
            stats: BufferStats::default(),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record enqueue and drain metrics (builder pattern)
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Option<ChangeQueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Identifier of this worker incarnation
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Run the event loop until shutdown or until every sender is gone.
    pub async fn run(mut self) -> WorkerExit {
        info!(worker_id = %self.id, "Change queue worker started");

        let exit = loop {
            match self.mailbox.recv().await {
                Some(QueueMessage::Shutdown) => break WorkerExit::Shutdown,
                Some(message) => self.handle(message).await,
                None => break WorkerExit::Disconnected,
            }
        };

        if !self.buffer.is_empty() {
            warn!(
                worker_id = %self.id,
                pending = self.buffer.len(),
                waiters = self.buffer.waiter_count(),
                "Dropping undrained changes on worker stop"
            );
        }
        info!(worker_id = %self.id, ?exit, "Change queue worker stopped");
        exit
    }

    /// Process a single message
    pub(crate) async fn handle(&mut self, message: QueueMessage<K, P, W>) {
        match message {
            QueueMessage::Enqueue(change) => self.enqueue(change).await,
            QueueMessage::Drain(reply) => self.drain(reply).await,
            QueueMessage::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            QueueMessage::Shutdown => {}
            #[cfg(test)]
            QueueMessage::Crash => panic!("change queue worker crash requested"),
        }
    }

    async fn enqueue(&mut self, change: PendingChange<K, P, W>) {
        let outcome = self.buffer.merge(change);
        self.stats.enqueued_total += 1;
        if outcome == MergeOutcome::Coalesced {
            self.stats.coalesced_total += 1;
        }
        trace!(worker_id = %self.id, ?outcome, pending = self.buffer.len(), "Change merged");

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics
                .record_enqueue(outcome == MergeOutcome::Coalesced, self.buffer.len())
                .await;
        }
    }

    async fn drain(&mut self, reply: oneshot::Sender<ChangeSnapshot<K, P, W>>) {
        if reply.is_closed() {
            debug!(worker_id = %self.id, "Drain requester gone, buffer left in place");
            return;
        }

        let snapshot = self.buffer.take_all();
        let records = snapshot.len();
        self.stats.drains_total += 1;

        if let Err(snapshot) = reply.send(snapshot) {
            debug!(worker_id = %self.id, records, "Drain reply undeliverable, restoring buffer");
            self.buffer.restore(snapshot);
            return;
        }
        trace!(worker_id = %self.id, records, "Buffer drained");

        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_drain(records).await;
        }
    }

    fn stats(&self) -> BufferStats {
        BufferStats {
            pending: self.buffer.len(),
            waiters: self.buffer.waiter_count(),
            ..self.stats.clone()
        }
    }
}
