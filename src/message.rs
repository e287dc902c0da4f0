//! Messages accepted by the queue worker.

use crate::change::{ChangeSnapshot, PendingChange};
use crate::mailbox::{Classify, MessageClass};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// Messages that can be sent to a queue worker.
///
/// `Enqueue` is the only normal-class message; everything else is control
/// and is served before any queued `Enqueue`.
pub enum QueueMessage<K, P, W> {
    /// A newly observed change to merge into the buffer.
    Enqueue(PendingChange<K, P, W>),

    /// Take the whole buffer and reset it to empty.
    ///
    /// The worker replies with the (possibly empty) snapshot. A requester
    /// that stopped waiting leaves the buffer untouched.
    Drain(oneshot::Sender<ChangeSnapshot<K, P, W>>),

    /// Report buffer counters without touching the buffer.
    Stats(oneshot::Sender<BufferStats>),

    /// Stop the worker. Undrained changes are dropped.
    Shutdown,

    /// Panic inside the worker, simulating an abnormal termination.
    #[cfg(test)]
    Crash,
}

impl<K, P, W> Classify for QueueMessage<K, P, W> {
    fn class(&self) -> MessageClass {
        match self {
            QueueMessage::Enqueue(_) => MessageClass::Normal,
            _ => MessageClass::Control,
        }
    }
}

/// Point-in-time counters of one worker incarnation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    /// Keys currently pending
    pub pending: usize,
    /// Waiters across all pending keys
    pub waiters: usize,
    /// Changes merged since the worker started
    pub enqueued_total: u64,
    /// Changes folded into an already pending key
    pub coalesced_total: u64,
    /// Drain requests answered
    pub drains_total: u64,
}
