//! Pending changes: the unit of coalesced state per entity key

use crate::timer::Timer;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// Bound for entity keys: comparable, hashable, cheap to clone
pub trait ChangeKey: Eq + Hash + Clone + Send + Sync + 'static {}

impl<T> ChangeKey for T where T: Eq + Hash + Clone + Send + Sync + 'static {}

/// Snapshot handed to the consumer on every drain
pub type ChangeSnapshot<K, P, W> = HashMap<K, PendingChange<K, P, W>>;

/// The latest known change of one entity plus everyone waiting on it.
///
/// `waiters` are ordered newest first: a merge puts the incoming waiters in
/// front of the ones already pending, each group keeping its own order.
pub struct PendingChange<K, P, W> {
    key: K,
    payload: P,
    waiters: Vec<W>,
    timers: Vec<Arc<dyn Timer>>,
}

impl<K, P, W> PendingChange<K, P, W> {
    /// Create a change with no waiters and no timers
    pub fn new(key: K, payload: P) -> Self {
        Self {
            key,
            payload,
            waiters: Vec::new(),
            timers: Vec::new(),
        }
    }

    /// Add a waiter to be notified once the change is persisted (builder pattern)
    pub fn with_waiter(mut self, waiter: W) -> Self {
        self.waiters.push(waiter);
        self
    }

    /// Attach a latency timer (builder pattern)
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timers.push(timer);
        self
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn waiters(&self) -> &[W] {
        &self.waiters
    }

    pub fn timers(&self) -> &[Arc<dyn Timer>] {
        &self.timers
    }

    /// Split into key, payload and waiters once the change has been written
    pub fn into_parts(self) -> (K, P, Vec<W>) {
        (self.key, self.payload, self.waiters)
    }

    /// Fold a newer change for the same key into this one.
    ///
    /// The payload is replaced; the newer waiters and timers go first.
    pub(crate) fn absorb_newer(&mut self, newer: PendingChange<K, P, W>) {
        self.payload = newer.payload;
        self.waiters = prepend(newer.waiters, &mut self.waiters);
        self.timers = prepend(newer.timers, &mut self.timers);
    }

    /// Fold an older change for the same key into this one.
    ///
    /// The payload is kept; the older waiters and timers go last.
    pub(crate) fn absorb_older(&mut self, mut older: PendingChange<K, P, W>) {
        self.waiters.append(&mut older.waiters);
        self.timers.append(&mut older.timers);
    }

    pub(crate) fn start_segment(&self, name: &str) {
        for timer in &self.timers {
            timer.start_segment(name);
        }
    }

    /// Stop every running segment with this name, returning how many were stopped
    pub(crate) fn stop_segment(&self, name: &str) -> usize {
        let mut stopped = 0;
        for timer in &self.timers {
            if let Some(segment) = timer.segment(name) {
                if segment.is_running() {
                    segment.stop();
                    stopped += 1;
                }
            }
        }
        stopped
    }
}

fn prepend<T>(mut front: Vec<T>, back: &mut Vec<T>) -> Vec<T> {
    front.append(back);
    front
}

impl<K: fmt::Debug, P: fmt::Debug, W: fmt::Debug> fmt::Debug for PendingChange<K, P, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingChange")
            .field("key", &self.key)
            .field("payload", &self.payload)
            .field("waiters", &self.waiters)
            .field("timers", &self.timers.len())
            .finish()
    }
}
