//! Coalescing buffer owned by the queue worker

use crate::change::{ChangeKey, ChangeSnapshot, PendingChange};
use crate::timer::WAIT_FOR_DEQUEUE;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// What a merge did with the incoming change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The key was not pending; the change was inserted as-is
    Inserted,
    /// The key was pending; the change was folded into the pending record
    Coalesced,
}

/// Mapping from entity key to its pending change.
///
/// Has no size bound: when the consumer stalls, the buffer keeps growing by
/// one record per distinct key.
pub struct CoalescingBuffer<K, P, W> {
    entries: ChangeSnapshot<K, P, W>,
}

impl<K: ChangeKey, P, W> CoalescingBuffer<K, P, W> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert a change, or fold it into the pending record for its key.
    ///
    /// Only an insert starts the `wait_for_dequeue` segment; the timer of a
    /// key that is already pending keeps running from its first enqueue.
    pub fn merge(&mut self, change: PendingChange<K, P, W>) -> MergeOutcome {
        match self.entries.entry(change.key().clone()) {
            Entry::Vacant(slot) => {
                change.start_segment(WAIT_FOR_DEQUEUE);
                slot.insert(change);
                MergeOutcome::Inserted
            }
            Entry::Occupied(mut slot) => {
                slot.get_mut().absorb_newer(change);
                MergeOutcome::Coalesced
            }
        }
    }

    /// Take every pending record, leaving a fresh empty buffer behind
    pub fn take_all(&mut self) -> ChangeSnapshot<K, P, W> {
        std::mem::take(&mut self.entries)
    }

    /// Put back a snapshot that never reached its consumer.
    ///
    /// Restored records are older than anything pending for the same key.
    pub fn restore(&mut self, snapshot: ChangeSnapshot<K, P, W>) {
        if self.entries.is_empty() {
            self.entries = snapshot;
            return;
        }
        for (key, older) in snapshot {
            match self.entries.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(older);
                }
                Entry::Occupied(mut slot) => slot.get_mut().absorb_older(older),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pending keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Number of waiters across all pending keys
    pub fn waiter_count(&self) -> usize {
        self.entries.values().map(|c| c.waiters().len()).sum()
    }

    pub fn get(&self, key: &K) -> Option<&PendingChange<K, P, W>> {
        self.entries.get(key)
    }
}

impl<K: ChangeKey, P, W> Default for CoalescingBuffer<K, P, W> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::testing::CountingTimer;

    type Buffer = CoalescingBuffer<String, String, String>;
    type Change = PendingChange<String, String, String>;

    fn change(key: &str, payload: &str, waiter: &str) -> Change {
        Change::new(key.to_string(), payload.to_string()).with_waiter(waiter.to_string())
    }

    #[test]
    fn test_new_buffer_is_empty() {
        let buffer = Buffer::new();
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.waiter_count(), 0);
    }

    #[test]
    fn test_merge_inserts_new_key() {
        let mut buffer = Buffer::new();
        assert_eq!(buffer.merge(change("t1", "v1", "alice")), MergeOutcome::Inserted);
        assert_eq!(buffer.len(), 1);
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_merge_coalesces_same_key() {
        let mut buffer = Buffer::new();
        buffer.merge(change("t1", "v1", "alice"));
        assert_eq!(buffer.merge(change("t1", "v3", "carol")), MergeOutcome::Coalesced);

        assert_eq!(buffer.len(), 1);
        let pending = buffer.get(&"t1".to_string()).unwrap();
        assert_eq!(pending.payload(), "v3");
        assert_eq!(pending.waiters(), &["carol".to_string(), "alice".to_string()]);
    }

    #[test]
    fn test_waiters_never_shrink_between_drains() {
        let mut buffer = Buffer::new();
        let mut previous = 0;
        for i in 0..10 {
            buffer.merge(change("k", &format!("v{i}"), &format!("w{i}")));
            let now = buffer.get(&"k".to_string()).unwrap().waiters().len();
            assert!(now > previous);
            previous = now;
        }
        assert_eq!(buffer.waiter_count(), 10);
    }

    #[test]
    fn test_merge_starts_timer_once_per_key() {
        let first = CountingTimer::new();
        let second = CountingTimer::new();
        let mut buffer = Buffer::new();

        buffer.merge(change("k", "v1", "a").with_timer(first.clone()));
        buffer.merge(change("k", "v2", "b").with_timer(second.clone()));

        assert_eq!(first.starts(), 1);
        assert_eq!(second.starts(), 0);
        assert_eq!(buffer.get(&"k".to_string()).unwrap().timers().len(), 2);
    }

    #[test]
    fn test_take_all_resets() {
        let mut buffer = Buffer::new();
        buffer.merge(change("t1", "v1", "alice"));
        buffer.merge(change("t2", "v2", "bob"));

        let snapshot = buffer.take_all();
        assert_eq!(snapshot.len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.take_all().is_empty());
    }

    #[test]
    fn test_key_pending_again_after_take_restarts_timer() {
        let timer = CountingTimer::new();
        let mut buffer = Buffer::new();
        buffer.merge(change("k", "v1", "a").with_timer(timer.clone()));
        let _ = buffer.take_all();
        buffer.merge(change("k", "v2", "b").with_timer(timer.clone()));
        assert_eq!(timer.starts(), 2);
    }

    #[test]
    fn test_restore_into_empty_buffer() {
        let mut buffer = Buffer::new();
        buffer.merge(change("t1", "v1", "alice"));
        let snapshot = buffer.take_all();

        buffer.restore(snapshot);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.get(&"t1".to_string()).unwrap().payload(), "v1");
    }

    #[test]
    fn test_restore_treats_snapshot_as_older() {
        let mut buffer = Buffer::new();
        buffer.merge(change("t1", "v1", "alice"));
        let snapshot = buffer.take_all();
        buffer.merge(change("t1", "v2", "bob"));
        buffer.merge(change("t2", "x", "carol"));

        buffer.restore(snapshot);
        let pending = buffer.get(&"t1".to_string()).unwrap();
        assert_eq!(pending.payload(), "v2");
        assert_eq!(pending.waiters(), &["bob".to_string(), "alice".to_string()]);
        assert_eq!(buffer.len(), 2);
    }
}
