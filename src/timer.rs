//! Latency timers attached to pending changes
//!
//! The queue only needs a small contract from a timer: start a named
//! segment, and look a segment up later to check whether it is still
//! running and stop it. [`StartedTimer`] is the bundled implementation;
//! callers with their own instrumentation implement [`Timer`] directly.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Segment measuring how long a change waited in the buffer
pub const WAIT_FOR_DEQUEUE: &str = "wait_for_dequeue";

/// A named, stoppable timing segment
pub trait TimerSegment: Send + Sync {
    /// Whether the segment has not been stopped yet
    fn is_running(&self) -> bool;

    /// Stop the segment. Stopping twice has no further effect.
    fn stop(&self);
}

/// A timer collaborator carried by a pending change
pub trait Timer: Send + Sync {
    /// Start (or restart) the segment with the given name
    fn start_segment(&self, name: &str);

    /// Look up a previously started segment
    fn segment(&self, name: &str) -> Option<Arc<dyn TimerSegment>>;
}

/// Segment backed by a monotonic clock
#[derive(Debug)]
pub struct Segment {
    started_at: Instant,
    /// `RUNNING` until stopped, then the measured duration
    elapsed_nanos: AtomicU64,
}

const RUNNING: u64 = u64::MAX;

impl Segment {
    fn start() -> Self {
        Self {
            started_at: Instant::now(),
            elapsed_nanos: AtomicU64::new(RUNNING),
        }
    }

    /// Duration between start and stop, `None` while still running
    pub fn elapsed(&self) -> Option<Duration> {
        match self.elapsed_nanos.load(Ordering::Acquire) {
            RUNNING => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}

impl TimerSegment for Segment {
    fn is_running(&self) -> bool {
        self.elapsed_nanos.load(Ordering::Acquire) == RUNNING
    }

    fn stop(&self) {
        let nanos = (self.started_at.elapsed().as_nanos() as u64).min(RUNNING - 1);
        let _ = self.elapsed_nanos.compare_exchange(
            RUNNING,
            nanos,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Timer keeping its segments in a concurrent map
#[derive(Debug)]
pub struct StartedTimer {
    name: String,
    segments: DashMap<String, Arc<Segment>>,
}

impl StartedTimer {
    /// Create a timer with no segments
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            segments: DashMap::new(),
        })
    }

    /// Timer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Concrete segment lookup, exposing [`Segment::elapsed`]
    pub fn get(&self, name: &str) -> Option<Arc<Segment>> {
        self.segments.get(name).map(|s| Arc::clone(s.value()))
    }
}

impl Timer for StartedTimer {
    fn start_segment(&self, name: &str) {
        self.segments
            .insert(name.to_string(), Arc::new(Segment::start()));
    }

    fn segment(&self, name: &str) -> Option<Arc<dyn TimerSegment>> {
        self.get(name).map(|s| s as Arc<dyn TimerSegment>)
    }
}
