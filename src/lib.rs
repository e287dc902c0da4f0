//! # A3S Change Queue
//!
//! A coalescing change queue for batched, throttled writes.
//!
//! Producers submit changes keyed by an identity. While a key is waiting to
//! be written, newer changes for it replace the payload and accumulate their
//! waiters, so the consumer writes each key at most once per batch. A single
//! worker task owns the buffer; drain requests overtake queued changes so
//! the consumer is never starved by a busy producer.
//!
//! ## Core (always compiled)
//!
//! - `PendingChange` records with waiters and optional latency timers
//! - Coalescing buffer owned by a single worker behind a control-aware mailbox
//! - Drain rendezvous with a timeout that degrades to an empty batch
//! - `SnapshotStream`: lazy stream of non-empty snapshots with an optional write interval
//! - Supervised worker restarts (`RestartPolicy`) and graceful shutdown
//! - Event system for queue lifecycle notifications
//!
//! ## Feature Flags
//!
//! | Feature | Default | Dependencies | Description |
//! |---------|---------|-------------|-------------|
//! | `metrics` | ✅ | — | `MetricsBackend` trait, `LocalMetrics`, enqueue/drain/snapshot metrics |
//! | `monitoring` | ✅ | — | `QueueMonitor` warning when the buffer grows past a threshold |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use a3s_change_queue::{ChangeQueueBuilder, Result};
//! use std::time::Duration;
//! use tokio::sync::oneshot;
//! use tokio_stream::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let queue = ChangeQueueBuilder::<String, String, oneshot::Sender<()>>::new()
//!         .with_write_interval(Duration::from_millis(100))
//!         .build()?;
//!
//!     let (done, written) = oneshot::channel();
//!     queue.submit("table-1".into(), "v1".into(), Some(done));
//!
//!     let mut snapshots = queue.snapshots();
//!     if let Some(snapshot) = snapshots.next().await {
//!         for (key, change) in snapshot {
//!             let (_, payload, waiters) = change.into_parts();
//!             println!("write {key} = {payload}");
//!             waiters.into_iter().for_each(|w| { let _ = w.send(()); });
//!         }
//!     }
//!     written.await.ok();
//!     queue.shutdown().await;
//!     Ok(())
//! }
//! ```

// Core modules (always compiled)
pub mod buffer;
pub mod builder;
pub mod change;
pub mod config;
pub mod error;
pub mod event;
pub mod mailbox;
pub mod message;
pub mod queue;
pub mod restart;
pub mod scheduler;
pub mod timer;
pub mod worker;

mod supervisor;

// Feature-gated modules
#[cfg(feature = "metrics")]
pub mod metrics;
#[cfg(feature = "monitoring")]
pub mod monitor;

// Core re-exports
pub use buffer::{CoalescingBuffer, MergeOutcome};
pub use builder::ChangeQueueBuilder;
pub use change::{ChangeKey, ChangeSnapshot, PendingChange};
pub use config::{ChangeQueueConfig, DEFAULT_ASK_TIMEOUT};
pub use error::{ChangeQueueError, Result};
pub use event::{events, EventEmitter, EventStream, QueueEvent};
pub use message::{BufferStats, QueueMessage};
pub use queue::{ChangeQueue, WeakChangeQueue};
pub use restart::RestartPolicy;
pub use scheduler::SnapshotStream;
pub use timer::{Segment, StartedTimer, Timer, TimerSegment, WAIT_FOR_DEQUEUE};
pub use worker::{ChangeQueueWorker, WorkerExit};

// Feature-gated re-exports
#[cfg(feature = "metrics")]
pub use metrics::{
    metric_names, ChangeQueueMetrics, HistogramStats, LocalMetrics, MetricsBackend,
    MetricsSnapshot,
};
#[cfg(feature = "monitoring")]
pub use monitor::{MonitorConfig, QueueMonitor};
