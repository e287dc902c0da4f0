//! Error types for the change queue
//!
//! Producers never observe an error: `submit` and `enqueue` are
//! fire-and-forget. Errors only surface on the consumer side of the drain
//! rendezvous and when building a queue.
//!
//! # Error Handling
//!
//! The [`ChangeQueueError`] enum covers:
//! - Drain rendezvous failures (timeout, reply dropped, worker gone)
//! - Lifecycle errors (shutdown in progress)
//! - Configuration errors (invalid durations, no runtime available)
//!
//! The emission scheduler never propagates these; a failed drain degrades to
//! an empty cycle. Callers using [`ChangeQueue::drain`](crate::ChangeQueue::drain)
//! directly get the typed error:
//!
//! ```rust,ignore
//! match queue.drain().await {
//!     Ok(snapshot) => write_batch(snapshot).await,
//!     Err(ChangeQueueError::DrainTimeout(after)) => {
//!         tracing::warn!(?after, "drain timed out, retrying next tick");
//!     }
//!     Err(e) => tracing::error!(error = %e, "drain failed"),
//! }
//! ```

use std::time::Duration;
use thiserror::Error;

/// Change queue error type
///
/// # Variants
///
/// * `DrainTimeout` - The worker did not answer a drain within the ask timeout
/// * `UnexpectedResponse` - The drain reply channel closed without a snapshot
/// * `WorkerLost` - The worker's mailbox is closed; its buffered records are gone
/// * `ShutdownInProgress` - The queue was shut down
/// * `Config` - Invalid configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChangeQueueError {
    /// Drain rendezvous timed out
    #[error("Drain timed out after {0:?}")]
    DrainTimeout(Duration),

    /// Drain reply was not a snapshot
    #[error("Unexpected drain response: {0}")]
    UnexpectedResponse(String),

    /// The single-owner worker terminated
    #[error("Change queue worker lost")]
    WorkerLost,

    /// Shutdown in progress
    #[error("Change queue is shutting down")]
    ShutdownInProgress,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ChangeQueueError {
    /// Whether the scheduler should treat this failure as an empty cycle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChangeQueueError::DrainTimeout(_) | ChangeQueueError::UnexpectedResponse(_)
        )
    }
}

/// Result type alias using ChangeQueueError
pub type Result<T> = std::result::Result<T, ChangeQueueError>;
