//! Buffer monitor warning about unbounded growth

use crate::change::ChangeKey;
use crate::error::{ChangeQueueError, Result};
use crate::event::{events, QueueEvent};
use crate::message::BufferStats;
use crate::queue::{ChangeQueue, WeakChangeQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Monitor configuration
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Polling interval
    pub interval: Duration,
    /// Warning threshold for pending keys
    pub pending_warning_threshold: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            pending_warning_threshold: 10_000,
        }
    }
}

/// Periodically polls buffer stats and reports pressure transitions.
///
/// Crossing the threshold emits [`events::BUFFER_PRESSURE`] once; falling
/// back to or below it emits [`events::BUFFER_RELIEVED`].
///
/// The monitor only holds a weak handle: dropping every [`ChangeQueue`]
/// still stops the worker, and the background task with it.
pub struct QueueMonitor<K, P, W> {
    queue: WeakChangeQueue<K, P, W>,
    config: MonitorConfig,
    under_pressure: AtomicBool,
}

impl<K, P, W> QueueMonitor<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    pub fn new(queue: ChangeQueue<K, P, W>) -> Self {
        Self::with_config(queue, MonitorConfig::default())
    }

    pub fn with_config(queue: ChangeQueue<K, P, W>, config: MonitorConfig) -> Self {
        Self {
            queue: queue.downgrade(),
            config,
            under_pressure: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Poll in the background until the queue shuts down or is dropped
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut ticker = tokio::time::interval(self.config.interval);
        tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let stopped = self
                    .queue
                    .upgrade()
                    .map_or(true, |queue| queue.is_shutting_down());
                if stopped {
                    debug!("Change queue gone, monitor stopping");
                    return;
                }
                if let Err(err) = self.check_health().await {
                    debug!(error = %err, "Buffer stats unavailable");
                }
            }
        })
    }

    /// Poll once, emitting an event if the pressure state changed
    pub async fn check_health(&self) -> Result<BufferStats> {
        let queue = self.queue.upgrade().ok_or(ChangeQueueError::ShutdownInProgress)?;
        let stats = queue.stats().await?;
        debug!(
            pending = stats.pending,
            waiters = stats.waiters,
            enqueued = stats.enqueued_total,
            coalesced = stats.coalesced_total,
            "Change buffer status"
        );

        let over = stats.pending > self.config.pending_warning_threshold;
        let was_over = self.under_pressure.swap(over, Ordering::SeqCst);
        let threshold = self.config.pending_warning_threshold;
        match (was_over, over) {
            (false, true) => {
                warn!(
                    pending = stats.pending,
                    threshold, "Change buffer is growing, is the consumer keeping up?"
                );
                queue.emitter().emit(
                    QueueEvent::new(events::BUFFER_PRESSURE)
                        .with("pending", stats.pending)
                        .with("threshold", threshold),
                );
            }
            (true, false) => {
                info!(pending = stats.pending, threshold, "Change buffer back under threshold");
                queue.emitter().emit(
                    QueueEvent::new(events::BUFFER_RELIEVED)
                        .with("pending", stats.pending)
                        .with("threshold", threshold),
                );
            }
            _ => {}
        }
        Ok(stats)
    }

    pub fn is_under_pressure(&self) -> bool {
        self.under_pressure.load(Ordering::SeqCst)
    }
}
