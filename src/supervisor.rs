//! Supervisor restarting a lost queue worker.
//!
//! The worker runs in its own task. If it panics, its buffer and mailbox
//! die with it; the supervisor publishes a fresh mailbox to every
//! [`ChangeQueue`](crate::ChangeQueue) handle through a watch channel and
//! starts a new worker with an empty buffer.
//!
//! Cancelling the stop token ends supervision: the current worker is told
//! to shut down and no further restart happens, even mid-backoff.

use crate::change::ChangeKey;
use crate::event::{events, EventEmitter, QueueEvent};
use crate::mailbox::{mailbox, Mailbox, MailboxSender};
use crate::message::QueueMessage;
#[cfg(feature = "metrics")]
use crate::metrics::ChangeQueueMetrics;
use crate::restart::RestartPolicy;
use crate::worker::ChangeQueueWorker;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub(crate) type MailboxWatch<K, P, W> = watch::Receiver<MailboxSender<QueueMessage<K, P, W>>>;

pub(crate) struct Supervisor<K, P, W> {
    publish: watch::Sender<MailboxSender<QueueMessage<K, P, W>>>,
    policy: RestartPolicy,
    emitter: EventEmitter,
    stop: CancellationToken,
    #[cfg(feature = "metrics")]
    metrics: Option<ChangeQueueMetrics>,
}

impl<K, P, W> Supervisor<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    /// Create the first mailbox and a supervisor publishing it
    pub(crate) fn new(
        policy: RestartPolicy,
        emitter: EventEmitter,
        stop: CancellationToken,
    ) -> (Self, Mailbox<QueueMessage<K, P, W>>, MailboxWatch<K, P, W>) {
        let (sender, first) = mailbox();
        let (publish, subscribed) = watch::channel(sender);
        let supervisor = Self {
            publish,
            policy,
            emitter,
            stop,
            #[cfg(feature = "metrics")]
            metrics: None,
        };
        (supervisor, first, subscribed)
    }

    #[cfg(feature = "metrics")]
    pub(crate) fn with_metrics(mut self, metrics: Option<ChangeQueueMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn worker(&self, mailbox: Mailbox<QueueMessage<K, P, W>>) -> ChangeQueueWorker<K, P, W> {
        let worker = ChangeQueueWorker::new(mailbox);
        #[cfg(feature = "metrics")]
        let worker = worker.with_metrics(self.metrics.clone());
        worker
    }

    /// Keep a worker running until it stops on purpose or restarts run out.
    pub(crate) async fn run(self, first: Mailbox<QueueMessage<K, P, W>>) {
        let mut current = first;
        let mut restarts: u32 = 0;

        loop {
            let worker = self.worker(current);
            let worker_id = worker.id();
            self.emitter.emit(
                QueueEvent::new(events::WORKER_STARTED)
                    .with("worker_id", worker_id.to_string())
                    .with("restarts", restarts),
            );

            let mut handle = tokio::spawn(worker.run());
            let outcome = tokio::select! {
                result = &mut handle => result,
                _ = self.stop.cancelled() => {
                    debug!(worker_id = %worker_id, "Stop requested, stopping worker");
                    let _ = self.publish.borrow().send(QueueMessage::Shutdown);
                    let _ = handle.await;
                    return;
                }
                _ = self.publish.closed() => {
                    debug!(worker_id = %worker_id, "All queue handles dropped, stopping worker");
                    let _ = self.publish.borrow().send(QueueMessage::Shutdown);
                    handle.await
                }
            };

            match outcome {
                Ok(exit) => {
                    debug!(worker_id = %worker_id, ?exit, "Supervisor stopping");
                    return;
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(
                        worker_id = %worker_id,
                        "Change queue worker lost, its pending changes are dropped"
                    );
                    self.emitter.emit(
                        QueueEvent::new(events::WORKER_LOST)
                            .with("worker_id", worker_id.to_string()),
                    );
                }
                Err(join_error) => {
                    warn!(worker_id = %worker_id, error = %join_error, "Worker task cancelled");
                    return;
                }
            }

            if self.stop.is_cancelled() {
                debug!(worker_id = %worker_id, "Stop requested, not restarting");
                return;
            }
            restarts += 1;
            if !self.policy.allows(restarts) {
                error!(restarts, "Restart budget exhausted, change queue is lost");
                return;
            }
            let delay = self.policy.delay_for_restart(restarts);
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.stop.cancelled() => {
                        debug!(restarts, "Stop requested during restart backoff");
                        return;
                    }
                }
            }
            if self.stop.is_cancelled() {
                return;
            }

            #[cfg(feature = "metrics")]
            if let Some(metrics) = &self.metrics {
                metrics.record_worker_restart().await;
            }

            let (sender, next) = mailbox();
            self.publish.send_replace(sender);
            current = next;
            info!(restarts, ?delay, "Restarting change queue worker with an empty buffer");
        }
    }
}
