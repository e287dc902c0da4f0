//! Change queue handle: producer and consumer entry points
//!
//! [`ChangeQueue`] is a cheap, cloneable handle. Producers call
//! [`submit`](ChangeQueue::submit) or [`enqueue`](ChangeQueue::enqueue),
//! which never fail and never wait. The consumer pulls batches through
//! [`snapshots`](ChangeQueue::snapshots) or asks directly with
//! [`drain`](ChangeQueue::drain).
//!
//! # Unbounded buffer
//!
//! Nothing limits how many keys may be pending. If the consumer stops
//! pulling, the buffer grows by one record per distinct key until memory
//! runs out. Use the monitor to get warned about it.

use crate::change::{ChangeKey, ChangeSnapshot, PendingChange};
use crate::config::ChangeQueueConfig;
use crate::error::{ChangeQueueError, Result};
use crate::event::{events, EventEmitter, EventStream, QueueEvent};
use crate::message::{BufferStats, QueueMessage};
#[cfg(feature = "metrics")]
use crate::metrics::ChangeQueueMetrics;
use crate::scheduler::SnapshotStream;
use crate::supervisor::{MailboxWatch, Supervisor};
use crate::timer::Timer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Optional instrumentation wired into the worker and the snapshot stream
#[derive(Clone, Default)]
pub(crate) struct Instruments {
    #[cfg(feature = "metrics")]
    pub(crate) metrics: Option<ChangeQueueMetrics>,
}

struct Shared<K, P, W> {
    mailbox: MailboxWatch<K, P, W>,
    config: ChangeQueueConfig,
    emitter: EventEmitter,
    instruments: Instruments,
    is_shutting_down: AtomicBool,
    stop: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running change queue
pub struct ChangeQueue<K, P, W> {
    shared: Arc<Shared<K, P, W>>,
}

impl<K, P, W> Clone for ChangeQueue<K, P, W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Handle that does not keep the queue alive.
///
/// Once every [`ChangeQueue`] is dropped the worker stops and
/// [`upgrade`](Self::upgrade) returns `None`.
pub struct WeakChangeQueue<K, P, W> {
    shared: Weak<Shared<K, P, W>>,
}

impl<K, P, W> Clone for WeakChangeQueue<K, P, W> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<K, P, W> WeakChangeQueue<K, P, W> {
    pub fn upgrade(&self) -> Option<ChangeQueue<K, P, W>> {
        self.shared.upgrade().map(|shared| ChangeQueue { shared })
    }
}

impl<K, P, W> ChangeQueue<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    /// Start a queue with the given configuration on the current tokio runtime
    pub fn start(config: ChangeQueueConfig, emitter: EventEmitter) -> Result<Self> {
        Self::launch(config, emitter, Instruments::default())
    }

    pub(crate) fn launch(
        config: ChangeQueueConfig,
        emitter: EventEmitter,
        instruments: Instruments,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ChangeQueueError::Config("a change queue must be started inside a tokio runtime".into())
        })?;

        let stop = CancellationToken::new();
        let (supervisor, first, mailbox) =
            Supervisor::new(config.restart_policy.clone(), emitter.clone(), stop.clone());
        #[cfg(feature = "metrics")]
        let supervisor = supervisor.with_metrics(instruments.metrics.clone());
        let handle = runtime.spawn(supervisor.run(first));

        info!(
            write_interval = ?config.write_interval,
            ask_timeout = ?config.ask_timeout,
            "Change queue started"
        );
        Ok(Self::from_parts(mailbox, config, emitter, instruments, stop, Some(handle)))
    }

    fn from_parts(
        mailbox: MailboxWatch<K, P, W>,
        config: ChangeQueueConfig,
        emitter: EventEmitter,
        instruments: Instruments,
        stop: CancellationToken,
        supervisor: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                mailbox,
                config,
                emitter,
                instruments,
                is_shutting_down: AtomicBool::new(false),
                stop,
                supervisor: Mutex::new(supervisor),
            }),
        }
    }

    /// Submit a change for `key`, optionally with a waiter to notify once it is written.
    pub fn submit(&self, key: K, payload: P, waiter: Option<W>) {
        self.enqueue(with_waiter(PendingChange::new(key, payload), waiter));
    }

    /// Like [`submit`](Self::submit), measuring the buffer wait on `timer`
    pub fn submit_timed(&self, key: K, payload: P, waiter: Option<W>, timer: Arc<dyn Timer>) {
        let change = with_waiter(PendingChange::new(key, payload), waiter).with_timer(timer);
        self.enqueue(change);
    }

    /// Hand a change to the worker. Fire-and-forget: if the worker is gone
    /// the change is dropped.
    pub fn enqueue(&self, change: PendingChange<K, P, W>) {
        if self.send(QueueMessage::Enqueue(change)).is_err() {
            debug!("Change queue worker unavailable, change dropped");
        }
    }

    /// Take everything pending, waiting at most the configured ask timeout.
    pub async fn drain(&self) -> Result<ChangeSnapshot<K, P, W>> {
        if self.is_shutting_down() {
            return Err(ChangeQueueError::ShutdownInProgress);
        }
        let (reply, response) = oneshot::channel();
        self.send(QueueMessage::Drain(reply))?;

        let timeout = self.shared.config.ask_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(ChangeQueueError::UnexpectedResponse(
                "worker dropped the drain reply".to_string(),
            )),
            Err(_) => Err(ChangeQueueError::DrainTimeout(timeout)),
        }
    }

    /// Like [`drain`](Self::drain), but any failure degrades to an empty snapshot.
    pub async fn drain_or_empty(&self) -> ChangeSnapshot<K, P, W> {
        self.tick().await.unwrap_or_default()
    }

    /// One scheduler cycle: a snapshot (possibly empty), or `None` once the
    /// queue can never produce data again.
    pub(crate) async fn tick(&self) -> Option<ChangeSnapshot<K, P, W>> {
        match self.drain().await {
            Ok(snapshot) => Some(snapshot),
            Err(ChangeQueueError::ShutdownInProgress) => None,
            Err(ChangeQueueError::WorkerLost) => {
                self.report_drain_failure(&ChangeQueueError::WorkerLost).await;
                if self.await_worker().await {
                    Some(HashMap::new())
                } else {
                    None
                }
            }
            Err(err) => {
                self.report_drain_failure(&err).await;
                Some(HashMap::new())
            }
        }
    }

    async fn report_drain_failure(&self, err: &ChangeQueueError) {
        match err {
            ChangeQueueError::DrainTimeout(after) => {
                warn!(?after, "Drain timed out, treating cycle as empty");
                self.shared
                    .emitter
                    .emit(QueueEvent::new(events::DRAIN_TIMEOUT).with("after_ms", after.as_millis() as u64));
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.shared.instruments.metrics {
                    metrics.record_drain_timeout().await;
                }
            }
            other => {
                warn!(error = %other, "Drain failed, treating cycle as empty");
                self.shared
                    .emitter
                    .emit(QueueEvent::new(events::DRAIN_FAILED).with("error", other.to_string()));
                #[cfg(feature = "metrics")]
                if let Some(metrics) = &self.shared.instruments.metrics {
                    metrics.record_drain_failure().await;
                }
            }
        }
    }

    /// Wait for the supervisor to publish a replacement worker.
    ///
    /// Returns `false` once no replacement can ever come.
    async fn await_worker(&self) -> bool {
        let mut mailbox = self.shared.mailbox.clone();
        let closed = mailbox.borrow_and_update().is_closed();
        if !closed {
            return true;
        }
        match tokio::time::timeout(self.shared.config.ask_timeout, mailbox.changed()).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => true,
        }
    }

    /// Counters of the current worker
    pub async fn stats(&self) -> Result<BufferStats> {
        if self.is_shutting_down() {
            return Err(ChangeQueueError::ShutdownInProgress);
        }
        let (reply, response) = oneshot::channel();
        self.send(QueueMessage::Stats(reply))?;

        let timeout = self.shared.config.ask_timeout;
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(_)) => Err(ChangeQueueError::WorkerLost),
            Err(_) => Err(ChangeQueueError::DrainTimeout(timeout)),
        }
    }

    /// Non-empty snapshots, spaced by the configured write interval
    pub fn snapshots(&self) -> SnapshotStream<K, P, W> {
        self.snapshots_every(self.shared.config.write_interval)
    }

    /// Non-empty snapshots, spaced by at least `write_interval` (zero: unthrottled)
    pub fn snapshots_every(&self, write_interval: Duration) -> SnapshotStream<K, P, W> {
        SnapshotStream::new(self.clone(), write_interval)
    }

    /// Stop the worker. Undrained changes are dropped; later drains fail
    /// with [`ChangeQueueError::ShutdownInProgress`].
    pub async fn shutdown(&self) {
        if self.shared.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down change queue");
        // Also covers a supervisor waiting to restart a lost worker
        self.shared.stop.cancel();
        let _ = self.send(QueueMessage::Shutdown);
        let supervisor = self.shared.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        self.shared.emitter.emit(QueueEvent::new(events::QUEUE_SHUTDOWN));
    }

    /// A handle that does not keep the worker running
    pub fn downgrade(&self) -> WeakChangeQueue<K, P, W> {
        WeakChangeQueue {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ChangeQueueConfig {
        &self.shared.config
    }

    /// Subscribe to queue lifecycle events
    pub fn subscribe_stream(&self) -> EventStream {
        self.shared.emitter.subscribe_stream()
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.shared.emitter
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&ChangeQueueMetrics> {
        self.shared.instruments.metrics.as_ref()
    }

    fn send(&self, message: QueueMessage<K, P, W>) -> Result<()> {
        self.shared
            .mailbox
            .borrow()
            .send(message)
            .map_err(|_| ChangeQueueError::WorkerLost)
    }
}

fn with_waiter<K, P, W>(change: PendingChange<K, P, W>, waiter: Option<W>) -> PendingChange<K, P, W> {
    match waiter {
        Some(waiter) => change.with_waiter(waiter),
        None => change,
    }
}

#[cfg(test)]
impl<K, P, W> ChangeQueue<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    /// Queue wired to a mailbox the test drives by hand
    pub(crate) fn detached(
        config: ChangeQueueConfig,
    ) -> (
        Self,
        crate::mailbox::Mailbox<QueueMessage<K, P, W>>,
        tokio::sync::watch::Sender<crate::mailbox::MailboxSender<QueueMessage<K, P, W>>>,
    ) {
        let (sender, mailbox) = crate::mailbox::mailbox();
        let (publish, watch) = tokio::sync::watch::channel(sender);
        let queue = Self::from_parts(
            watch,
            config,
            EventEmitter::new(64),
            Instruments::default(),
            CancellationToken::new(),
            None,
        );
        (queue, mailbox, publish)
    }

    /// Make the current worker panic
    pub(crate) fn crash_worker(&self) {
        let _ = self.send(QueueMessage::Crash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::restart::RestartPolicy;
    use crate::timer::TimerSegment;

    /// Timer whose instrumentation blows up inside the worker
    struct ExplodingTimer;

    impl Timer for ExplodingTimer {
        fn start_segment(&self, _name: &str) {
            panic!("timer failed to start a segment");
        }

        fn segment(&self, _name: &str) -> Option<Arc<dyn TimerSegment>> {
            None
        }
    }

    type Queue = ChangeQueue<String, String, String>;

    fn start(config: ChangeQueueConfig) -> Queue {
        Queue::start(config, EventEmitter::new(64)).unwrap()
    }

    fn submit(queue: &Queue, key: &str, payload: &str, waiter: &str) {
        queue.submit(key.to_string(), payload.to_string(), Some(waiter.to_string()));
    }

    /// Wait until the worker has merged `enqueued` changes; control messages
    /// overtake queued enqueues, so an immediate drain could miss them.
    async fn settle(queue: &Queue, enqueued: u64) {
        while queue.stats().await.unwrap().enqueued_total < enqueued {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let queue = start(ChangeQueueConfig::default());
        submit(&queue, "t1", "v1", "alice");
        submit(&queue, "t2", "v2", "bob");
        submit(&queue, "t1", "v3", "carol");
        settle(&queue, 3).await;

        let snapshot = queue.drain().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["t1"].payload(), "v3");
        assert_eq!(
            snapshot["t1"].waiters(),
            &["carol".to_string(), "alice".to_string()]
        );
        assert_eq!(snapshot["t2"].payload(), "v2");
        assert_eq!(snapshot["t2"].waiters(), &["bob".to_string()]);

        assert!(queue.drain().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_without_waiter() {
        let queue = start(ChangeQueueConfig::default());
        queue.submit("k".to_string(), "v".to_string(), None);
        settle(&queue, 1).await;
        let snapshot = queue.drain().await.unwrap();
        assert!(snapshot["k"].waiters().is_empty());
    }

    #[tokio::test]
    async fn test_no_loss_across_distinct_keys() {
        let queue = start(ChangeQueueConfig::default());
        for i in 0..500 {
            submit(&queue, &format!("k{i}"), &format!("p{i}"), &format!("w{i}"));
        }
        settle(&queue, 500).await;

        let snapshot = queue.drain().await.unwrap();
        assert_eq!(snapshot.len(), 500);
        for i in 0..500 {
            let change = &snapshot[&format!("k{i}")];
            assert_eq!(change.payload(), &format!("p{i}"));
            assert_eq!(change.waiters(), &[format!("w{i}")]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_never_duplicate_or_drop() {
        let queue = start(ChangeQueueConfig::default());
        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = queue.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..250 {
                    let id = format!("{p}-{i}");
                    queue.submit(format!("k{}", i % 50), id.clone(), Some(id));
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for _ in 0..10_000 {
            for change in queue.drain().await.unwrap().into_values() {
                for waiter in change.waiters() {
                    assert!(seen.insert(waiter.clone()), "waiter {waiter} delivered twice");
                }
            }
            if seen.len() == 1000 {
                break;
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[tokio::test]
    async fn test_stats() {
        let queue = start(ChangeQueueConfig::default());
        submit(&queue, "a", "1", "x");
        submit(&queue, "a", "2", "y");
        submit(&queue, "b", "1", "z");
        settle(&queue, 3).await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.waiters, 3);
        assert_eq!(stats.coalesced_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let config = ChangeQueueConfig::default().with_ask_timeout(Duration::from_secs(5));
        let (queue, _mailbox, _publish) = Queue::detached(config);

        let err = queue.drain().await.unwrap_err();
        assert_eq!(err, ChangeQueueError::DrainTimeout(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout_degrades_to_empty() {
        let (queue, _mailbox, _publish) = Queue::detached(ChangeQueueConfig::default());
        let mut stream = queue.subscribe_stream();

        assert!(queue.drain_or_empty().await.is_empty());
        assert_eq!(stream.recv().await.unwrap().kind, events::DRAIN_TIMEOUT);
    }

    #[tokio::test]
    async fn test_dropped_reply_is_unexpected_response() {
        let (queue, mut mailbox, _publish) = Queue::detached(ChangeQueueConfig::default());
        let drain = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });

        match mailbox.recv().await {
            Some(QueueMessage::Drain(reply)) => drop(reply),
            _ => panic!("expected a drain request"),
        }
        let err = drain.await.unwrap().unwrap_err();
        assert!(matches!(err, ChangeQueueError::UnexpectedResponse(_)));
    }

    #[tokio::test]
    async fn test_worker_lost_when_mailbox_closed() {
        let (queue, mailbox, _publish) = Queue::detached(ChangeQueueConfig::default());
        drop(mailbox);

        queue.submit("k".into(), "v".into(), None);
        assert_eq!(queue.drain().await.unwrap_err(), ChangeQueueError::WorkerLost);
    }

    #[tokio::test]
    async fn test_worker_restarted_after_crash() {
        let config = ChangeQueueConfig::default().with_restart_policy(RestartPolicy::immediate(1));
        let queue = start(config);
        let mut restarted = queue.emitter().subscribe_filtered(|e| {
            e.kind == events::WORKER_STARTED && e.attribute("restarts") == Some(&serde_json::json!(1))
        });
        submit(&queue, "lost", "v", "w");
        settle(&queue, 1).await;

        queue.crash_worker();
        restarted.recv().await.unwrap();

        submit(&queue, "kept", "v", "w");
        settle(&queue, 1).await;
        let snapshot = queue.drain().await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("kept"));
    }

    #[tokio::test]
    async fn test_shutdown_after_worker_panic_returns() {
        let queue = start(ChangeQueueConfig::default());
        queue.submit_timed("k".into(), "v".into(), None, Arc::new(ExplodingTimer));
        tokio::time::sleep(Duration::from_millis(1)).await;

        tokio::time::timeout(Duration::from_secs(3), queue.shutdown())
            .await
            .unwrap();
        assert_eq!(
            queue.drain().await.unwrap_err(),
            ChangeQueueError::ShutdownInProgress
        );
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_restart_backoff() {
        let policy = RestartPolicy {
            initial_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
            ..RestartPolicy::exponential()
        };
        let queue = start(ChangeQueueConfig::default().with_restart_policy(policy));
        let mut lost = queue.emitter().subscribe_filtered(|e| e.kind == events::WORKER_LOST);
        let mut started = queue.emitter().subscribe_filtered(|e| {
            e.kind == events::WORKER_STARTED && e.attribute("restarts") == Some(&serde_json::json!(1))
        });

        queue.crash_worker();
        lost.recv().await.unwrap();

        tokio::time::timeout(Duration::from_secs(3), queue.shutdown())
            .await
            .unwrap();
        // No replacement worker was started after the stop
        let restarted = tokio::time::timeout(Duration::from_millis(50), started.recv()).await;
        assert!(restarted.is_err());
    }

    #[tokio::test]
    async fn test_restart_budget_exhausted_ends_queue() {
        let config = ChangeQueueConfig::default().with_restart_policy(RestartPolicy::never());
        let queue = start(config);
        queue.crash_worker();
        let supervisor = queue.shared.supervisor.lock().await.take().unwrap();
        supervisor.await.unwrap();

        // No worker will ever come back
        assert!(queue.tick().await.is_none());
        assert_eq!(queue.drain().await.unwrap_err(), ChangeQueueError::WorkerLost);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let queue = start(ChangeQueueConfig::default());
        let mut stream = queue.subscribe_stream();
        submit(&queue, "k", "v", "w");

        queue.shutdown().await;
        assert!(queue.is_shutting_down());
        assert_eq!(
            queue.drain().await.unwrap_err(),
            ChangeQueueError::ShutdownInProgress
        );
        assert!(queue.tick().await.is_none());
        // Submitting after shutdown is silently ignored
        submit(&queue, "k", "v", "w");

        let mut kinds = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), stream.recv()).await
        {
            kinds.push(event.kind);
        }
        assert!(kinds.iter().any(|k| k == events::QUEUE_SHUTDOWN));
    }

    #[tokio::test]
    async fn test_weak_handle_does_not_keep_queue_alive() {
        let queue = start(ChangeQueueConfig::default());
        let weak = queue.downgrade();
        submit(&weak.upgrade().unwrap(), "k", "v", "w");
        settle(&queue, 1).await;

        drop(queue);
        assert!(weak.upgrade().is_none());
        assert!(weak.clone().upgrade().is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = ChangeQueueConfig::default().with_ask_timeout(Duration::ZERO);
        assert!(matches!(
            Queue::start(config, EventEmitter::new(8)),
            Err(ChangeQueueError::Config(_))
        ));
    }

    #[test]
    fn test_start_requires_runtime() {
        assert!(matches!(
            Queue::start(ChangeQueueConfig::default(), EventEmitter::new(8)),
            Err(ChangeQueueError::Config(_))
        ));
    }
}
