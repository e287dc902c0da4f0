//! Builder for [`ChangeQueue`]

use crate::change::ChangeKey;
use crate::config::ChangeQueueConfig;
use crate::error::Result;
use crate::event::EventEmitter;
#[cfg(feature = "metrics")]
use crate::metrics::ChangeQueueMetrics;
use crate::queue::{ChangeQueue, Instruments};
use crate::restart::RestartPolicy;
use std::marker::PhantomData;
use std::time::Duration;

/// Builder for creating a change queue
pub struct ChangeQueueBuilder<K, P, W> {
    config: ChangeQueueConfig,
    event_emitter: Option<EventEmitter>,
    #[cfg(feature = "metrics")]
    metrics: Option<ChangeQueueMetrics>,
    _types: PhantomData<fn() -> (K, P, W)>,
}

impl<K, P, W> Default for ChangeQueueBuilder<K, P, W> {
    fn default() -> Self {
        Self {
            config: ChangeQueueConfig::default(),
            event_emitter: None,
            #[cfg(feature = "metrics")]
            metrics: None,
            _types: PhantomData,
        }
    }
}

impl<K, P, W> ChangeQueueBuilder<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: ChangeQueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Minimum spacing between snapshot ticks; zero disables throttling
    pub fn with_write_interval(mut self, write_interval: Duration) -> Self {
        self.config.write_interval = write_interval;
        self
    }

    /// Bound on a single drain rendezvous
    pub fn with_ask_timeout(mut self, ask_timeout: Duration) -> Self {
        self.config.ask_timeout = ask_timeout;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.config.restart_policy = policy;
        self
    }

    /// Share an event emitter with other components
    pub fn with_event_emitter(mut self, emitter: EventEmitter) -> Self {
        self.event_emitter = Some(emitter);
        self
    }

    /// Add metrics collection
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: ChangeQueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and start the queue on the current runtime
    pub fn build(self) -> Result<ChangeQueue<K, P, W>> {
        let instruments = Instruments {
            #[cfg(feature = "metrics")]
            metrics: self.metrics,
        };
        ChangeQueue::launch(self.config, self.event_emitter.unwrap_or_default(), instruments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChangeQueueError;
    use crate::event::events;

    type Builder = ChangeQueueBuilder<u64, String, ()>;

    #[tokio::test]
    async fn test_builder_defaults() {
        let queue = Builder::new().build().unwrap();
        assert_eq!(queue.config(), &ChangeQueueConfig::default());
        assert!(!queue.config().is_throttled());
    }

    #[tokio::test]
    async fn test_builder_settings() {
        let queue = Builder::new()
            .with_write_interval(Duration::from_millis(250))
            .with_ask_timeout(Duration::from_secs(1))
            .with_restart_policy(RestartPolicy::never())
            .build()
            .unwrap();

        let config = queue.config();
        assert_eq!(config.write_interval, Duration::from_millis(250));
        assert_eq!(config.ask_timeout, Duration::from_secs(1));
        assert_eq!(config.restart_policy, RestartPolicy::never());
        assert_eq!(queue.snapshots().write_interval(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_builder_with_config() {
        let config = ChangeQueueConfig::new(Duration::from_millis(10));
        let queue = Builder::new().with_config(config.clone()).build().unwrap();
        assert_eq!(queue.config(), &config);
    }

    #[tokio::test]
    async fn test_builder_shared_emitter() {
        let emitter = EventEmitter::new(16);
        let mut stream = emitter.subscribe_filtered(|e| e.kind == events::WORKER_STARTED);

        let _queue = Builder::new().with_event_emitter(emitter).build().unwrap();
        let event = stream.recv().await.unwrap();
        assert!(event.attribute("worker_id").is_some());
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_config() {
        let result = Builder::new().with_ask_timeout(Duration::ZERO).build();
        assert!(matches!(result, Err(ChangeQueueError::Config(_))));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn test_builder_with_metrics() {
        let metrics = ChangeQueueMetrics::local();
        let queue = Builder::new().with_metrics(metrics).build().unwrap();
        assert!(queue.metrics().is_some());
    }
}
