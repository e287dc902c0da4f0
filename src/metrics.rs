//! Metrics for change queue observability.
//!
//! A pluggable [`MetricsBackend`] with an in-memory [`LocalMetrics`]
//! default. [`ChangeQueueMetrics`] wraps a backend with the handful of
//! measurements the queue records.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A pluggable metrics backend.
///
/// Implement this to forward queue metrics to Prometheus, OpenTelemetry or
/// any other system.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    async fn increment_counter(&self, name: &str, value: u64);

    async fn set_gauge(&self, name: &str, value: f64);

    async fn record_histogram(&self, name: &str, value: f64);

    async fn get_counter(&self, name: &str) -> Option<u64>;

    async fn get_gauge(&self, name: &str) -> Option<f64>;

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats>;

    async fn snapshot(&self) -> MetricsSnapshot;
}

/// Summary of a histogram
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
}

impl HistogramStats {
    fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let count = sorted.len();
        let sum: f64 = sorted.iter().sum();
        let rank = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];
        Self {
            count: count as u64,
            sum,
            min: sorted[0],
            max: sorted[count - 1],
            mean: sum / count as f64,
            p50: rank(0.50),
            p99: rank(0.99),
        }
    }
}

/// All metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramStats>,
}

/// In-memory metrics backend.
///
/// Histograms keep every sample; meant for tests, demos and single
/// instance deployments.
#[derive(Default)]
pub struct LocalMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, Vec<f64>>>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsBackend for LocalMetrics {
    async fn increment_counter(&self, name: &str, value: u64) {
        *self
            .counters
            .write()
            .await
            .entry(name.to_string())
            .or_insert(0) += value;
    }

    async fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.write().await.insert(name.to_string(), value);
    }

    async fn record_histogram(&self, name: &str, value: f64) {
        self.histograms
            .write()
            .await
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    async fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters.read().await.get(name).copied()
    }

    async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().await.get(name).copied()
    }

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats> {
        self.histograms
            .read()
            .await
            .get(name)
            .map(|samples| HistogramStats::from_samples(samples))
    }

    async fn snapshot(&self) -> MetricsSnapshot {
        let histograms = self.histograms.read().await;
        MetricsSnapshot {
            counters: self.counters.read().await.clone(),
            gauges: self.gauges.read().await.clone(),
            histograms: histograms
                .iter()
                .map(|(name, samples)| (name.clone(), HistogramStats::from_samples(samples)))
                .collect(),
        }
    }
}

/// Predefined metric names
pub mod metric_names {
    /// Counter: changes merged into the buffer
    pub const CHANGES_ENQUEUED: &str = "changes.enqueued";
    /// Counter: changes folded into an already pending key
    pub const CHANGES_COALESCED: &str = "changes.coalesced";
    /// Counter: records handed to the consumer
    pub const RECORDS_DRAINED: &str = "changes.records.drained";
    /// Counter: non-empty snapshots emitted
    pub const SNAPSHOTS_EMITTED: &str = "changes.snapshots.emitted";
    /// Counter: drains that timed out
    pub const DRAIN_TIMEOUTS: &str = "changes.drain.timeouts";
    /// Counter: drains that failed for any other reason
    pub const DRAIN_FAILURES: &str = "changes.drain.failures";
    /// Counter: workers restarted after being lost
    pub const WORKER_RESTARTS: &str = "changes.worker.restarts";

    /// Gauge: keys pending in the buffer
    pub const PENDING_KEYS: &str = "changes.buffer.pending";

    /// Histogram: records per emitted snapshot
    pub const SNAPSHOT_SIZE: &str = "changes.snapshot.size";
}

/// Queue-specific view over a metrics backend
#[derive(Clone)]
pub struct ChangeQueueMetrics {
    backend: Arc<dyn MetricsBackend>,
}

impl ChangeQueueMetrics {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Metrics kept in memory
    pub fn local() -> Self {
        Self::new(Arc::new(LocalMetrics::new()))
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    pub async fn record_enqueue(&self, coalesced: bool, pending: usize) {
        self.backend
            .increment_counter(metric_names::CHANGES_ENQUEUED, 1)
            .await;
        if coalesced {
            self.backend
                .increment_counter(metric_names::CHANGES_COALESCED, 1)
                .await;
        }
        self.backend
            .set_gauge(metric_names::PENDING_KEYS, pending as f64)
            .await;
    }

    /// Record a drain answered by the worker; empty drains only reset the gauge
    pub async fn record_drain(&self, records: usize) {
        self.backend
            .set_gauge(metric_names::PENDING_KEYS, 0.0)
            .await;
        if records == 0 {
            return;
        }
        self.backend
            .increment_counter(metric_names::RECORDS_DRAINED, records as u64)
            .await;
    }

    pub async fn record_snapshot_emitted(&self, records: usize) {
        self.backend
            .increment_counter(metric_names::SNAPSHOTS_EMITTED, 1)
            .await;
        self.backend
            .record_histogram(metric_names::SNAPSHOT_SIZE, records as f64)
            .await;
    }

    pub async fn record_drain_timeout(&self) {
        self.backend
            .increment_counter(metric_names::DRAIN_TIMEOUTS, 1)
            .await;
    }

    pub async fn record_drain_failure(&self) {
        self.backend
            .increment_counter(metric_names::DRAIN_FAILURES, 1)
            .await;
    }

    pub async fn record_worker_restart(&self) {
        self.backend
            .increment_counter(metric_names::WORKER_RESTARTS, 1)
            .await;
        self.backend
            .set_gauge(metric_names::PENDING_KEYS, 0.0)
            .await;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.backend.snapshot().await
    }
}
