//! Observability features example
//!
//! This example demonstrates:
//! - Queue lifecycle events
//! - Metrics collection
//! - Buffer pressure monitoring

use a3s_change_queue::{
    events, metric_names, ChangeQueueBuilder, ChangeQueueMetrics, EventEmitter, MonitorConfig,
    QueueMonitor,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== A3S Change Queue: Observability Example ===\n");

    let emitter = EventEmitter::new(256);
    let metrics = ChangeQueueMetrics::local();

    let mut event_stream = emitter.subscribe_stream();
    tokio::spawn(async move {
        while let Some(event) = event_stream.next().await {
            let attributes = serde_json::to_string(&event.attributes).unwrap_or_default();
            println!("[event] {} {}", event.kind, attributes);
        }
    });

    let queue = ChangeQueueBuilder::<u32, String, ()>::new()
        .with_event_emitter(emitter)
        .with_metrics(metrics.clone())
        .with_write_interval(Duration::from_millis(50))
        .build()?;

    let monitor = Arc::new(QueueMonitor::with_config(
        queue.clone(),
        MonitorConfig {
            interval: Duration::from_millis(20),
            pending_warning_threshold: 100,
        },
    ));
    let monitor_task = Arc::clone(&monitor).start();

    // Fill the buffer past the threshold before anyone consumes it
    for round in 0..3 {
        for key in 0..200 {
            queue.submit(key, format!("round {round}"), None);
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Under pressure: {}", monitor.is_under_pressure());

    // Consume until the buffer is empty again
    let mut snapshots = queue.snapshots();
    let mut written = 0;
    while written < 200 {
        if let Some(snapshot) = snapshots.next().await {
            written += snapshot.len();
        }
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("Under pressure: {}", monitor.is_under_pressure());

    let snapshot = metrics.snapshot().await;
    println!("\n=== Metrics ===");
    for name in [
        metric_names::CHANGES_ENQUEUED,
        metric_names::CHANGES_COALESCED,
        metric_names::RECORDS_DRAINED,
        metric_names::SNAPSHOTS_EMITTED,
    ] {
        println!("{}: {}", name, snapshot.counters.get(name).copied().unwrap_or(0));
    }
    if let Some(sizes) = snapshot.histograms.get(metric_names::SNAPSHOT_SIZE) {
        println!("snapshot size: mean={:.1} max={}", sizes.mean, sizes.max);
    }

    queue.shutdown().await;
    monitor_task.await?;
    println!("\nLast event kind expected: {}", events::QUEUE_SHUTDOWN);
    Ok(())
}
