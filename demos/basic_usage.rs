//! Basic usage example
//!
//! This example demonstrates:
//! - Building a change queue
//! - Submitting changes, two of them for the same key
//! - Draining one coalesced snapshot

use a3s_change_queue::ChangeQueueBuilder;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== A3S Change Queue: Basic Usage Example ===\n");

    let queue = ChangeQueueBuilder::<String, String, String>::new().build()?;
    println!("✓ Change queue started");

    queue.submit("t1".into(), "v1".into(), Some("alice".into()));
    queue.submit("t2".into(), "v2".into(), Some("bob".into()));
    queue.submit("t1".into(), "v3".into(), Some("carol".into()));
    println!("✓ Submitted 3 changes for 2 keys\n");

    // Drains overtake queued changes; give the worker a moment to merge them
    tokio::time::sleep(Duration::from_millis(10)).await;

    let snapshot = queue.drain().await?;
    println!("Drained {} records:", snapshot.len());
    let mut keys: Vec<_> = snapshot.keys().cloned().collect();
    keys.sort();
    for key in keys {
        let change = &snapshot[&key];
        println!(
            "  {} = {} (waiters: {})",
            key,
            change.payload(),
            change.waiters().join(", ")
        );
    }

    let stats = queue.stats().await?;
    println!(
        "\nStats: enqueued={}, coalesced={}, pending={}",
        stats.enqueued_total, stats.coalesced_total, stats.pending
    );

    queue.shutdown().await;
    println!("\n✓ Change queue shut down");
    Ok(())
}
