//! Throttled writer example
//!
//! This example demonstrates:
//! - A producer updating a few hot keys much faster than they can be written
//! - A writer consuming `snapshots()` with a write interval
//! - Waiters notified once the change they asked for is written
//! - Latency timers measuring how long changes waited in the buffer

use a3s_change_queue::{ChangeQueueBuilder, StartedTimer, Timer, WAIT_FOR_DEQUEUE};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_stream::StreamExt;

type Ack = oneshot::Sender<u64>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== A3S Change Queue: Throttled Writer Example ===\n");

    let queue = ChangeQueueBuilder::<String, u64, Ack>::new()
        .with_write_interval(Duration::from_millis(200))
        .build()?;

    // Writer: one batch per interval, acknowledging every waiter of a key
    let writer = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut snapshots = queue.snapshots();
            let mut batches = 0;
            while let Some(snapshot) = snapshots.next().await {
                batches += 1;
                println!("Batch {}: writing {} keys", batches, snapshot.len());
                for (key, change) in snapshot {
                    let waited = change
                        .timers()
                        .iter()
                        .filter_map(|t| t.segment(WAIT_FOR_DEQUEUE))
                        .count();
                    let (_, version, waiters) = change.into_parts();
                    println!(
                        "  {} -> version {} ({} waiters, {} timed)",
                        key,
                        version,
                        waiters.len(),
                        waited
                    );
                    for ack in waiters {
                        let _ = ack.send(version);
                    }
                }
            }
            println!("Snapshot stream ended after {} batches", batches);
        })
    };

    // Producer: 50 updates over 3 keys
    let mut acks = Vec::new();
    for version in 1..=50u64 {
        let key = format!("table-{}", version % 3);
        let (ack, written) = oneshot::channel();
        let timer = StartedTimer::new(format!("update-{version}"));
        queue.submit_timed(key, version, Some(ack), timer);
        acks.push((version, written));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for (version, written) in acks {
        let written_version = written.await?;
        assert!(written_version >= version);
    }
    println!("\n✓ Every update acknowledged by a write of the same or a newer version");

    queue.shutdown().await;
    writer.await?;
    Ok(())
}
