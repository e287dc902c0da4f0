//! Throttled emission of change snapshots
//!
//! [`SnapshotStream`] turns repeated drains into a lazy stream. Each tick
//! drains the queue; empty snapshots are swallowed and the next tick
//! starts, non-empty ones are yielded after stopping the
//! [`WAIT_FOR_DEQUEUE`] segment of every attached timer. With a non-zero
//! write interval, consecutive ticks start at least that far apart; the
//! first tick starts immediately.
//!
//! The stream is pull-driven: no drain happens while the consumer is not
//! polling. It ends once the queue is shut down or its worker is lost for
//! good.

use crate::change::{ChangeKey, ChangeSnapshot};
use crate::event::{events, QueueEvent};
use crate::queue::ChangeQueue;
use crate::timer::WAIT_FOR_DEQUEUE;
use futures_core::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::time::{sleep_until, Instant, Sleep};
use tracing::{debug, trace};

type Tick<K, P, W> = Pin<Box<dyn Future<Output = Option<ChangeSnapshot<K, P, W>>> + Send>>;

/// Stream of non-empty snapshots drained from a [`ChangeQueue`]
pub struct SnapshotStream<K, P, W> {
    queue: ChangeQueue<K, P, W>,
    write_interval: Duration,
    /// Earliest start of the next tick; created by the first throttled tick
    throttle: Option<Pin<Box<Sleep>>>,
    in_flight: Option<Tick<K, P, W>>,
    finished: bool,
}

impl<K, P, W> SnapshotStream<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    pub(crate) fn new(queue: ChangeQueue<K, P, W>, write_interval: Duration) -> Self {
        Self {
            queue,
            write_interval,
            throttle: None,
            in_flight: None,
            finished: false,
        }
    }

    pub fn write_interval(&self) -> Duration {
        self.write_interval
    }

    fn start_tick(&mut self) -> Tick<K, P, W> {
        if !self.write_interval.is_zero() {
            let next = Instant::now() + self.write_interval;
            match &mut self.throttle {
                Some(throttle) => throttle.as_mut().reset(next),
                slot @ None => *slot = Some(Box::pin(sleep_until(next))),
            }
        }
        let queue = self.queue.clone();
        Box::pin(async move {
            let snapshot = queue.tick().await?;
            #[cfg(feature = "metrics")]
            if !snapshot.is_empty() {
                if let Some(metrics) = queue.metrics() {
                    metrics.record_snapshot_emitted(snapshot.len()).await;
                }
            }
            Some(snapshot)
        })
    }

    fn emit(&self, snapshot: &ChangeSnapshot<K, P, W>) {
        let stopped: usize = snapshot
            .values()
            .map(|change| change.stop_segment(WAIT_FOR_DEQUEUE))
            .sum();
        let waiters: usize = snapshot.values().map(|change| change.waiters().len()).sum();
        debug!(records = snapshot.len(), waiters, stopped, "Emitting change snapshot");
        self.queue.emitter().emit(
            QueueEvent::new(events::SNAPSHOT_EMITTED)
                .with("records", snapshot.len())
                .with("waiters", waiters),
        );
    }
}

impl<K, P, W> Stream for SnapshotStream<K, P, W>
where
    K: ChangeKey,
    P: Send + 'static,
    W: Send + 'static,
{
    type Item = ChangeSnapshot<K, P, W>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            if this.in_flight.is_none() {
                if let Some(throttle) = this.throttle.as_mut() {
                    ready!(throttle.as_mut().poll(cx));
                }
                let tick = this.start_tick();
                this.in_flight = Some(tick);
            }

            let Some(tick) = this.in_flight.as_mut() else {
                continue;
            };
            let outcome = ready!(tick.as_mut().poll(cx));
            this.in_flight = None;

            match outcome {
                None => {
                    debug!("Change queue closed, ending snapshot stream");
                    this.finished = true;
                }
                Some(snapshot) if snapshot.is_empty() => {
                    trace!("Nothing pending, waiting for the next tick");
                }
                Some(snapshot) => {
                    this.emit(&snapshot);
                    return Poll::Ready(Some(snapshot));
                }
            }
        }
    }
}
