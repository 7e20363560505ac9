//! # Edge Queue
//!
//! Bounded hand-off between GPIO interrupt callbacks and the decode task.
//!
//! Interrupt callbacks run on threads we do not control, so the producer side
//! must never block: [`EdgeProducer::enqueue`] uses `try_send` and simply drops
//! the edge when the queue is full. Dropped edges only show up in a counter;
//! the decoder's invalid-transition handling recovers from the gap at the next
//! detent.
//!
//! The consumer side waits with a timeout so the decode task wakes up
//! periodically for housekeeping even when the knob is untouched.

use crate::EdgeEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Default queue depth, matching the number of edges a fast spin can produce
/// before the decoder gets scheduled again.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Returned by [`EdgeConsumer::dequeue`] once the queue is closed and drained.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("edge queue closed")]
pub struct QueueClosed;

/// Create a bounded edge queue with the given capacity (at least one slot).
pub fn edge_queue(capacity: usize) -> (EdgeProducer, EdgeConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        EdgeProducer {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EdgeConsumer { rx, dropped },
    )
}

/// Interrupt-side handle. Cheap to clone, one per registered line.
#[derive(Clone, Debug)]
pub struct EdgeProducer {
    tx: mpsc::Sender<EdgeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EdgeProducer {
    /// Push an edge without blocking.
    ///
    /// Returns `false` if the edge was dropped, either because the queue is
    /// full or because it has been closed.
    pub fn enqueue(&self, event: EdgeEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }
}

/// Decode-task side of the queue. There is exactly one.
#[derive(Debug)]
pub struct EdgeConsumer {
    rx: mpsc::Receiver<EdgeEvent>,
    dropped: Arc<AtomicU64>,
}

impl EdgeConsumer {
    /// Wait up to `timeout` for the next edge.
    ///
    /// - `Ok(Some(edge))`: an edge arrived
    /// - `Ok(None)`: timed out, nothing pending
    /// - `Err(QueueClosed)`: the queue was closed and every pending edge has
    ///   already been handed out
    pub async fn dequeue(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<EdgeEvent>, QueueClosed> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            Ok(None) => Err(QueueClosed),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Stop accepting new edges. Edges already queued can still be dequeued.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Number of edges rejected so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Level, PinId};

    fn edge(channel: PinId, level: Level) -> EdgeEvent {
        EdgeEvent { channel, level }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (producer, mut consumer) = edge_queue(8);
        assert!(producer.enqueue(edge(PinId::EncoderA, Level::Low)));
        assert!(producer.enqueue(edge(PinId::EncoderB, Level::Low)));
        assert!(producer.enqueue(edge(PinId::EncoderA, Level::High)));

        let timeout = Duration::from_millis(10);
        assert_eq!(
            consumer.dequeue(timeout).await,
            Ok(Some(edge(PinId::EncoderA, Level::Low)))
        );
        assert_eq!(
            consumer.dequeue(timeout).await,
            Ok(Some(edge(PinId::EncoderB, Level::Low)))
        );
        assert_eq!(
            consumer.dequeue(timeout).await,
            Ok(Some(edge(PinId::EncoderA, Level::High)))
        );
    }

    #[tokio::test]
    async fn test_full_queue_rejects_and_counts() {
        let (producer, consumer) = edge_queue(2);
        assert!(producer.enqueue(edge(PinId::EncoderA, Level::Low)));
        assert!(producer.enqueue(edge(PinId::EncoderA, Level::High)));

        // Third edge has nowhere to go
        assert!(!producer.enqueue(edge(PinId::EncoderB, Level::Low)));
        assert!(!producer.enqueue(edge(PinId::EncoderB, Level::High)));
        assert_eq!(consumer.dropped(), 2);
    }

    #[tokio::test]
    async fn test_zero_capacity_holds_one_edge() {
        let (producer, mut consumer) = edge_queue(0);
        assert!(producer.enqueue(edge(PinId::EncoderA, Level::Low)));
        assert!(!producer.enqueue(edge(PinId::EncoderA, Level::High)));
        assert_eq!(
            consumer.dequeue(Duration::from_millis(10)).await,
            Ok(Some(edge(PinId::EncoderA, Level::Low)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_with_none() {
        let (_producer, mut consumer) = edge_queue(4);
        let got = consumer.dequeue(Duration::from_millis(500)).await;
        assert_eq!(got, Ok(None));
    }

    #[tokio::test]
    async fn test_close_drains_then_reports_closed() {
        let (producer, mut consumer) = edge_queue(4);
        assert!(producer.enqueue(edge(PinId::Button, Level::Low)));
        consumer.close();

        // Closed queue rejects new edges
        assert!(!producer.enqueue(edge(PinId::Button, Level::High)));

        let timeout = Duration::from_millis(10);
        assert_eq!(
            consumer.dequeue(timeout).await,
            Ok(Some(edge(PinId::Button, Level::Low)))
        );
        assert_eq!(consumer.dequeue(timeout).await, Err(QueueClosed));
    }

    #[test]
    fn test_enqueue_from_plain_threads() {
        let (producer, mut consumer) = edge_queue(DEFAULT_CAPACITY);
        let handles: Vec<_> = [PinId::EncoderA, PinId::EncoderB]
            .into_iter()
            .map(|pin| {
                let producer = producer.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        producer.enqueue(edge(pin, Level::from(i % 2 == 0)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let received = rt.block_on(async {
            let mut count = 0;
            while let Ok(Some(_)) = consumer.dequeue(Duration::from_millis(10)).await {
                count += 1;
            }
            count
        });
        assert_eq!(received, 200);
        assert_eq!(consumer.dropped(), 0);
    }
}
