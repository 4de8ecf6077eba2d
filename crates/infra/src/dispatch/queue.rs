//! Bounded FIFO of sealed batches between a lane's producers and its sender.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

use crate::sink::OutboundBatch;

/// Result of [`BatchQueue::push`].
#[derive(Debug)]
pub enum PushOutcome {
    Enqueued,
    /// The queue stayed full past the backpressure timeout; the batch was
    /// enqueued and the returned, oldest pending batch evicted.
    DroppedOldest(OutboundBatch),
    /// The queue no longer accepts batches; the batch is handed back.
    Closed(OutboundBatch),
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<OutboundBatch>,
    closed: bool,
}

#[derive(Debug)]
pub struct BatchQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
}

impl BatchQueue {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Enqueue `batch`, waiting up to `backpressure` for a free slot.
    pub async fn push(&self, batch: OutboundBatch, backpressure: Duration) -> PushOutcome {
        let deadline = Instant::now() + backpressure;
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if inner.closed {
                    return PushOutcome::Closed(batch);
                }
                if inner.items.len() < self.capacity {
                    inner.items.push_back(batch);
                    drop(inner);
                    self.not_empty.notify_one();
                    return PushOutcome::Enqueued;
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                let mut inner = self.lock();
                if inner.closed {
                    return PushOutcome::Closed(batch);
                }
                let evicted = if inner.items.len() >= self.capacity {
                    inner.items.pop_front()
                } else {
                    None
                };
                inner.items.push_back(batch);
                drop(inner);
                self.not_empty.notify_one();
                return match evicted {
                    Some(oldest) => PushOutcome::DroppedOldest(oldest),
                    None => PushOutcome::Enqueued,
                };
            }
        }
    }

    /// Next batch in FIFO order; `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<OutboundBatch> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(batch) = inner.items.pop_front() {
                    drop(inner);
                    self.not_full.notify_one();
                    return Some(batch);
                }
                if inner.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting batches; pending ones can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    /// Remove and return whatever is still pending.
    pub fn drain_remaining(&self) -> Vec<OutboundBatch> {
        self.lock().items.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkKind;
    use crate::sink::in_memory::tests::reading;
    use std::sync::Arc;

    fn batch(n: i64) -> OutboundBatch {
        OutboundBatch::seal(SinkKind::Store, vec![reading("M-T", n, n as f64)])
    }

    fn first_offset(b: &OutboundBatch) -> f64 {
        match &b.records[0] {
            plantwire_core::TelemetryRecord::SensorReading(r) => r.value,
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_the_oldest_after_the_timeout() {
        let queue = BatchQueue::new(3);
        let mut dropped = 0;
        for n in 0..4 {
            match queue.push(batch(n), Duration::from_secs(2)).await {
                PushOutcome::Enqueued => {}
                PushOutcome::DroppedOldest(old) => {
                    dropped += 1;
                    assert_eq!(first_offset(&old), 0.0);
                }
                PushOutcome::Closed(_) => panic!("queue closed"),
            }
        }
        assert_eq!(dropped, 1);

        let remaining: Vec<f64> = queue.drain_remaining().iter().map(first_offset).collect();
        assert_eq!(remaining, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_producer_resumes_when_a_slot_frees() {
        let queue = Arc::new(BatchQueue::new(1));
        assert!(matches!(queue.push(batch(0), Duration::from_secs(5)).await, PushOutcome::Enqueued));

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(batch(1), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let first = queue.pop().await.unwrap();
        assert_eq!(first_offset(&first), 0.0);

        assert!(matches!(producer.await.unwrap(), PushOutcome::Enqueued));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn close_wakes_the_consumer_after_draining() {
        let queue = Arc::new(BatchQueue::new(4));
        assert!(matches!(queue.push(batch(0), Duration::ZERO).await, PushOutcome::Enqueued));
        queue.close();

        assert!(queue.pop().await.is_some());
        assert!(queue.pop().await.is_none());
        assert!(matches!(queue.push(batch(1), Duration::ZERO).await, PushOutcome::Closed(_)));
    }
}
