//! One delivery lane: batch builder, bounded queue and sender task for a
//! single sink.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use plantwire_core::TelemetryRecord;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use super::queue::{BatchQueue, PushOutcome};
use super::retry::RetryPolicy;
use crate::config::DispatcherConfig;
use crate::sink::{DeliveryStatus, OutboundBatch, Sink, SinkKind};

/// Point-in-time counters for one lane.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub sink: String,
    pub records_submitted: u64,
    pub batches_sealed: u64,
    pub batches_delivered: u64,
    pub records_delivered: u64,
    pub retries: u64,
    /// Batches evicted from a full queue.
    pub dropped_backpressure: u64,
    /// Batches dropped after the retry budget ran out.
    pub dropped_exhausted: u64,
    /// Batches the sink rejected outright.
    pub dropped_permanent: u64,
    /// Records lost to any of the three drop reasons above.
    pub records_dropped: u64,
    /// Batches still pending when the drain timeout expired, or submitted
    /// after shutdown.
    pub abandoned: u64,
    pub queue_depth: usize,
}

#[derive(Debug, Default)]
struct Counters {
    records_submitted: AtomicU64,
    batches_sealed: AtomicU64,
    batches_delivered: AtomicU64,
    records_delivered: AtomicU64,
    retries: AtomicU64,
    dropped_backpressure: AtomicU64,
    dropped_exhausted: AtomicU64,
    dropped_permanent: AtomicU64,
    records_dropped: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Default)]
struct Builder {
    records: Vec<TelemetryRecord>,
    opened_at: Option<Instant>,
}

struct Shared {
    kind: SinkKind,
    sink: Arc<dyn Sink>,
    builder: Mutex<Builder>,
    opened: Notify,
    queue: BatchQueue,
    counters: Counters,
    policy: RetryPolicy,
    max_batch_size: usize,
    max_linger: Duration,
    backpressure: Duration,
}

impl Shared {
    /// Seal the builder's content and enqueue it. Must be called with the
    /// builder lock held so batches enter the queue in submission order.
    async fn seal_and_enqueue(&self, builder: &mut Builder) {
        if builder.records.is_empty() {
            return;
        }
        let records = std::mem::take(&mut builder.records);
        builder.opened_at = None;
        let batch = OutboundBatch::seal(self.kind, records);
        self.counters.batches_sealed.fetch_add(1, Ordering::Relaxed);

        match self.queue.push(batch, self.backpressure).await {
            PushOutcome::Enqueued => {}
            PushOutcome::DroppedOldest(oldest) => {
                self.counters.dropped_backpressure.fetch_add(1, Ordering::Relaxed);
                self.counters.records_dropped.fetch_add(oldest.len() as u64, Ordering::Relaxed);
                warn!(
                    lane = %self.kind,
                    sink = self.sink.name(),
                    batch_id = %oldest.id,
                    records = oldest.len(),
                    "queue full past backpressure timeout, dropped oldest batch"
                );
            }
            PushOutcome::Closed(batch) => {
                self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                debug!(lane = %self.kind, batch_id = %batch.id, "lane closed, batch abandoned");
            }
        }
    }

    async fn submit(&self, records: Vec<TelemetryRecord>) {
        if records.is_empty() {
            return;
        }
        self.counters.records_submitted.fetch_add(records.len() as u64, Ordering::Relaxed);

        let mut builder = self.builder.lock().await;
        for record in records {
            if builder.records.is_empty() {
                builder.opened_at = Some(Instant::now());
                self.opened.notify_one();
            }
            builder.records.push(record);
            if builder.records.len() >= self.max_batch_size {
                self.seal_and_enqueue(&mut builder).await;
            }
        }
    }

    /// Seal the builder if it has lingered long enough (or unconditionally
    /// with `force`).
    async fn flush(&self, force: bool) {
        let mut builder = self.builder.lock().await;
        let due = match builder.opened_at {
            Some(opened) => force || opened + self.max_linger <= Instant::now(),
            None => false,
        };
        if due {
            self.seal_and_enqueue(&mut builder).await;
        }
    }

    async fn deliver_with_retry(&self, mut batch: OutboundBatch) {
        batch.status = DeliveryStatus::InFlight;
        let salt = batch.id.as_u128() as u64;
        loop {
            match self.sink.deliver(&batch).await {
                Ok(()) => {
                    batch.status = DeliveryStatus::Acked;
                    self.counters.batches_delivered.fetch_add(1, Ordering::Relaxed);
                    self.counters.records_delivered.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    debug!(lane = %self.kind, batch_id = %batch.id, records = batch.len(), retries = batch.retries, "batch delivered");
                    return;
                }
                Err(e) if e.is_transient() && self.policy.should_retry(batch.retries) => {
                    batch.retries += 1;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.delay_for_attempt(batch.retries, salt);
                    warn!(
                        lane = %self.kind,
                        sink = self.sink.name(),
                        batch_id = %batch.id,
                        retry = batch.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "delivery failed, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    batch.status = DeliveryStatus::Failed;
                    let counter = if e.is_transient() {
                        &self.counters.dropped_exhausted
                    } else {
                        &self.counters.dropped_permanent
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    self.counters.records_dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
                    error!(
                        lane = %self.kind,
                        sink = self.sink.name(),
                        batch_id = %batch.id,
                        records = batch.len(),
                        retries = batch.retries,
                        error = %e,
                        "data loss: batch dropped"
                    );
                    return;
                }
            }
        }
    }

    fn stats(&self) -> LaneStats {
        let c = &self.counters;
        LaneStats {
            sink: self.sink.name().to_string(),
            records_submitted: c.records_submitted.load(Ordering::Relaxed),
            batches_sealed: c.batches_sealed.load(Ordering::Relaxed),
            batches_delivered: c.batches_delivered.load(Ordering::Relaxed),
            records_delivered: c.records_delivered.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            dropped_backpressure: c.dropped_backpressure.load(Ordering::Relaxed),
            dropped_exhausted: c.dropped_exhausted.load(Ordering::Relaxed),
            dropped_permanent: c.dropped_permanent.load(Ordering::Relaxed),
            records_dropped: c.records_dropped.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            queue_depth: self.queue.len(),
        }
    }
}

struct Tasks {
    stop_linger: watch::Sender<bool>,
    flusher: JoinHandle<()>,
    sender: JoinHandle<()>,
}

pub struct Lane {
    shared: Arc<Shared>,
    tasks: StdMutex<Option<Tasks>>,
}

impl std::fmt::Debug for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lane")
            .field("kind", &self.shared.kind)
            .field("sink", &self.shared.sink.name())
            .finish()
    }
}

impl Lane {
    /// Spawn the linger flusher and the sender task. Must be called inside
    /// a Tokio runtime.
    pub fn start(kind: SinkKind, sink: Arc<dyn Sink>, config: &DispatcherConfig) -> Self {
        let shared = Arc::new(Shared {
            kind,
            sink,
            builder: Mutex::new(Builder::default()),
            opened: Notify::new(),
            queue: BatchQueue::new(config.queue_capacity),
            counters: Counters::default(),
            policy: config.retry.policy(),
            max_batch_size: config.max_batch_size.max(1),
            max_linger: config.max_linger(),
            backpressure: config.backpressure_timeout(),
        });

        let (stop_linger, stop_rx) = watch::channel(false);
        let flusher = tokio::spawn(run_flusher(shared.clone(), stop_rx));
        let sender = tokio::spawn(run_sender(shared.clone()));

        info!(lane = %kind, sink = shared.sink.name(), "dispatcher lane started");
        Self {
            shared,
            tasks: StdMutex::new(Some(Tasks { stop_linger, flusher, sender })),
        }
    }

    pub fn kind(&self) -> SinkKind {
        self.shared.kind
    }

    pub async fn submit(&self, records: Vec<TelemetryRecord>) {
        self.shared.submit(records).await;
    }

    /// Seal whatever the builder holds right now.
    pub async fn flush(&self) {
        self.shared.flush(true).await;
    }

    pub fn stats(&self) -> LaneStats {
        self.shared.stats()
    }

    /// Flush, close the queue and wait up to `drain_timeout` for the sender
    /// to deliver what is pending. Batches still queued afterwards are
    /// abandoned and counted. Idempotent.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(tasks) = tasks else {
            return;
        };

        let _ = tasks.stop_linger.send(true);
        let _ = tasks.flusher.await;
        self.shared.flush(true).await;
        self.shared.queue.close();

        let mut sender = tasks.sender;
        match timeout(drain_timeout, &mut sender).await {
            Ok(_) => info!(lane = %self.shared.kind, "lane drained"),
            Err(_) => {
                sender.abort();
                let left = self.shared.queue.drain_remaining();
                let records: usize = left.iter().map(OutboundBatch::len).sum();
                self.shared.counters.abandoned.fetch_add(left.len() as u64, Ordering::Relaxed);
                error!(
                    lane = %self.shared.kind,
                    sink = self.shared.sink.name(),
                    batches = left.len(),
                    records,
                    "drain timeout expired, pending batches abandoned"
                );
            }
        }
    }
}

async fn run_flusher(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    loop {
        let deadline = shared.builder.lock().await.opened_at.map(|t| t + shared.max_linger);
        match deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => shared.flush(false).await,
                    _ = stop.changed() => return,
                }
            }
            None => {
                tokio::select! {
                    _ = shared.opened.notified() => {}
                    _ = stop.changed() => return,
                }
            }
        }
    }
}

async fn run_sender(shared: Arc<Shared>) {
    while let Some(batch) = shared.queue.pop().await {
        shared.deliver_with_retry(batch).await;
    }
    debug!(lane = %shared.kind, "sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::sink::InMemorySink;
    use crate::sink::in_memory::tests::reading;
    use crate::sink::SinkError;
    use async_trait::async_trait;

    fn config(max_batch_size: usize) -> DispatcherConfig {
        DispatcherConfig {
            max_batch_size,
            max_linger_ms: 1_000,
            queue_capacity: 4,
            backpressure_timeout_ms: 500,
            drain_timeout_secs: 5,
            retry: RetryConfig {
                max_attempts: 2,
                base_delay_ms: 100,
                max_delay_ms: 400,
                ..RetryConfig::default()
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn seals_at_max_batch_size() {
        let sink = Arc::new(InMemorySink::store());
        let lane = Lane::start(SinkKind::Store, sink.clone(), &config(2));

        lane.submit((0..5).map(|n| reading("S", n * 10, 1.0)).collect()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sink.delivered_batches().len(), 2);

        lane.shutdown(Duration::from_secs(1)).await;
        assert_eq!(sink.record_count(), 5);
        assert_eq!(lane.stats().batches_delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn linger_seals_a_partial_batch() {
        let sink = Arc::new(InMemorySink::bus());
        let lane = Lane::start(SinkKind::Bus, sink.clone(), &config(100));

        lane.submit(vec![reading("S", 0, 1.0)]).await;
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(sink.record_count(), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.record_count(), 1);

        lane.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_then_drop() {
        let sink = Arc::new(InMemorySink::bus());
        sink.set_available(false);
        let lane = Lane::start(SinkKind::Bus, sink.clone(), &config(1));

        lane.submit(vec![reading("S", 0, 1.0)]).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let stats = lane.stats();
        assert_eq!(sink.attempts(), 3);
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.dropped_exhausted, 1);
        assert_eq!(stats.records_dropped, 1);

        sink.set_available(true);
        lane.submit(vec![reading("S", 10, 2.0)]).await;
        lane.shutdown(Duration::from_secs(1)).await;
        assert_eq!(sink.record_count(), 1);
    }

    struct Rejecting;

    #[async_trait]
    impl Sink for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn deliver(&self, _batch: &OutboundBatch) -> Result<(), SinkError> {
            Err(SinkError::Rejected("check constraint".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let lane = Lane::start(SinkKind::Store, Arc::new(Rejecting), &config(1));
        lane.submit(vec![reading("S", 0, 1.0)]).await;
        lane.shutdown(Duration::from_secs(1)).await;

        let stats = lane.stats();
        assert_eq!(stats.retries, 0);
        assert_eq!(stats.dropped_permanent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_timeout_abandons_pending_batches() {
        let sink = Arc::new(InMemorySink::bus());
        sink.set_available(false);
        let mut cfg = config(1);
        cfg.retry.max_attempts = 100;
        cfg.retry.max_delay_ms = 10_000;
        let lane = Lane::start(SinkKind::Bus, sink.clone(), &cfg);

        lane.submit((0..3).map(|n| reading("S", n * 10, 1.0)).collect()).await;
        lane.shutdown(Duration::from_secs(2)).await;

        let stats = lane.stats();
        assert_eq!(stats.abandoned, 2);
        assert_eq!(stats.queue_depth, 0);

        lane.submit(vec![reading("S", 99, 1.0)]).await;
        lane.flush().await;
        assert_eq!(lane.stats().abandoned, 3);
    }
}
