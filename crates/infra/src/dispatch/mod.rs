//! Batching and delivery of telemetry records to the message bus and the
//! durable store.
//!
//! Each sink gets its own [`Lane`]; a slow or failing bus never delays or
//! drops store batches, and vice versa. Within a lane the builder lock is
//! held across the enqueue, the queue is FIFO and the sender keeps a single
//! batch in flight, so records of one entity reach the sink in the order
//! they were submitted.

pub mod lane;
pub mod queue;
pub mod retry;

use std::sync::Arc;
use std::time::Duration;

use plantwire_core::TelemetryRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::DispatcherConfig;
use crate::sink::{Sink, SinkKind};

pub use lane::{Lane, LaneStats};
pub use queue::{BatchQueue, PushOutcome};
pub use retry::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub bus: Option<LaneStats>,
    pub store: Option<LaneStats>,
}

#[derive(Debug)]
pub struct SinkDispatcher {
    bus: Option<Lane>,
    store: Option<Lane>,
    drain_timeout: Duration,
}

impl SinkDispatcher {
    /// Start one lane per configured sink. A `None` sink is disabled and
    /// its records are discarded at submission.
    pub fn start(bus: Option<Arc<dyn Sink>>, store: Option<Arc<dyn Sink>>, config: &DispatcherConfig) -> Self {
        let bus = bus.map(|sink| Lane::start(SinkKind::Bus, sink, config));
        let store = store.map(|sink| Lane::start(SinkKind::Store, sink, config));
        if bus.is_none() && store.is_none() {
            info!("no sinks enabled, telemetry will be generated and discarded");
        }
        Self {
            bus,
            store,
            drain_timeout: config.drain_timeout(),
        }
    }

    pub fn lane(&self, kind: SinkKind) -> Option<&Lane> {
        match kind {
            SinkKind::Bus => self.bus.as_ref(),
            SinkKind::Store => self.store.as_ref(),
        }
    }

    /// Hand `records` to every enabled lane. Blocks only while a lane's
    /// queue is full, at most for the backpressure timeout.
    pub async fn submit(&self, records: Vec<TelemetryRecord>) {
        match (&self.bus, &self.store) {
            (Some(bus), Some(store)) => {
                tokio::join!(bus.submit(records.clone()), store.submit(records));
            }
            (Some(lane), None) | (None, Some(lane)) => lane.submit(records).await,
            (None, None) => {}
        }
    }

    pub async fn flush(&self) {
        match (&self.bus, &self.store) {
            (Some(bus), Some(store)) => {
                tokio::join!(bus.flush(), store.flush());
            }
            (Some(lane), None) | (None, Some(lane)) => lane.flush().await,
            (None, None) => {}
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            bus: self.bus.as_ref().map(Lane::stats),
            store: self.store.as_ref().map(Lane::stats),
        }
    }

    /// Flush both builders and drain both lanes concurrently, each bounded
    /// by the configured drain timeout.
    pub async fn shutdown(&self) {
        let timeout = self.drain_timeout;
        let bus = async {
            if let Some(lane) = &self.bus {
                lane.shutdown(timeout).await;
            }
        };
        let store = async {
            if let Some(lane) = &self.store {
                lane.shutdown(timeout).await;
            }
        };
        tokio::join!(bus, store);
        info!(stats = ?self.stats(), "dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InMemorySink;
    use crate::sink::in_memory::tests::reading;

    #[tokio::test(start_paused = true)]
    async fn both_lanes_receive_every_record() {
        let bus = Arc::new(InMemorySink::bus());
        let store = Arc::new(InMemorySink::store());
        let dispatcher = SinkDispatcher::start(Some(bus.clone() as Arc<dyn Sink>), Some(store.clone() as Arc<dyn Sink>), &DispatcherConfig::default());

        dispatcher.submit((0..7).map(|n| reading("S", n, 1.0)).collect()).await;
        dispatcher.shutdown().await;

        assert_eq!(bus.record_count(), 7);
        assert_eq!(store.record_count(), 7);
        let stats = dispatcher.stats();
        assert_eq!(stats.bus.unwrap().records_delivered, 7);
        assert_eq!(stats.store.unwrap().sink, "memory_store");
    }

    #[tokio::test(start_paused = true)]
    async fn failing_bus_does_not_affect_the_store() {
        let bus = Arc::new(InMemorySink::bus());
        bus.set_available(false);
        let store = Arc::new(InMemorySink::store());
        let mut config = DispatcherConfig::default();
        config.max_batch_size = 1;
        config.retry.max_attempts = 1;
        let dispatcher = SinkDispatcher::start(Some(bus.clone() as Arc<dyn Sink>), Some(store.clone() as Arc<dyn Sink>), &config);

        for n in 0..3 {
            dispatcher.submit(vec![reading("S", n * 10, 1.0)]).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        dispatcher.shutdown().await;

        let stats = dispatcher.stats();
        let bus_stats = stats.bus.unwrap();
        let store_stats = stats.store.unwrap();
        assert_eq!(bus_stats.dropped_exhausted, 3);
        assert_eq!(store_stats.dropped_exhausted + store_stats.dropped_backpressure, 0);
        assert_eq!(store.record_count(), 3);
    }

    #[tokio::test]
    async fn disabled_sinks_discard() {
        let dispatcher = SinkDispatcher::start(None, None, &DispatcherConfig::default());
        dispatcher.submit(vec![reading("S", 0, 1.0)]).await;
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.stats(), DispatcherStats::default());
    }
}
