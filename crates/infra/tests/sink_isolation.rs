//! Lane independence and at-least-once delivery.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use plantwire_core::{CatalogDocument, EntityCatalog, RecordKind, TelemetryRecord};
use plantwire_infra::config::DispatcherConfig;
use plantwire_infra::sink::{InMemorySink, OutboundBatch, Sink, SinkError};
use plantwire_infra::{PlantRuntime, PlantwireConfig, SimClock, SinkDispatcher};
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn dead_bus_never_costs_the_store_a_batch() {
    let bus = Arc::new(InMemorySink::bus());
    bus.set_available(false);
    let store = Arc::new(InMemorySink::store());

    let mut config = PlantwireConfig::default();
    config.simulation.seed = Some(11);
    config.scheduler.workers = 2;
    config.dispatcher.max_linger_ms = 500;
    config.dispatcher.retry.max_attempts = 2;
    config.dispatcher.retry.base_delay_ms = 100;

    let catalog = EntityCatalog::from_document(CatalogDocument::demo(1, 1, 3)).unwrap();
    let runtime = PlantRuntime::start_with(
        &config,
        catalog,
        Some(bus.clone() as Arc<dyn Sink>),
        Some(store.clone() as Arc<dyn Sink>),
        SimClock::new(DateTime::from_timestamp(1_772_431_200, 0).unwrap(), Instant::now()),
    );
    let handle = runtime.handle();

    let mut last_bus_drops = 0;
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        let stats = handle.stats().dispatcher;
        let bus_stats = stats.bus.unwrap();
        let drops = bus_stats.dropped_exhausted;
        assert!(drops >= last_bus_drops);
        last_bus_drops = drops;

        let store_stats = stats.store.unwrap();
        assert_eq!(store_stats.dropped_exhausted, 0);
        assert_eq!(store_stats.dropped_backpressure, 0);
        assert_eq!(store_stats.retries, 0);
    }
    assert!(last_bus_drops > 0);

    let report = runtime.shutdown().await;
    let emitted = report.stats.scheduler.readings_emitted + report.stats.scheduler.machine_records_emitted;
    assert_eq!(store.record_count() as u64, emitted);
    assert_eq!(bus.record_count(), 0);

    let store_stats = report.stats.dispatcher.store.unwrap();
    assert_eq!(store_stats.records_delivered, emitted);
    assert_eq!(store_stats.records_dropped, 0);
}

/// Applies every batch but reports the first attempt of each as lost.
struct LostAck {
    inner: InMemorySink,
    fail_next: AtomicU32,
}

#[async_trait]
impl Sink for LostAck {
    fn name(&self) -> &str {
        "lost_ack"
    }

    async fn deliver(&self, batch: &OutboundBatch) -> Result<(), SinkError> {
        self.inner.deliver(batch).await?;
        if self.fail_next.fetch_xor(1, Ordering::SeqCst) == 0 {
            return Err(SinkError::Connection("acknowledgement lost".into()));
        }
        Ok(())
    }
}

fn reading(sensor_secs: i64) -> TelemetryRecord {
    let doc = CatalogDocument::demo(1, 1, 1);
    let catalog = EntityCatalog::from_document(doc).unwrap();
    let sensor = catalog.machines().flat_map(|m| catalog.sensors_of(&m.id)).next().unwrap().clone();
    let at = DateTime::from_timestamp(1_772_431_200 + sensor_secs, 0).unwrap();
    let value = sensor.thresholds.normal_mid();
    TelemetryRecord::SensorReading(plantwire_core::Reading {
        sensor_id: sensor.id.clone(),
        machine_id: sensor.machine_id.clone(),
        line_id: sensor.line_id.clone(),
        factory_id: sensor.factory_id.clone(),
        sensor_kind: sensor.kind,
        recorded_at: at,
        value,
        unit: sensor.unit.clone(),
        quality: plantwire_core::Quality::Good,
        flags: sensor.thresholds.flags(value),
        status: sensor.thresholds.status(value),
        window: plantwire_core::WindowStats {
            window_secs: 300,
            window_end: at,
            count: 1,
            min: value,
            max: value,
            mean: value,
            stddev: 0.0,
        },
        anomaly_score: 0.0,
        is_anomaly: false,
        fault: None,
    })
}

#[tokio::test(start_paused = true)]
async fn resent_batches_do_not_duplicate_store_rows() {
    let store = Arc::new(LostAck {
        inner: InMemorySink::store(),
        fail_next: AtomicU32::new(0),
    });
    let mut config = DispatcherConfig::default();
    config.max_batch_size = 4;

    let dispatcher = SinkDispatcher::start(None, Some(store.clone() as Arc<dyn Sink>), &config);
    dispatcher.submit((0..10).map(|n| reading(n * 10)).collect()).await;
    dispatcher.shutdown().await;

    let stats = dispatcher.stats().store.unwrap();
    assert_eq!(stats.batches_sealed, 3);
    assert_eq!(stats.retries, 3);
    assert_eq!(stats.records_delivered, 10);
    assert_eq!(store.inner.record_count(), 10);
    assert_eq!(store.inner.attempts(), 6);
    assert!(store.inner.records().iter().all(|r| r.kind() == RecordKind::SensorReading));
}
