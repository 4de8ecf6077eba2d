//! In-memory sink for tests and the demo configuration.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plantwire_core::TelemetryRecord;
use uuid::Uuid;

use super::{OutboundBatch, Sink, SinkError};

/// How delivered records are retained.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InMemoryMode {
    /// Append-only log, like a stream.
    Bus,
    /// Keyed upsert on `(entity_id, recorded_at)`, like the durable store.
    Store,
}

#[derive(Debug, Default)]
struct State {
    log: Vec<TelemetryRecord>,
    rows: BTreeMap<(String, DateTime<Utc>), TelemetryRecord>,
    batches: Vec<Uuid>,
}

#[derive(Debug)]
pub struct InMemorySink {
    name: String,
    mode: InMemoryMode,
    available: AtomicBool,
    attempts: AtomicU64,
    state: Mutex<State>,
}

impl InMemorySink {
    pub fn new(name: impl Into<String>, mode: InMemoryMode) -> Self {
        Self {
            name: name.into(),
            mode,
            available: AtomicBool::new(true),
            attempts: AtomicU64::new(0),
            state: Mutex::new(State::default()),
        }
    }

    pub fn bus() -> Self {
        Self::new("memory_bus", InMemoryMode::Bus)
    }

    pub fn store() -> Self {
        Self::new("memory_store", InMemoryMode::Store)
    }

    /// Simulate an outage: while unavailable every delivery fails transiently.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Retained records: log order for a bus, key order for a store.
    pub fn records(&self) -> Vec<TelemetryRecord> {
        let state = self.state();
        match self.mode {
            InMemoryMode::Bus => state.log.clone(),
            InMemoryMode::Store => state.rows.values().cloned().collect(),
        }
    }

    pub fn record_count(&self) -> usize {
        let state = self.state();
        match self.mode {
            InMemoryMode::Bus => state.log.len(),
            InMemoryMode::Store => state.rows.len(),
        }
    }

    /// Ids of acknowledged batches, in delivery order.
    pub fn delivered_batches(&self) -> Vec<Uuid> {
        self.state().batches.clone()
    }

    /// Every call to `deliver`, successful or not.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for InMemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, batch: &OutboundBatch) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(SinkError::Unavailable(format!("{} is offline", self.name)));
        }

        let mut state = self.state();
        match self.mode {
            InMemoryMode::Bus => state.log.extend(batch.records.iter().cloned()),
            InMemoryMode::Store => {
                for record in &batch.records {
                    state.rows.insert(record.key(), record.clone());
                }
            }
        }
        state.batches.push(batch.id);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sink::SinkKind;
    use chrono::Duration;
    use plantwire_core::{
        FactoryId, LineId, MachineId, Quality, Reading, SensorId, SensorKind, ThresholdFlags,
        ThresholdStatus, WindowStats,
    };

    pub(crate) fn reading(sensor: &str, offset_secs: i64, value: f64) -> TelemetryRecord {
        let at = DateTime::from_timestamp(1_772_431_200 + offset_secs, 0).unwrap();
        TelemetryRecord::SensorReading(Reading {
            sensor_id: SensorId::new(sensor),
            machine_id: MachineId::new("CNC-001"),
            line_id: LineId::new("F01-L1"),
            factory_id: FactoryId::new("F01"),
            sensor_kind: SensorKind::Vibration,
            recorded_at: at,
            value,
            unit: "mm/s".into(),
            quality: Quality::Good,
            flags: ThresholdFlags::default(),
            status: ThresholdStatus::Normal,
            window: WindowStats {
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

    #[tokio::test]
    async fn store_mode_resend_is_idempotent() {
        let sink = InMemorySink::store();
        let batch = OutboundBatch::seal(
            SinkKind::Store,
            vec![reading("CNC-001-VIB", 10, 9.0), reading("CNC-001-VIB", 20, 9.5)],
        );

        sink.deliver(&batch).await.unwrap();
        sink.deliver(&batch).await.unwrap();

        assert_eq!(sink.record_count(), 2);
        assert_eq!(sink.attempts(), 2);
    }

    #[tokio::test]
    async fn bus_mode_appends_in_order() {
        let sink = InMemorySink::bus();
        let batch = OutboundBatch::seal(
            SinkKind::Bus,
            vec![reading("A", 10, 1.0), reading("A", 20, 2.0)],
        );
        sink.deliver(&batch).await.unwrap();
        sink.deliver(&batch).await.unwrap();

        let times: Vec<_> = sink.records().iter().map(|r| r.recorded_at()).collect();
        assert_eq!(times.len(), 4);
        assert_eq!(times[1] - times[0], Duration::seconds(10));
    }

    #[tokio::test]
    async fn offline_sink_fails_transiently() {
        let sink = InMemorySink::bus();
        sink.set_available(false);
        let batch = OutboundBatch::seal(SinkKind::Bus, vec![reading("A", 10, 1.0)]);
        let err = sink.deliver(&batch).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(sink.record_count(), 0);
    }
}
