//! Outbound sinks.
//!
//! A sink receives sealed batches from one dispatcher lane. Delivery is
//! at-least-once: a batch may be re-sent after a transient failure, so the
//! durable store upserts on `(entity_id, recorded_at)` and bus consumers
//! dedupe on the same key.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use plantwire_core::TelemetryRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use in_memory::{InMemoryMode, InMemorySink};
pub use postgres::PostgresSink;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsSink;

/// Which lane a batch belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    Bus,
    Store,
}

impl SinkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkKind::Bus => "bus",
            SinkKind::Store => "store",
        }
    }
}

impl std::fmt::Display for SinkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Acked,
    Failed,
}

/// Ordered group of records bound for one sink.
#[derive(Debug, Clone)]
pub struct OutboundBatch {
    pub id: Uuid,
    pub sink: SinkKind,
    pub records: Vec<TelemetryRecord>,
    pub sealed_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// Delivery attempts after the first one.
    pub retries: u32,
}

impl OutboundBatch {
    pub fn seal(sink: SinkKind, records: Vec<TelemetryRecord>) -> Self {
        Self {
            id: Uuid::now_v7(),
            sink,
            records,
            sealed_at: Utc::now(),
            status: DeliveryStatus::Pending,
            retries: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// The sink refused the data itself (constraint violation, bad type);
    /// resending the same batch cannot succeed.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SinkError::Connection(_) | SinkError::Command(_) | SinkError::Unavailable(_)
        )
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(e: serde_json::Error) -> Self {
        SinkError::Serialization(e.to_string())
    }
}

/// Destination for sealed batches.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// Short name used in logs and stats (`redis_streams`, `postgres`, ...).
    fn name(&self) -> &str;

    /// Deliver every record of `batch` or fail as a whole.
    async fn deliver(&self, batch: &OutboundBatch) -> Result<(), SinkError>;
}
