//! Redis Streams message-bus sink.
//!
//! ## Layout
//!
//! - **Stream key**: `<prefix>:sensor_readings` and `<prefix>:machine_states`
//!   (one stream per record kind)
//! - **Entry fields**: `entity_id`, `timestamp` (RFC 3339), `kind`,
//!   `batch_id`, `payload` (JSON record body)
//! - **Retention**: `XADD ... MAXLEN ~ <max_len>` trims each stream
//!   approximately
//!
//! A batch is written as one `MULTI`/`EXEC` pipeline, so a failed attempt
//! leaves no partial batch behind. Delivery is still at-least-once: if `EXEC`
//! commits but the reply is lost, the retry appends the batch again under new
//! entry ids. Consumers dedupe on `(entity_id, timestamp)`; `batch_id` tells
//! a resend apart from a genuinely new reading.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{instrument, warn};

use super::{OutboundBatch, Sink, SinkError};

#[derive(Clone)]
pub struct RedisStreamsSink {
    client: Arc<redis::Client>,
    stream_prefix: String,
    max_len: u64,
    /// Lazily (re)established; dropped after a connection-level failure.
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
}

impl std::fmt::Debug for RedisStreamsSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsSink")
            .field("stream_prefix", &self.stream_prefix)
            .field("max_len", &self.max_len)
            .finish()
    }
}

fn map_redis_error(operation: &str, err: redis::RedisError) -> SinkError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        SinkError::Connection(format!("{operation}: {err}"))
    } else {
        SinkError::Command(format!("{operation}: {err}"))
    }
}

impl RedisStreamsSink {
    /// Create a sink; no connection is made until the first delivery.
    ///
    /// * `redis_url` - e.g. `redis://localhost:6379`
    /// * `stream_prefix` - key prefix shared by both streams
    pub fn new(redis_url: impl AsRef<str>, stream_prefix: impl Into<String>, max_len: u64) -> Result<Self, SinkError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| SinkError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
            stream_prefix: stream_prefix.into(),
            max_len,
            conn: Arc::new(Mutex::new(None)),
        })
    }

    pub fn stream_key(&self, collection: &str) -> String {
        format!("{}:{}", self.stream_prefix, collection)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, SinkError> {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.conn.lock().await = None;
    }

    fn build_pipeline(&self, batch: &OutboundBatch) -> Result<redis::Pipeline, SinkError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        let batch_id = batch.id.to_string();

        for record in &batch.records {
            let kind = record.kind();
            let payload = serde_json::to_string(&record.payload()?)?;
            pipe.cmd("XADD")
                .arg(self.stream_key(kind.collection()))
                .arg("MAXLEN")
                .arg("~")
                .arg(self.max_len)
                .arg("*")
                .arg("entity_id")
                .arg(record.entity_id())
                .arg("timestamp")
                .arg(record.recorded_at().to_rfc3339())
                .arg("kind")
                .arg(kind.collection())
                .arg("batch_id")
                .arg(&batch_id)
                .arg("payload")
                .arg(payload)
                .ignore();
        }
        Ok(pipe)
    }
}

#[async_trait]
impl Sink for RedisStreamsSink {
    fn name(&self) -> &str {
        "redis_streams"
    }

    #[instrument(
        skip(self, batch),
        fields(batch_id = %batch.id, records = batch.records.len(), prefix = %self.stream_prefix),
        err
    )]
    async fn deliver(&self, batch: &OutboundBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let pipe = self.build_pipeline(batch)?;
        let mut conn = self.connection().await?;

        let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        if let Err(e) = result {
            let err = map_redis_error("XADD pipeline", e);
            if matches!(err, SinkError::Connection(_)) {
                warn!(error = %err, "dropping redis connection");
                self.reset_connection().await;
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::SinkKind;
    use crate::sink::in_memory::tests::reading;

    #[test]
    fn stream_keys_use_the_prefix() {
        let sink = RedisStreamsSink::new("redis://127.0.0.1:6379", "plant-a", 1000).unwrap();
        assert_eq!(sink.stream_key("sensor_readings"), "plant-a:sensor_readings");
    }

    #[test]
    fn pipeline_has_one_xadd_per_record() {
        let sink = RedisStreamsSink::new("redis://127.0.0.1:6379", "plantwire", 1000).unwrap();
        let batch = OutboundBatch::seal(
            SinkKind::Bus,
            vec![reading("CNC-001-VIB", 10, 9.0), reading("CNC-001-VIB", 20, 9.5)],
        );
        let packed = sink.build_pipeline(&batch).unwrap().get_packed_pipeline();
        let xadds = packed.windows(4).filter(|w| *w == &b"XADD"[..]).count();
        assert_eq!(xadds, 2);
    }

    #[test]
    fn entries_carry_the_dedupe_key_and_batch_id() {
        let sink = RedisStreamsSink::new("redis://127.0.0.1:6379", "plantwire", 1000).unwrap();
        let record = reading("CNC-001-VIB", 10, 9.0);
        let batch = OutboundBatch::seal(SinkKind::Bus, vec![record.clone()]);
        let packed = String::from_utf8_lossy(&sink.build_pipeline(&batch).unwrap().get_packed_pipeline()).into_owned();

        assert!(packed.contains("CNC-001-VIB"));
        assert!(packed.contains(&record.recorded_at().to_rfc3339()));
        assert!(packed.contains(&batch.id.to_string()));
    }

    #[test]
    fn invalid_url_is_a_connection_error() {
        assert!(matches!(
            RedisStreamsSink::new("not a url", "p", 10),
            Err(SinkError::Connection(_))
        ));
    }
}
