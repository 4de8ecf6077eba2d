//! Postgres durable-store sink.
//!
//! ## Schema
//!
//! One table per record kind (`sensor_readings`, `machine_states`), keyed on
//! `(entity_id, recorded_at)`. Rows carry the full record body as JSONB plus
//! the id of the batch that last wrote them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | SinkError |
//! |------------|----------------------|-----------|
//! | Database | `22***` (data exception) | `Rejected` |
//! | Database | `23***` (integrity violation) | `Rejected` |
//! | Database | other | `Command` |
//! | Io / Tls / PoolTimedOut / PoolClosed | N/A | `Connection` |
//! | Other | N/A | `Command` |
//!
//! Inserts upsert on the primary key, so a batch re-sent after a lost
//! acknowledgement leaves exactly one row per `(entity_id, recorded_at)`.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use plantwire_core::{RecordKind, TelemetryRecord};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, instrument, warn};

use super::{OutboundBatch, Sink, SinkError};

/// Rows per INSERT statement; keeps bind parameters well under the
/// protocol limit of 65535.
const ROWS_PER_STATEMENT: usize = 1000;

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS sensor_readings (
        entity_id   TEXT        NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL,
        batch_id    UUID        NOT NULL,
        payload     JSONB       NOT NULL,
        PRIMARY KEY (entity_id, recorded_at)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS machine_states (
        entity_id   TEXT        NOT NULL,
        recorded_at TIMESTAMPTZ NOT NULL,
        batch_id    UUID        NOT NULL,
        payload     JSONB       NOT NULL,
        PRIMARY KEY (entity_id, recorded_at)
    )"#,
];

#[derive(Debug)]
pub struct PostgresSink {
    pool: PgPool,
    schema_ready: AtomicBool,
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code() {
                Some(code) if code.starts_with("22") || code.starts_with("23") => SinkError::Rejected(msg),
                _ => SinkError::Command(msg),
            }
        }
        sqlx::Error::Io(e) => SinkError::Connection(format!("io error in {}: {}", operation, e)),
        sqlx::Error::Tls(e) => SinkError::Connection(format!("tls error in {}: {}", operation, e)),
        sqlx::Error::PoolTimedOut => SinkError::Connection(format!("pool timed out in {}", operation)),
        sqlx::Error::PoolClosed => SinkError::Connection(format!("connection pool closed in {}", operation)),
        other => SinkError::Command(format!("{}: {}", operation, other)),
    }
}

impl PostgresSink {
    /// Build a pool without connecting; the first delivery opens connections.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(database_url)
            .map_err(|e| map_sqlx_error("connect_lazy", e))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: AtomicBool::new(false),
        }
    }

    /// Create the telemetry tables if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), SinkError> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        self.schema_ready.store(true, Ordering::Release);
        debug!("telemetry schema ready");
        Ok(())
    }

    fn upsert_statement<'a>(
        kind: RecordKind,
        batch: &OutboundBatch,
        rows: &'a [(&'a TelemetryRecord, serde_json::Value)],
    ) -> QueryBuilder<'a, Postgres> {
        let mut qb = QueryBuilder::new(format!(
            "INSERT INTO {} (entity_id, recorded_at, batch_id, payload) ",
            kind.collection()
        ));
        let batch_id = batch.id;
        qb.push_values(rows, |mut b, (record, payload)| {
            b.push_bind(record.entity_id().to_string())
                .push_bind(record.recorded_at())
                .push_bind(batch_id)
                .push_bind(payload);
        });
        qb.push(
            " ON CONFLICT (entity_id, recorded_at) DO UPDATE \
             SET batch_id = EXCLUDED.batch_id, payload = EXCLUDED.payload",
        );
        qb
    }
}

#[async_trait]
impl Sink for PostgresSink {
    fn name(&self) -> &str {
        "postgres"
    }

    #[instrument(skip(self, batch), fields(batch_id = %batch.id, records = batch.records.len()), err)]
    async fn deliver(&self, batch: &OutboundBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.ensure_schema().await {
            warn!(error = %e, "schema not ready, retrying with this batch");
            return Err(e);
        }

        let mut readings = Vec::new();
        let mut states = Vec::new();
        for record in &batch.records {
            let payload = record.payload()?;
            match record.kind() {
                RecordKind::SensorReading => readings.push((record, payload)),
                RecordKind::MachineState => states.push((record, payload)),
            }
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for (kind, rows) in [(RecordKind::SensorReading, &readings), (RecordKind::MachineState, &states)] {
            for chunk in rows.chunks(ROWS_PER_STATEMENT) {
                Self::upsert_statement(kind, batch, chunk)
                    .build()
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error(kind.collection(), e))?;
            }
        }

        tx.commit().await.map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }
}
