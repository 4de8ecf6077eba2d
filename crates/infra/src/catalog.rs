//! Master-data loading.
//!
//! Produces the immutable [`EntityCatalog`] snapshot the simulation runs
//! against, from one of three sources:
//!
//! - a JSON file shaped like [`CatalogDocument`]
//! - the Postgres master-data tables `factories`, `production_lines`,
//!   `machines` and `sensors`
//! - the built-in demo plant

use std::path::{Path, PathBuf};

use plantwire_core::{
    CatalogDocument, EntityCatalog, Factory, FactoryId, Line, LineId, MachineId, MachineKind, MachineSpec,
    PlantError, SensorId, SensorKind, SensorSpec, Thresholds,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info, instrument};

use crate::config::CatalogConfig;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("master-data query failed: {0}")]
    Database(String),

    #[error("invalid master data: {0}")]
    Invalid(#[from] PlantError),

    #[error("catalog source postgres requires a url or DATABASE_URL")]
    MissingUrl,
}

/// Build the catalog from the configured source.
pub async fn load_catalog(config: &CatalogConfig) -> Result<EntityCatalog, CatalogError> {
    let catalog = match config {
        CatalogConfig::File { path } => from_file(path)?,
        CatalogConfig::Postgres { url } => {
            let url = url.as_deref().ok_or(CatalogError::MissingUrl)?;
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(url)
                .await
                .map_err(|e| CatalogError::Database(e.to_string()))?;
            let doc = from_postgres(&pool).await;
            pool.close().await;
            EntityCatalog::from_document(doc?)?
        }
        CatalogConfig::Demo {
            factories,
            lines_per_factory,
            machines_per_line,
        } => EntityCatalog::from_document(CatalogDocument::demo(*factories, *lines_per_factory, *machines_per_line))?,
    };

    info!(
        factories = catalog.factory_count(),
        lines = catalog.line_count(),
        machines = catalog.machine_count(),
        sensors = catalog.sensor_count(),
        "catalog loaded"
    );
    Ok(catalog)
}

pub fn from_file(path: &Path) -> Result<EntityCatalog, CatalogError> {
    let text = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_json(&text)
}

pub fn from_json(text: &str) -> Result<EntityCatalog, CatalogError> {
    let doc: CatalogDocument = serde_json::from_str(text)?;
    Ok(EntityCatalog::from_document(doc)?)
}

fn db_err(table: &str, e: sqlx::Error) -> CatalogError {
    CatalogError::Database(format!("{table}: {e}"))
}

/// Read the master-data tables into a document. Optional sensor columns
/// (`unit`, thresholds, `sampling_interval_secs`) may be NULL and then fall
/// back to the sensor-kind profile.
#[instrument(skip(pool), err)]
pub async fn from_postgres(pool: &PgPool) -> Result<CatalogDocument, CatalogError> {
    let mut doc = CatalogDocument::default();

    for row in sqlx::query("SELECT id, name FROM factories ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("factories", e))?
    {
        doc.factories.push(Factory {
            id: FactoryId::new(get::<String>(&row, "factories", "id")?),
            name: get::<Option<String>>(&row, "factories", "name")?.unwrap_or_default(),
        });
    }

    for row in sqlx::query("SELECT id, factory_id, name FROM production_lines ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("production_lines", e))?
    {
        doc.lines.push(Line {
            id: LineId::new(get::<String>(&row, "production_lines", "id")?),
            factory_id: FactoryId::new(get::<String>(&row, "production_lines", "factory_id")?),
            name: get::<Option<String>>(&row, "production_lines", "name")?.unwrap_or_default(),
        });
    }

    for row in sqlx::query("SELECT id, line_id, kind, name, ideal_cycle_secs FROM machines ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(|e| db_err("machines", e))?
    {
        doc.machines.push(MachineSpec {
            id: MachineId::new(get::<String>(&row, "machines", "id")?),
            line_id: LineId::new(get::<String>(&row, "machines", "line_id")?),
            kind: get::<String>(&row, "machines", "kind")?.parse::<MachineKind>()?,
            name: get::<Option<String>>(&row, "machines", "name")?.unwrap_or_default(),
            ideal_cycle_secs: get::<Option<f64>>(&row, "machines", "ideal_cycle_secs")?,
        });
    }

    for row in sqlx::query(
        "SELECT id, machine_id, kind, unit, normal_min, normal_max, warning_low, warning_high, \
         critical_low, critical_high, sampling_interval_secs FROM sensors ORDER BY id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| db_err("sensors", e))?
    {
        let interval = get::<Option<i64>>(&row, "sensors", "sampling_interval_secs")?;
        doc.sensors.push(SensorSpec {
            id: SensorId::new(get::<String>(&row, "sensors", "id")?),
            machine_id: MachineId::new(get::<String>(&row, "sensors", "machine_id")?),
            kind: get::<String>(&row, "sensors", "kind")?.parse::<SensorKind>()?,
            unit: get::<Option<String>>(&row, "sensors", "unit")?,
            thresholds: thresholds_from_row(&row)?,
            sampling_interval_secs: interval
                .map(|secs| {
                    u64::try_from(secs)
                        .map_err(|_| PlantError::validation(format!("negative sampling interval {secs}")))
                })
                .transpose()?,
        });
    }

    Ok(doc)
}

fn get<'r, T>(row: &'r PgRow, table: &str, column: &str) -> Result<T, CatalogError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<T, _>(column)
        .map_err(|e| CatalogError::Database(format!("{table}.{column}: {e}")))
}

/// Thresholds are taken from the row only when the four mandatory limits
/// are all present.
fn thresholds_from_row(row: &PgRow) -> Result<Option<Thresholds>, CatalogError> {
    let limit = |column: &str| get::<Option<f64>>(row, "sensors", column);
    let (Some(normal_min), Some(normal_max), Some(warning_high), Some(critical_high)) = (
        limit("normal_min")?,
        limit("normal_max")?,
        limit("warning_high")?,
        limit("critical_high")?,
    ) else {
        return Ok(None);
    };
    let warning_low = limit("warning_low")?.unwrap_or(normal_min);
    Ok(Some(Thresholds {
        normal_min,
        normal_max,
        warning_low,
        warning_high,
        critical_low: limit("critical_low")?.unwrap_or(warning_low),
        critical_high,
    }))
}
