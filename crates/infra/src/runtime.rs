//! Process-level wiring: catalog, sinks, dispatcher and scheduler started
//! in order and torn down in reverse.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use plantwire_core::{EntityCatalog, FaultKind, MachineId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::catalog::{CatalogError, load_catalog};
use crate::config::{BusSinkConfig, ConfigError, PlantwireConfig, SinksConfig, StoreSinkConfig};
use crate::dispatch::{DispatcherStats, SinkDispatcher};
use crate::scheduler::{ControlError, Scheduler, SchedulerControl, SchedulerProbe, SchedulerStats, SimClock};
use crate::sink::{InMemorySink, PostgresSink, Sink, SinkError};
use crate::supervisor::{SupervisorError, SupervisorProbe, SupervisorStats};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("sink setup failed: {0}")]
    Sink(#[from] SinkError),
}

impl StartupError {
    /// Configuration and master-data problems exit with 2, anything else 1.
    pub fn exit_code(&self) -> u8 {
        match self {
            StartupError::Config(_) | StartupError::Catalog(_) => 2,
            StartupError::Sink(_) => 1,
        }
    }
}

pub type SinkPair = (Option<Arc<dyn Sink>>, Option<Arc<dyn Sink>>);

/// Build the bus and store sinks. The Postgres schema is created here when
/// the database is reachable; otherwise the first delivery retries it.
pub async fn build_sinks(config: &SinksConfig) -> Result<SinkPair, StartupError> {
    let bus: Option<Arc<dyn Sink>> = match &config.bus {
        #[cfg(feature = "redis")]
        BusSinkConfig::RedisStreams {
            url,
            stream_prefix,
            max_len,
        } => Some(Arc::new(crate::sink::RedisStreamsSink::new(url, stream_prefix.clone(), *max_len)?) as Arc<dyn Sink>),
        #[cfg(not(feature = "redis"))]
        BusSinkConfig::RedisStreams { .. } => {
            return Err(ConfigError::Invalid("sinks.bus: redis_streams requires the `redis` feature".into()).into());
        }
        BusSinkConfig::Memory => Some(Arc::new(InMemorySink::bus()) as Arc<dyn Sink>),
        BusSinkConfig::Disabled => None,
    };

    let store: Option<Arc<dyn Sink>> = match &config.store {
        StoreSinkConfig::Postgres { url, max_connections } => {
            let url = url
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid("sinks.store: postgres needs `url` or DATABASE_URL".into()))?;
            let sink = PostgresSink::connect_lazy(url, *max_connections)?;
            if let Err(e) = sink.ensure_schema().await {
                warn!(error = %e, "postgres not ready at startup, schema creation deferred");
            }
            Some(Arc::new(sink) as Arc<dyn Sink>)
        }
        StoreSinkConfig::Memory => Some(Arc::new(InMemorySink::store()) as Arc<dyn Sink>),
        StoreSinkConfig::Disabled => None,
    };

    Ok((bus, store))
}

/// Everything `GET /stats` reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlantStats {
    pub started_at: DateTime<Utc>,
    pub seed: u64,
    pub scheduler: SchedulerStats,
    pub dispatcher: DispatcherStats,
    pub supervisor: SupervisorStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// A worker exhausted its restart budget.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Health {
    pub status: HealthStatus,
    pub started_at: DateTime<Utc>,
    pub machines: usize,
    pub sensors: usize,
}

/// Cloneable operator-facing handle to a running plant.
#[derive(Debug, Clone)]
pub struct PlantHandle {
    control: SchedulerControl,
    scheduler: SchedulerProbe,
    supervisor: SupervisorProbe,
    dispatcher: Arc<SinkDispatcher>,
    started_at: DateTime<Utc>,
    seed: u64,
}

impl PlantHandle {
    pub fn catalog(&self) -> &EntityCatalog {
        self.control.catalog()
    }

    pub async fn inject_fault(
        &self,
        machine: &MachineId,
        kind: FaultKind,
        duration_secs: Option<u64>,
        severity: f64,
    ) -> Result<(), ControlError> {
        self.control.inject_fault(machine, kind, duration_secs, severity).await
    }

    pub async fn acknowledge(&self, machine: &MachineId) -> Result<bool, ControlError> {
        self.control.acknowledge(machine).await
    }

    pub async fn clear_faults(&self, machine: &MachineId) -> Result<bool, ControlError> {
        self.control.clear_faults(machine).await
    }

    pub fn stats(&self) -> PlantStats {
        PlantStats {
            started_at: self.started_at,
            seed: self.seed,
            scheduler: self.scheduler.stats(),
            dispatcher: self.dispatcher.stats(),
            supervisor: self.supervisor.stats(),
        }
    }

    pub fn health(&self) -> Health {
        let scheduler = self.scheduler.stats();
        let status = if self.supervisor.stats().exhausted > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        Health {
            status,
            started_at: self.started_at,
            machines: scheduler.machines,
            sensors: scheduler.sensors,
        }
    }
}

/// Final counters after an orderly shutdown.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub abandoned_workers: Vec<String>,
    pub stats: PlantStats,
}

#[derive(Debug)]
pub struct PlantRuntime {
    scheduler: Scheduler,
    dispatcher: Arc<SinkDispatcher>,
    fatal: mpsc::Receiver<SupervisorError>,
    handle: PlantHandle,
}

impl PlantRuntime {
    /// Validate `config`, load master data, build sinks and start simulating.
    pub async fn start(config: &PlantwireConfig) -> Result<Self, StartupError> {
        config.validate()?;
        let catalog = load_catalog(&config.catalog).await?;
        let (bus, store) = build_sinks(&config.sinks).await?;
        Ok(Self::start_with(config, catalog, bus, store, SimClock::starting_now()))
    }

    /// Start against an already built catalog and sinks.
    pub fn start_with(
        config: &PlantwireConfig,
        catalog: EntityCatalog,
        bus: Option<Arc<dyn Sink>>,
        store: Option<Arc<dyn Sink>>,
        clock: SimClock,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let dispatcher = Arc::new(SinkDispatcher::start(bus, store, &config.dispatcher));
        let (fatal_tx, fatal) = mpsc::channel(8);
        let scheduler = Scheduler::start(catalog, dispatcher.clone(), config, clock, fatal_tx);

        let handle = PlantHandle {
            control: scheduler.control(),
            scheduler: scheduler.probe(),
            supervisor: scheduler.supervisor(),
            dispatcher: dispatcher.clone(),
            started_at: clock.epoch_utc(),
            seed: scheduler.seed(),
        };
        info!(started_at = %handle.started_at, "plant runtime started");

        Self {
            scheduler,
            dispatcher,
            fatal,
            handle,
        }
    }

    pub fn handle(&self) -> PlantHandle {
        self.handle.clone()
    }

    /// Resolves when a worker exhausts its restart budget.
    pub async fn fatal(&mut self) -> Option<SupervisorError> {
        self.fatal.recv().await
    }

    /// Stop ticking, drain workers, then flush and drain both lanes.
    pub async fn shutdown(self) -> ShutdownReport {
        info!("shutting down: stopping scheduler");
        let abandoned_workers = self.scheduler.stop().await;
        info!("shutting down: draining dispatcher");
        self.dispatcher.shutdown().await;

        let stats = self.handle.stats();
        info!(stats = ?stats, "shutdown complete");
        ShutdownReport {
            abandoned_workers,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CatalogConfig;

    #[test]
    fn exit_codes_follow_the_failure_class() {
        assert_eq!(StartupError::Config(ConfigError::Invalid("x".into())).exit_code(), 2);
        assert_eq!(StartupError::Catalog(CatalogError::MissingUrl).exit_code(), 2);
        assert_eq!(StartupError::Sink(SinkError::Connection("x".into())).exit_code(), 1);
    }

    #[tokio::test]
    async fn memory_sinks_are_built_by_default() {
        let (bus, store) = build_sinks(&SinksConfig::default()).await.unwrap();
        assert_eq!(bus.unwrap().name(), "memory_bus");
        assert_eq!(store.unwrap().name(), "memory_store");
    }

    #[tokio::test]
    async fn invalid_configuration_fails_before_anything_starts() {
        let mut config = PlantwireConfig::default();
        config.scheduler.workers = 0;
        config.catalog = CatalogConfig::Demo {
            factories: 1,
            lines_per_factory: 1,
            machines_per_line: 1,
        };
        let err = PlantRuntime::start(&config).await.unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_machine_is_reported() {
        let config = PlantwireConfig::default();
        let catalog = EntityCatalog::from_document(plantwire_core::CatalogDocument::demo(1, 1, 1)).unwrap();
        let runtime = PlantRuntime::start_with(&config, catalog, None, None, SimClock::starting_now());
        let handle = runtime.handle();

        let err = handle.acknowledge(&MachineId::new("NOPE-999")).await.unwrap_err();
        assert!(matches!(err, ControlError::UnknownMachine(_)));
        assert_eq!(handle.health().status, HealthStatus::Ok);

        runtime.shutdown().await;
    }
}
