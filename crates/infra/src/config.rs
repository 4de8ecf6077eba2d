//! Daemon configuration (`plantwire.toml`).
//!
//! Every section has defaults, so an empty document is a valid configuration
//! (demo plant, in-memory sinks). Environment overrides are applied after
//! parsing and before validation.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use plantwire_observability::LogFormat;
use plantwire_sim::{AnomalyScorer, FaultSettings, MachineSettings};
use serde::{Deserialize, Serialize};

use crate::dispatch::retry::{BackoffStrategy, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlantwireConfig {
    pub scheduler: SchedulerConfig,
    pub simulation: SimulationConfig,
    pub dispatcher: DispatcherConfig,
    pub sinks: SinksConfig,
    pub catalog: CatalogConfig,
    pub supervisor: SupervisorConfig,
    pub logging: LoggingConfig,
    pub admin: AdminConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    pub sensor_cadence_secs: u64,
    pub machine_cadence_secs: u64,
    /// Number of partitions; each runs one sensor and one machine worker.
    pub workers: usize,
    /// Bound on waiting for workers to finish their current tick at stop.
    pub drain_timeout_secs: u64,
    /// Capacity of each partition's control channel.
    pub control_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sensor_cadence_secs: 10,
            machine_cadence_secs: 60,
            workers: 4,
            drain_timeout_secs: 10,
            control_buffer: 64,
        }
    }
}

impl SchedulerConfig {
    pub fn sensor_cadence(&self) -> Duration {
        Duration::from_secs(self.sensor_cadence_secs)
    }

    pub fn machine_cadence(&self) -> Duration {
        Duration::from_secs(self.machine_cadence_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Base seed; a random one is drawn (and logged) when absent.
    pub seed: Option<u64>,
    /// Trailing statistics window.
    pub window_secs: u64,
    pub anomaly: AnomalyScorer,
    pub faults: FaultSettings,
    pub machines: MachineSettings,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            window_secs: 300,
            anomaly: AnomalyScorer::default(),
            faults: FaultSettings::default(),
            machines: MachineSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    pub max_batch_size: usize,
    pub max_linger_ms: u64,
    /// Sealed batches waiting per lane.
    pub queue_capacity: usize,
    /// How long a producer waits on a full queue before the oldest batch is dropped.
    pub backpressure_timeout_ms: u64,
    pub drain_timeout_secs: u64,
    pub retry: RetryConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 500,
            max_linger_ms: 1_000,
            queue_capacity: 64,
            backpressure_timeout_ms: 2_000,
            drain_timeout_secs: 10,
            retry: RetryConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn max_linger(&self) -> Duration {
        Duration::from_millis(self.max_linger_ms)
    }

    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusSinkConfig {
    RedisStreams {
        #[serde(default = "default_redis_url")]
        url: String,
        #[serde(default = "default_stream_prefix")]
        stream_prefix: String,
        /// Approximate `MAXLEN ~` cap per stream.
        #[serde(default = "default_stream_max_len")]
        max_len: u64,
    },
    #[default]
    Memory,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreSinkConfig {
    Postgres {
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
    #[default]
    Memory,
    Disabled,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_stream_prefix() -> String {
    "plantwire".to_string()
}

fn default_stream_max_len() -> u64 {
    1_000_000
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinksConfig {
    pub bus: BusSinkConfig,
    pub store: StoreSinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CatalogConfig {
    /// JSON master-data snapshot.
    File { path: PathBuf },
    /// Master-data tables; falls back to `DATABASE_URL` when `url` is unset.
    Postgres {
        #[serde(default)]
        url: Option<String>,
    },
    /// Synthetic plant.
    Demo {
        #[serde(default = "one")]
        factories: usize,
        #[serde(default = "two")]
        lines_per_factory: usize,
        #[serde(default = "four")]
        machines_per_line: usize,
    },
}

fn one() -> usize {
    1
}

fn two() -> usize {
    2
}

fn four() -> usize {
    4
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig::Demo {
            factories: one(),
            lines_per_factory: two(),
            machines_per_line: four(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Restarts tolerated per worker inside `restart_window_secs`.
    pub max_restarts: u32,
    pub restart_window_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Default filter directive when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdminConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8088".to_string(),
        }
    }
}

impl PlantwireConfig {
    /// Read, parse, apply process environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `DATABASE_URL`, `REDIS_URL` and `PLANTWIRE_SEED`.
    ///
    /// `lookup` abstracts the environment so tests don't mutate process state.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = lookup("REDIS_URL") {
            if let BusSinkConfig::RedisStreams { url: current, .. } = &mut self.sinks.bus {
                *current = url;
            }
        }

        if let Some(url) = lookup("DATABASE_URL") {
            if let StoreSinkConfig::Postgres { url: current, .. } = &mut self.sinks.store {
                *current = Some(url.clone());
            }
            if let CatalogConfig::Postgres { url: current } = &mut self.catalog {
                if current.is_none() {
                    *current = Some(url);
                }
            }
        }

        if let Some(raw) = lookup("PLANTWIRE_SEED") {
            let seed = raw.trim().parse::<u64>().map_err(|e| ConfigError::Env {
                var: "PLANTWIRE_SEED",
                reason: e.to_string(),
            })?;
            self.simulation.seed = Some(seed);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scheduler;
        if s.sensor_cadence_secs == 0 || s.machine_cadence_secs == 0 {
            return Err(ConfigError::invalid("scheduler cadences must be at least one second"));
        }
        if s.machine_cadence_secs % s.sensor_cadence_secs != 0 {
            return Err(ConfigError::invalid(
                "scheduler.machine_cadence_secs must be a multiple of sensor_cadence_secs",
            ));
        }
        if s.workers == 0 {
            return Err(ConfigError::invalid("scheduler.workers must be positive"));
        }
        if s.control_buffer == 0 {
            return Err(ConfigError::invalid("scheduler.control_buffer must be positive"));
        }

        let sim = &self.simulation;
        if sim.window_secs == 0 {
            return Err(ConfigError::invalid("simulation.window_secs must be positive"));
        }
        if !(0.0..=1.0).contains(&sim.faults.probability_per_cycle) {
            return Err(ConfigError::invalid(
                "simulation.faults.probability_per_cycle must be within [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&sim.faults.min_severity)
            || !(0.0..=1.0).contains(&sim.faults.max_severity)
            || sim.faults.min_severity > sim.faults.max_severity
        {
            return Err(ConfigError::invalid("simulation.faults severity range must lie within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&sim.anomaly.cutoff) || sim.anomaly.cv_ceiling <= 0.0 {
            return Err(ConfigError::invalid(
                "simulation.anomaly needs cutoff in [0, 1] and a positive cv_ceiling",
            ));
        }

        let d = &self.dispatcher;
        if d.max_batch_size == 0 || d.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "dispatcher.max_batch_size and queue_capacity must be positive",
            ));
        }
        if d.max_linger_ms == 0 {
            return Err(ConfigError::invalid("dispatcher.max_linger_ms must be positive"));
        }
        if !(0.0..=1.0).contains(&d.retry.jitter) {
            return Err(ConfigError::invalid("dispatcher.retry.jitter must be within [0, 1]"));
        }

        if let StoreSinkConfig::Postgres { url: None, .. } = &self.sinks.store {
            return Err(ConfigError::invalid(
                "sinks.store: postgres needs `url` or DATABASE_URL",
            ));
        }
        if let CatalogConfig::Postgres { url: None } = &self.catalog {
            return Err(ConfigError::invalid("catalog: postgres needs `url` or DATABASE_URL"));
        }
        if matches!(self.sinks.bus, BusSinkConfig::Disabled)
            && matches!(self.sinks.store, StoreSinkConfig::Disabled)
        {
            return Err(ConfigError::invalid("at least one sink must be enabled"));
        }

        if self.supervisor.restart_window_secs == 0 {
            return Err(ConfigError::invalid("supervisor.restart_window_secs must be positive"));
        }

        if self.admin.enabled {
            self.admin_addr()?;
        }

        Ok(())
    }

    pub fn admin_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.admin
            .bind
            .parse()
            .map_err(|e| ConfigError::invalid(format!("admin.bind '{}': {e}", self.admin.bind)))
    }
}
