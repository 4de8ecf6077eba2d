//! Infrastructure layer: configuration, master-data loading, sinks, batching
//! dispatcher, scheduling and supervision.

pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod supervisor;

pub use catalog::{CatalogError, load_catalog};
pub use config::{ConfigError, PlantwireConfig};
pub use dispatch::{DispatcherStats, LaneStats, SinkDispatcher};
pub use runtime::{Health, HealthStatus, PlantHandle, PlantRuntime, PlantStats, ShutdownReport, StartupError};
pub use scheduler::{ControlError, Scheduler, SchedulerStats, SimClock};
pub use sink::{OutboundBatch, Sink, SinkError, SinkKind};
pub use supervisor::{Supervisor, SupervisorError, SupervisorStats};
