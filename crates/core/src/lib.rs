//! `plantwire-core`: plant entity model and telemetry record types.
//!
//! This crate contains **pure data** shared by the simulation and the
//! infrastructure layers (no IO, no async, no randomness).

pub mod catalog;
pub mod entity;
pub mod error;
pub mod id;
pub mod record;
pub mod sensor;

pub use catalog::{
    CatalogDocument, EntityCatalog, Factory, Line, Machine, MachineSpec, Sensor, SensorSpec, Thresholds,
};
pub use entity::Entity;
pub use error::{PlantError, PlantResult};
pub use id::{FactoryId, LineId, MachineId, SensorId};
pub use record::{
    FaultAnnotation, FaultKind, FaultOrigin, FaultPhase, MachineState, MachineStateRecord, Quality,
    Reading, RecordKind, Shift, TelemetryRecord, ThresholdFlags, ThresholdStatus, WindowStats,
};
pub use sensor::{MachineKind, MachineProfile, SensorKind, SensorProfile};
