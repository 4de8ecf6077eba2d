//! Outbound telemetry records.
//!
//! Everything the simulation emits is a [`TelemetryRecord`]; sinks only see
//! this type. Records are append-only and keyed by `(entity_id, recorded_at)`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{FactoryId, LineId, MachineId, SensorId};
use crate::sensor::{MachineKind, SensorKind};

/// Data quality attached to a reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Uncertain,
    Bad,
}

/// Worst threshold band a value falls into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdFlags {
    pub below_warning: bool,
    pub above_warning: bool,
    pub below_critical: bool,
    pub above_critical: bool,
}

impl ThresholdFlags {
    pub fn status(&self) -> ThresholdStatus {
        if self.below_critical || self.above_critical {
            ThresholdStatus::Critical
        } else if self.below_warning || self.above_warning {
            ThresholdStatus::Warning
        } else {
            ThresholdStatus::Normal
        }
    }
}

/// Equipment failure modes known to the fault library.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    BearingWear,
    ThermalOverload,
    HydraulicLoss,
    ToolWear,
    WeldDrift,
    PneumaticLeak,
    CoolantFailure,
    PositioningDrift,
    ElectricalFault,
    SensorDrift,
}

impl FaultKind {
    pub const ALL: [FaultKind; 10] = [
        FaultKind::BearingWear,
        FaultKind::ThermalOverload,
        FaultKind::HydraulicLoss,
        FaultKind::ToolWear,
        FaultKind::WeldDrift,
        FaultKind::PneumaticLeak,
        FaultKind::CoolantFailure,
        FaultKind::PositioningDrift,
        FaultKind::ElectricalFault,
        FaultKind::SensorDrift,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::BearingWear => "bearing_wear",
            FaultKind::ThermalOverload => "thermal_overload",
            FaultKind::HydraulicLoss => "hydraulic_loss",
            FaultKind::ToolWear => "tool_wear",
            FaultKind::WeldDrift => "weld_drift",
            FaultKind::PneumaticLeak => "pneumatic_leak",
            FaultKind::CoolantFailure => "coolant_failure",
            FaultKind::PositioningDrift => "positioning_drift",
            FaultKind::ElectricalFault => "electrical_fault",
            FaultKind::SensorDrift => "sensor_drift",
        }
    }
}

impl core::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for FaultKind {
    type Err = crate::error::PlantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        FaultKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| crate::error::PlantError::validation(format!("unknown fault pattern '{s}'")))
    }
}

/// Progression phase of an injected fault.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPhase {
    Latent,
    Warning,
    Critical,
    Resolved,
}

/// How a fault came to be.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOrigin {
    Probabilistic,
    Manual,
}

/// Fault context attached to records while an injection is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultAnnotation {
    pub kind: FaultKind,
    pub phase: FaultPhase,
    pub severity: f64,
    pub origin: FaultOrigin,
    pub started_at: DateTime<Utc>,
    /// Fraction of the total duration elapsed, in `[0, 1]`.
    pub progress: f64,
}

/// Rolling statistics over the trailing window of one sensor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub window_secs: u64,
    pub window_end: DateTime<Utc>,
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// One sensor sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: SensorId,
    pub machine_id: MachineId,
    pub line_id: LineId,
    pub factory_id: FactoryId,
    pub sensor_kind: SensorKind,
    pub recorded_at: DateTime<Utc>,
    pub value: f64,
    pub unit: String,
    pub quality: Quality,
    pub flags: ThresholdFlags,
    pub status: ThresholdStatus,
    pub window: WindowStats,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub fault: Option<FaultAnnotation>,
}

/// Operating state of a machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Running,
    Idle,
    Stopped,
    Setup,
    Fault,
    Maintenance,
}

impl MachineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MachineState::Running => "running",
            MachineState::Idle => "idle",
            MachineState::Stopped => "stopped",
            MachineState::Setup => "setup",
            MachineState::Fault => "fault",
            MachineState::Maintenance => "maintenance",
        }
    }
}

/// Production shift a timestamp falls into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shift {
    Primary,
    Second,
    Night,
}

/// Machine state and OEE snapshot, one per machine tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineStateRecord {
    pub machine_id: MachineId,
    pub line_id: LineId,
    pub factory_id: FactoryId,
    pub machine_kind: MachineKind,
    pub recorded_at: DateTime<Utc>,
    pub state: MachineState,
    pub shift: Shift,
    pub time_in_state_secs: u64,
    /// Percentages in `[0, 100]`, two decimals.
    pub availability: f64,
    pub performance: f64,
    pub quality: f64,
    /// `availability × performance × quality` as a fraction, two decimals.
    pub oee: f64,
    pub parts_produced: u64,
    pub parts_rejected: u64,
    pub failure_count: u64,
    pub mtbf_hours: Option<f64>,
    pub mttr_hours: Option<f64>,
    pub fault: Option<FaultAnnotation>,
}

/// Record category; one bus stream and one store table per kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    SensorReading,
    MachineState,
}

impl RecordKind {
    /// Stream suffix / table name.
    pub fn collection(&self) -> &'static str {
        match self {
            RecordKind::SensorReading => "sensor_readings",
            RecordKind::MachineState => "machine_states",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum TelemetryRecord {
    SensorReading(Reading),
    MachineState(MachineStateRecord),
}

impl TelemetryRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            TelemetryRecord::SensorReading(_) => RecordKind::SensorReading,
            TelemetryRecord::MachineState(_) => RecordKind::MachineState,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            TelemetryRecord::SensorReading(r) => r.sensor_id.as_str(),
            TelemetryRecord::MachineState(m) => m.machine_id.as_str(),
        }
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        match self {
            TelemetryRecord::SensorReading(r) => r.recorded_at,
            TelemetryRecord::MachineState(m) => m.recorded_at,
        }
    }

    /// Idempotency key used by the durable store.
    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.entity_id().to_string(), self.recorded_at())
    }

    /// Record body without the enum envelope.
    pub fn payload(&self) -> serde_json::Result<serde_json::Value> {
        match self {
            TelemetryRecord::SensorReading(r) => serde_json::to_value(r),
            TelemetryRecord::MachineState(m) => serde_json::to_value(m),
        }
    }
}

impl From<Reading> for TelemetryRecord {
    fn from(value: Reading) -> Self {
        TelemetryRecord::SensorReading(value)
    }
}

impl From<MachineStateRecord> for TelemetryRecord {
    fn from(value: MachineStateRecord) -> Self {
        TelemetryRecord::MachineState(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Thresholds;
    use proptest::prelude::*;

    #[test]
    fn critical_dominates_warning() {
        let flags = ThresholdFlags {
            above_warning: true,
            above_critical: true,
            ..Default::default()
        };
        assert_eq!(flags.status(), ThresholdStatus::Critical);
        assert_eq!(ThresholdFlags::default().status(), ThresholdStatus::Normal);
    }

    #[test]
    fn record_envelope_names_the_kind() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T06:00:10Z").unwrap().with_timezone(&Utc);
        let record = TelemetryRecord::from(Reading {
            sensor_id: SensorId::new("CNC-001-VIB"),
            machine_id: MachineId::new("CNC-001"),
            line_id: LineId::new("F01-L1"),
            factory_id: FactoryId::new("F01"),
            sensor_kind: SensorKind::Vibration,
            recorded_at: at,
            value: 9.5,
            unit: "mm/s".into(),
            quality: Quality::Good,
            flags: ThresholdFlags::default(),
            status: ThresholdStatus::Normal,
            window: WindowStats {
                window_secs: 300,
                window_end: at,
                count: 1,
                min: 9.5,
                max: 9.5,
                mean: 9.5,
                stddev: 0.0,
            },
            anomaly_score: 0.0,
            is_anomaly: false,
            fault: None,
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "sensor_reading");
        assert_eq!(json["data"]["sensor_id"], "CNC-001-VIB");
        assert_eq!(record.key(), ("CNC-001-VIB".to_string(), at));
        assert_eq!(record.kind().collection(), "sensor_readings");
    }

    #[test]
    fn fault_kinds_parse() {
        assert_eq!("Bearing_Wear".parse::<FaultKind>().unwrap(), FaultKind::BearingWear);
        assert!("gearbox".parse::<FaultKind>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, .. ProptestConfig::default() })]

        #[test]
        fn status_never_improves_moving_away_from_normal(offset in 0.0f64..50.0, extra in 0.0f64..50.0) {
            let t = SensorKind::Temperature.profile().thresholds;
            let Thresholds { normal_max, normal_min, .. } = t;
            prop_assert!(t.status(normal_max + offset) <= t.status(normal_max + offset + extra));
            prop_assert!(t.status(normal_min - offset) <= t.status(normal_min - offset - extra));
        }
    }
}
