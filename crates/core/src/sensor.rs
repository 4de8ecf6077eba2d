//! Closed set of sensor and machine kinds, with their static profiles.
//!
//! Kind-specific behaviour is data: each kind maps to a profile in a lookup
//! table (unit, default thresholds, jitter) instead of branching on strings at
//! runtime.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::catalog::Thresholds;
use crate::error::PlantError;

/// Physical quantity measured by a sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Temperature,
    Vibration,
    Pressure,
    Current,
    Voltage,
    Flow,
    Power,
    Torque,
    Position,
    Acoustic,
    Speed,
    Humidity,
}

/// Static profile of a sensor kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorProfile {
    pub unit: &'static str,
    /// Default thresholds when master data does not provide any.
    pub thresholds: Thresholds,
    /// Jitter bound as a fraction of the normal range span (0.02..=0.05).
    pub jitter_pct: f64,
    /// Default sampling interval.
    pub sampling_secs: u64,
}

const fn limits(
    normal_min: f64,
    normal_max: f64,
    warning_low: f64,
    warning_high: f64,
    critical_low: f64,
    critical_high: f64,
) -> Thresholds {
    Thresholds {
        normal_min,
        normal_max,
        warning_low,
        warning_high,
        critical_low,
        critical_high,
    }
}

const SENSOR_PROFILES: [(SensorKind, SensorProfile); 12] = [
    (
        SensorKind::Temperature,
        SensorProfile {
            unit: "°C",
            thresholds: limits(40.0, 70.0, 30.0, 80.0, 20.0, 95.0),
            jitter_pct: 0.02,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Vibration,
        SensorProfile {
            unit: "mm/s",
            thresholds: limits(5.0, 15.0, 2.0, 15.0, 0.5, 20.0),
            jitter_pct: 0.05,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Pressure,
        SensorProfile {
            unit: "bar",
            thresholds: limits(150.0, 200.0, 130.0, 215.0, 100.0, 240.0),
            jitter_pct: 0.03,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Current,
        SensorProfile {
            unit: "A",
            thresholds: limits(10.0, 40.0, 5.0, 48.0, 2.0, 60.0),
            jitter_pct: 0.04,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Voltage,
        SensorProfile {
            unit: "V",
            thresholds: limits(380.0, 420.0, 360.0, 440.0, 330.0, 470.0),
            jitter_pct: 0.02,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Flow,
        SensorProfile {
            unit: "L/min",
            thresholds: limits(20.0, 40.0, 15.0, 46.0, 8.0, 55.0),
            jitter_pct: 0.03,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Power,
        SensorProfile {
            unit: "kW",
            thresholds: limits(5.0, 25.0, 2.0, 30.0, 0.5, 38.0),
            jitter_pct: 0.04,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Torque,
        SensorProfile {
            unit: "N·m",
            thresholds: limits(20.0, 80.0, 10.0, 95.0, 5.0, 120.0),
            jitter_pct: 0.04,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Position,
        SensorProfile {
            unit: "µm",
            thresholds: limits(-10.0, 10.0, -15.0, 15.0, -25.0, 25.0),
            jitter_pct: 0.03,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Acoustic,
        SensorProfile {
            unit: "dB",
            thresholds: limits(60.0, 80.0, 50.0, 88.0, 40.0, 100.0),
            jitter_pct: 0.03,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Speed,
        SensorProfile {
            unit: "rpm",
            thresholds: limits(1200.0, 1800.0, 1000.0, 1950.0, 800.0, 2200.0),
            jitter_pct: 0.02,
            sampling_secs: 10,
        },
    ),
    (
        SensorKind::Humidity,
        SensorProfile {
            unit: "%RH",
            thresholds: limits(35.0, 55.0, 25.0, 65.0, 15.0, 80.0),
            jitter_pct: 0.03,
            sampling_secs: 10,
        },
    ),
];

impl SensorKind {
    pub const ALL: [SensorKind; 12] = [
        SensorKind::Temperature,
        SensorKind::Vibration,
        SensorKind::Pressure,
        SensorKind::Current,
        SensorKind::Voltage,
        SensorKind::Flow,
        SensorKind::Power,
        SensorKind::Torque,
        SensorKind::Position,
        SensorKind::Acoustic,
        SensorKind::Speed,
        SensorKind::Humidity,
    ];

    /// Look up the static profile for this kind.
    pub fn profile(&self) -> &'static SensorProfile {
        // The table is ordered like the enum.
        &SENSOR_PROFILES[*self as usize].1
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Vibration => "vibration",
            SensorKind::Pressure => "pressure",
            SensorKind::Current => "current",
            SensorKind::Voltage => "voltage",
            SensorKind::Flow => "flow",
            SensorKind::Power => "power",
            SensorKind::Torque => "torque",
            SensorKind::Position => "position",
            SensorKind::Acoustic => "acoustic",
            SensorKind::Speed => "speed",
            SensorKind::Humidity => "humidity",
        }
    }

    /// Short code used when generating sensor ids (`CNC-014-VIB`).
    pub fn code(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "TMP",
            SensorKind::Vibration => "VIB",
            SensorKind::Pressure => "PRS",
            SensorKind::Current => "CUR",
            SensorKind::Voltage => "VLT",
            SensorKind::Flow => "FLW",
            SensorKind::Power => "PWR",
            SensorKind::Torque => "TRQ",
            SensorKind::Position => "POS",
            SensorKind::Acoustic => "ACU",
            SensorKind::Speed => "SPD",
            SensorKind::Humidity => "HUM",
        }
    }
}

impl FromStr for SensorKind {
    type Err = PlantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        SensorKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| PlantError::validation(format!("unknown sensor kind '{s}'")))
    }
}

/// Kind of production equipment.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineKind {
    CncMill,
    Lathe,
    StampingPress,
    WeldingRobot,
    InjectionMolder,
    Conveyor,
    AirCompressor,
    AssemblyStation,
}

/// Static profile of a machine kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MachineProfile {
    /// Ideal cycle time for one part.
    pub ideal_cycle_secs: f64,
    /// Baseline scrap fraction with no fault present.
    pub base_reject_rate: f64,
    /// Changeover duration when starting a shift.
    pub setup_secs: u64,
    /// Sensors fitted when master data does not list them (demo plant).
    pub default_sensors: &'static [SensorKind],
}

impl MachineKind {
    pub const ALL: [MachineKind; 8] = [
        MachineKind::CncMill,
        MachineKind::Lathe,
        MachineKind::StampingPress,
        MachineKind::WeldingRobot,
        MachineKind::InjectionMolder,
        MachineKind::Conveyor,
        MachineKind::AirCompressor,
        MachineKind::AssemblyStation,
    ];

    pub fn profile(&self) -> MachineProfile {
        use SensorKind::*;
        match self {
            MachineKind::CncMill => MachineProfile {
                ideal_cycle_secs: 45.0,
                base_reject_rate: 0.015,
                setup_secs: 1200,
                default_sensors: &[Vibration, Temperature, Torque, Power, Position, Flow],
            },
            MachineKind::Lathe => MachineProfile {
                ideal_cycle_secs: 30.0,
                base_reject_rate: 0.012,
                setup_secs: 900,
                default_sensors: &[Vibration, Temperature, Torque, Power, Flow],
            },
            MachineKind::StampingPress => MachineProfile {
                ideal_cycle_secs: 4.0,
                base_reject_rate: 0.008,
                setup_secs: 1800,
                default_sensors: &[Pressure, Temperature, Vibration, Flow, Acoustic],
            },
            MachineKind::WeldingRobot => MachineProfile {
                ideal_cycle_secs: 20.0,
                base_reject_rate: 0.02,
                setup_secs: 600,
                default_sensors: &[Current, Voltage, Temperature, Position, Flow],
            },
            MachineKind::InjectionMolder => MachineProfile {
                ideal_cycle_secs: 25.0,
                base_reject_rate: 0.025,
                setup_secs: 2400,
                default_sensors: &[Pressure, Temperature, Flow, Power],
            },
            MachineKind::Conveyor => MachineProfile {
                ideal_cycle_secs: 2.0,
                base_reject_rate: 0.001,
                setup_secs: 120,
                default_sensors: &[Speed, Vibration, Current, Temperature],
            },
            MachineKind::AirCompressor => MachineProfile {
                ideal_cycle_secs: 10.0,
                base_reject_rate: 0.0,
                setup_secs: 300,
                default_sensors: &[Pressure, Flow, Temperature, Vibration, Current],
            },
            MachineKind::AssemblyStation => MachineProfile {
                ideal_cycle_secs: 60.0,
                base_reject_rate: 0.01,
                setup_secs: 900,
                default_sensors: &[Pressure, Position, Torque, Current, Humidity],
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MachineKind::CncMill => "cnc_mill",
            MachineKind::Lathe => "lathe",
            MachineKind::StampingPress => "stamping_press",
            MachineKind::WeldingRobot => "welding_robot",
            MachineKind::InjectionMolder => "injection_molder",
            MachineKind::Conveyor => "conveyor",
            MachineKind::AirCompressor => "air_compressor",
            MachineKind::AssemblyStation => "assembly_station",
        }
    }

    /// Short code used when generating machine ids.
    pub fn code(&self) -> &'static str {
        match self {
            MachineKind::CncMill => "CNC",
            MachineKind::Lathe => "LTH",
            MachineKind::StampingPress => "PRS",
            MachineKind::WeldingRobot => "WLD",
            MachineKind::InjectionMolder => "INJ",
            MachineKind::Conveyor => "CNV",
            MachineKind::AirCompressor => "CMP",
            MachineKind::AssemblyStation => "ASM",
        }
    }
}

impl FromStr for MachineKind {
    type Err = PlantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        MachineKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| PlantError::validation(format!("unknown machine kind '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_table_is_ordered_like_the_enum() {
        for (idx, kind) in SensorKind::ALL.iter().enumerate() {
            assert_eq!(SENSOR_PROFILES[idx].0, *kind);
        }
    }

    #[test]
    fn default_thresholds_are_valid() {
        for kind in SensorKind::ALL {
            let profile = kind.profile();
            assert!(profile.thresholds.validate(kind.as_str()).is_ok(), "{kind:?}");
            assert!((0.02..=0.05).contains(&profile.jitter_pct), "{kind:?}");
        }
    }

    #[test]
    fn kinds_parse_from_master_data_strings() {
        assert_eq!("Vibration".parse::<SensorKind>().unwrap(), SensorKind::Vibration);
        assert_eq!("cnc_mill".parse::<MachineKind>().unwrap(), MachineKind::CncMill);
        assert!("laser".parse::<MachineKind>().is_err());
    }
}
