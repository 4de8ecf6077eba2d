//! Data-driven fault pattern library.
//!
//! Each [`FaultKind`] maps to a static [`PatternSpec`]: default duration
//! range, the sensor kinds it pushes (and in which direction), how the
//! timeline is split between phases, erratic noise and quality impact.

use std::collections::BTreeSet;

use plantwire_core::{FaultKind, FaultPhase, Quality, SensorKind};

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Which way a fault pushes a sensor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Rise,
    Fall,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Rise => 1.0,
            Direction::Fall => -1.0,
        }
    }
}

/// Sensors affected by a pattern.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Participants {
    Only(&'static [(SensorKind, Direction)]),
    /// Every sensor on the machine, same direction.
    All(Direction),
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PatternSpec {
    pub kind: FaultKind,
    pub min_duration_secs: u64,
    pub max_duration_secs: u64,
    pub participants: Participants,
    /// Progress fraction at which latent ends.
    pub latent_until: f64,
    /// Progress fraction at which warning ends; critical runs to 1.0.
    pub warning_until: f64,
    /// Outward noise amplitude as a fraction of the normal→critical gap.
    pub erratic: f64,
    /// Quality reported in latent, warning and critical.
    pub quality: [Quality; 3],
}

impl PatternSpec {
    /// Direction this pattern pushes `sensor`, if the sensor participates.
    pub fn direction_for(&self, sensor: SensorKind) -> Option<Direction> {
        match self.participants {
            Participants::All(direction) => Some(direction),
            Participants::Only(list) => list
                .iter()
                .find(|(kind, _)| *kind == sensor)
                .map(|(_, direction)| *direction),
        }
    }

    /// A pattern applies to a machine when at least one of its sensors participates.
    pub fn is_eligible(&self, sensors: &BTreeSet<SensorKind>) -> bool {
        sensors.iter().any(|k| self.direction_for(*k).is_some())
    }

    /// Phase and within-phase fraction for a progress value in `[0, 1)`.
    pub fn phase_at(&self, progress: f64) -> (FaultPhase, f64) {
        let p = progress.clamp(0.0, 1.0);
        if p < self.latent_until {
            (FaultPhase::Latent, p / self.latent_until)
        } else if p < self.warning_until {
            (
                FaultPhase::Warning,
                (p - self.latent_until) / (self.warning_until - self.latent_until),
            )
        } else {
            (
                FaultPhase::Critical,
                ((p - self.warning_until) / (1.0 - self.warning_until)).min(1.0),
            )
        }
    }

    pub fn quality_in(&self, phase: FaultPhase) -> Quality {
        match phase {
            FaultPhase::Latent => self.quality[0],
            FaultPhase::Warning => self.quality[1],
            FaultPhase::Critical => self.quality[2],
            FaultPhase::Resolved => Quality::Good,
        }
    }
}

use Direction::{Fall, Rise};
use Quality::{Bad, Good, Uncertain};
use SensorKind::*;

const CLEAN: [Quality; 3] = [Good, Good, Good];

static PATTERNS: [PatternSpec; 10] = [
    PatternSpec {
        kind: FaultKind::BearingWear,
        min_duration_secs: 4 * DAY,
        max_duration_secs: 9 * DAY,
        participants: Participants::Only(&[(Vibration, Rise), (Temperature, Rise), (Acoustic, Rise)]),
        latent_until: 0.55,
        warning_until: 0.85,
        erratic: 0.05,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::ThermalOverload,
        min_duration_secs: 2 * HOUR,
        max_duration_secs: 8 * HOUR,
        participants: Participants::Only(&[(Temperature, Rise), (Current, Rise)]),
        latent_until: 0.4,
        warning_until: 0.75,
        erratic: 0.0,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::HydraulicLoss,
        min_duration_secs: 6 * HOUR,
        max_duration_secs: 48 * HOUR,
        participants: Participants::Only(&[(Pressure, Fall), (Flow, Fall), (Temperature, Rise)]),
        latent_until: 0.5,
        warning_until: 0.8,
        erratic: 0.03,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::ToolWear,
        min_duration_secs: 8 * HOUR,
        max_duration_secs: 40 * HOUR,
        participants: Participants::Only(&[(Torque, Rise), (Vibration, Rise), (Power, Rise)]),
        latent_until: 0.6,
        warning_until: 0.9,
        erratic: 0.0,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::WeldDrift,
        min_duration_secs: 4 * HOUR,
        max_duration_secs: 24 * HOUR,
        participants: Participants::Only(&[(Current, Rise), (Voltage, Fall), (Temperature, Rise)]),
        latent_until: 0.5,
        warning_until: 0.8,
        erratic: 0.08,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::PneumaticLeak,
        min_duration_secs: 12 * HOUR,
        max_duration_secs: 72 * HOUR,
        participants: Participants::Only(&[(Pressure, Fall), (Flow, Rise)]),
        latent_until: 0.5,
        warning_until: 0.85,
        erratic: 0.0,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::CoolantFailure,
        min_duration_secs: HOUR,
        max_duration_secs: 6 * HOUR,
        participants: Participants::Only(&[(Temperature, Rise), (Flow, Fall)]),
        latent_until: 0.3,
        warning_until: 0.65,
        erratic: 0.0,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::PositioningDrift,
        min_duration_secs: DAY,
        max_duration_secs: 5 * DAY,
        participants: Participants::Only(&[(Position, Rise)]),
        latent_until: 0.6,
        warning_until: 0.85,
        erratic: 0.0,
        quality: CLEAN,
    },
    PatternSpec {
        kind: FaultKind::ElectricalFault,
        min_duration_secs: 10 * MINUTE,
        max_duration_secs: 2 * HOUR,
        participants: Participants::Only(&[(Current, Rise), (Voltage, Fall), (Power, Rise)]),
        latent_until: 0.2,
        warning_until: 0.5,
        erratic: 0.15,
        quality: [Good, Uncertain, Uncertain],
    },
    PatternSpec {
        kind: FaultKind::SensorDrift,
        min_duration_secs: 2 * DAY,
        max_duration_secs: 10 * DAY,
        participants: Participants::All(Rise),
        latent_until: 0.5,
        warning_until: 0.8,
        erratic: 0.0,
        quality: [Good, Uncertain, Bad],
    },
];

/// Look up the static spec of a fault kind.
pub fn pattern(kind: FaultKind) -> &'static PatternSpec {
    // Ordered like `FaultKind::ALL`.
    &PATTERNS[kind as usize]
}

/// Patterns applicable to a machine fitted with `sensors`.
pub fn eligible_patterns(sensors: &BTreeSet<SensorKind>) -> Vec<FaultKind> {
    FaultKind::ALL
        .into_iter()
        .filter(|kind| pattern(*kind).is_eligible(sensors))
        .collect()
}
