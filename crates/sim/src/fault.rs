//! Per-machine fault state machine.
//!
//! A machine carries at most one injection. Its phase is a pure function of
//! the time since injection start; the per-sensor offset ("lift") is a
//! piecewise-linear curve anchored on the sensor's own thresholds:
//!
//! - latent: the range midpoint is lifted up to the warning limit,
//! - warning: the lowest possible baseline is lifted up to the critical limit,
//! - critical: a margin plus a severity-scaled progression beyond it.
//!
//! After the timeline elapses the injection is `Resolved` and its final lift
//! decays linearly to zero over the decay window.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use plantwire_core::{
    FaultAnnotation, FaultKind, FaultOrigin, FaultPhase, MachineId, PlantError, PlantResult,
    Quality, Sensor, SensorKind, Thresholds,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::patterns::{Direction, PatternSpec, eligible_patterns, pattern};
use crate::signal::jitter_bound;

/// Tunables for probabilistic injection and resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultSettings {
    /// Probability that a fault starts within one fault cycle.
    pub probability_per_cycle: f64,
    pub cycle_secs: u64,
    /// Time for a resolved fault's offset to decay to zero.
    pub decay_secs: u64,
    /// Extra distance beyond the critical limit, as a fraction of the
    /// normal→critical gap.
    pub critical_margin: f64,
    /// Range of severities drawn for probabilistic injections.
    pub min_severity: f64,
    pub max_severity: f64,
}

impl Default for FaultSettings {
    fn default() -> Self {
        Self {
            probability_per_cycle: 0.05,
            cycle_secs: 24 * 3600,
            decay_secs: 600,
            critical_margin: 0.05,
            min_severity: 0.3,
            max_severity: 1.0,
        }
    }
}

impl FaultSettings {
    /// Chance of injecting during one tick of `tick_secs`, scaled so that the
    /// cumulative probability over a full cycle equals `probability_per_cycle`.
    pub fn tick_probability(&self, tick_secs: f64) -> f64 {
        if self.cycle_secs == 0 {
            return 0.0;
        }
        let p = self.probability_per_cycle.clamp(0.0, 1.0);
        1.0 - (1.0 - p).powf(tick_secs / self.cycle_secs as f64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub kind: FaultKind,
    pub origin: FaultOrigin,
    pub severity: f64,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl Injection {
    fn spec(&self) -> &'static PatternSpec {
        pattern(self.kind)
    }

    fn progress(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;
        elapsed / self.duration_secs as f64
    }

    fn ends_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::seconds(self.duration_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum FaultState {
    #[default]
    None,
    Active(Injection),
    Resolved {
        injection: Injection,
        resolved_at: DateTime<Utc>,
    },
}

/// Offset anchors for one sensor under one direction.
struct LiftCurve {
    /// Lift at the end of latent.
    warning_lift: f64,
    /// Lift at the end of warning.
    critical_lift: f64,
    /// Distance from the normal edge to the critical limit.
    gap: f64,
    margin: f64,
}

impl LiftCurve {
    fn new(thresholds: &Thresholds, jb: f64, direction: Direction, margin_frac: f64) -> Self {
        let mid = thresholds.normal_mid();
        let (warning_lift, critical_lift, gap) = match direction {
            Direction::Rise => (
                thresholds.warning_high - mid,
                thresholds.critical_high - (thresholds.normal_min - jb),
                thresholds.critical_high - thresholds.normal_max,
            ),
            Direction::Fall => (
                mid - thresholds.warning_low,
                (thresholds.normal_max + jb) - thresholds.critical_low,
                thresholds.normal_min - thresholds.critical_low,
            ),
        };
        let margin = (margin_frac * gap).max(0.01 * thresholds.normal_span());
        Self {
            warning_lift,
            critical_lift,
            gap,
            margin,
        }
    }

    /// Unsigned lift for a phase and within-phase fraction.
    fn at(&self, phase: FaultPhase, fraction: f64, severity: f64) -> f64 {
        let f = fraction.clamp(0.0, 1.0);
        match phase {
            FaultPhase::Latent => self.warning_lift * f,
            FaultPhase::Warning => self.warning_lift + (self.critical_lift - self.warning_lift) * f,
            FaultPhase::Critical | FaultPhase::Resolved => {
                self.critical_lift + self.margin + severity * f * self.gap
            }
        }
    }
}

/// Fault state for one machine.
#[derive(Debug, Clone)]
pub struct FaultEngine {
    machine_id: MachineId,
    sensors: BTreeSet<SensorKind>,
    eligible: Vec<FaultKind>,
    settings: FaultSettings,
    state: FaultState,
}

impl FaultEngine {
    pub fn new(machine_id: MachineId, sensors: BTreeSet<SensorKind>, settings: FaultSettings) -> Self {
        let eligible = eligible_patterns(&sensors);
        Self {
            machine_id,
            sensors,
            eligible,
            settings,
            state: FaultState::None,
        }
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    pub fn state(&self) -> &FaultState {
        &self.state
    }

    pub fn settings(&self) -> &FaultSettings {
        &self.settings
    }

    /// Move an elapsed injection to `Resolved`. Call before reading phase or
    /// offsets for `now`.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        if let FaultState::Active(injection) = &self.state {
            if now >= injection.ends_at() {
                let injection = injection.clone();
                let resolved_at = injection.ends_at();
                self.state = FaultState::Resolved {
                    injection,
                    resolved_at,
                };
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, FaultState::Active(_))
    }

    pub fn phase(&self, now: DateTime<Utc>) -> Option<FaultPhase> {
        match &self.state {
            FaultState::None => None,
            FaultState::Active(injection) => {
                Some(injection.spec().phase_at(injection.progress(now)).0)
            }
            FaultState::Resolved { .. } => Some(FaultPhase::Resolved),
        }
    }

    /// Record annotation for `now`, or `None` when no injection is present.
    pub fn annotation(&self, now: DateTime<Utc>) -> Option<FaultAnnotation> {
        let (injection, phase, progress) = match &self.state {
            FaultState::None => return None,
            FaultState::Active(injection) => {
                let progress = injection.progress(now).min(1.0);
                (injection, injection.spec().phase_at(progress).0, progress)
            }
            FaultState::Resolved { injection, .. } => (injection, FaultPhase::Resolved, 1.0),
        };
        Some(FaultAnnotation {
            kind: injection.kind,
            phase,
            severity: injection.severity,
            origin: injection.origin,
            started_at: injection.started_at,
            progress,
        })
    }

    /// Offset for `sensor` at `now`; `None` when nothing acts on it.
    pub fn offset<R: Rng + ?Sized>(&self, sensor: &Sensor, now: DateTime<Utc>, rng: &mut R) -> Option<f64> {
        let jb = jitter_bound(&sensor.thresholds, sensor.kind.profile().jitter_pct);
        match &self.state {
            FaultState::None => None,
            FaultState::Active(injection) => {
                let spec = injection.spec();
                let direction = spec.direction_for(sensor.kind)?;
                let curve = LiftCurve::new(&sensor.thresholds, jb, direction, self.settings.critical_margin);
                let (phase, fraction) = spec.phase_at(injection.progress(now));
                let mut lift = curve.at(phase, fraction, injection.severity);
                if spec.erratic > 0.0 && phase != FaultPhase::Latent {
                    lift += rng.gen_range(0.0..=1.0) * spec.erratic * curve.gap;
                }
                Some(direction.sign() * lift)
            }
            FaultState::Resolved {
                injection,
                resolved_at,
            } => {
                let direction = injection.spec().direction_for(sensor.kind)?;
                let remaining = self.decay_remaining(*resolved_at, now);
                if remaining <= 0.0 {
                    return None;
                }
                let curve = LiftCurve::new(&sensor.thresholds, jb, direction, self.settings.critical_margin);
                let final_lift = curve.at(FaultPhase::Critical, 1.0, injection.severity);
                Some(direction.sign() * final_lift * remaining)
            }
        }
    }

    fn decay_remaining(&self, resolved_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        if self.settings.decay_secs == 0 {
            return 0.0;
        }
        let since = (now - resolved_at).num_milliseconds().max(0) as f64 / 1000.0;
        (1.0 - since / self.settings.decay_secs as f64).clamp(0.0, 1.0)
    }

    /// Quality a participating sensor reports at `now`.
    pub fn quality(&self, sensor: SensorKind, now: DateTime<Utc>) -> Quality {
        match &self.state {
            FaultState::Active(injection) => {
                let spec = injection.spec();
                if spec.direction_for(sensor).is_none() {
                    return Quality::Good;
                }
                spec.quality_in(spec.phase_at(injection.progress(now)).0)
            }
            _ => Quality::Good,
        }
    }

    /// Roll for a probabilistic injection over one tick of `tick_secs`.
    ///
    /// Never replaces an active injection. Returns the injected kind.
    pub fn maybe_inject<R: Rng + ?Sized>(
        &mut self,
        now: DateTime<Utc>,
        tick_secs: f64,
        rng: &mut R,
    ) -> Option<FaultKind> {
        if self.is_active() || self.eligible.is_empty() {
            return None;
        }
        let p = self.settings.tick_probability(tick_secs);
        if p <= 0.0 || !rng.gen_bool(p.min(1.0)) {
            return None;
        }

        let kind = self.eligible[rng.gen_range(0..self.eligible.len())];
        let spec = pattern(kind);
        let duration_secs = rng.gen_range(spec.min_duration_secs..=spec.max_duration_secs);
        let (lo, hi) = (self.settings.min_severity, self.settings.max_severity.max(self.settings.min_severity));
        let severity = if hi > lo { rng.gen_range(lo..=hi) } else { lo };

        self.state = FaultState::Active(Injection {
            kind,
            origin: FaultOrigin::Probabilistic,
            severity: severity.clamp(0.0, 1.0),
            started_at: now,
            duration_secs,
        });
        Some(kind)
    }

    /// Operator-requested injection.
    ///
    /// Replaces a probabilistic injection; rejected while another manual one
    /// is active or when the machine has no sensor the pattern acts on.
    pub fn inject_manual(
        &mut self,
        kind: FaultKind,
        duration_secs: Option<u64>,
        severity: f64,
        now: DateTime<Utc>,
    ) -> PlantResult<()> {
        if !(0.0..=1.0).contains(&severity) {
            return Err(PlantError::validation(format!(
                "severity must be within [0, 1], got {severity}"
            )));
        }
        let spec = pattern(kind);
        if !spec.is_eligible(&self.sensors) {
            return Err(PlantError::validation(format!(
                "{kind} does not apply to machine {}",
                self.machine_id
            )));
        }
        let duration_secs = duration_secs.unwrap_or((spec.min_duration_secs + spec.max_duration_secs) / 2);
        if duration_secs == 0 {
            return Err(PlantError::validation("duration must be positive"));
        }
        if let FaultState::Active(current) = &self.state {
            if current.origin == FaultOrigin::Manual {
                return Err(PlantError::conflict(format!(
                    "machine {} already has a manual {} injection",
                    self.machine_id, current.kind
                )));
            }
        }

        self.state = FaultState::Active(Injection {
            kind,
            origin: FaultOrigin::Manual,
            severity,
            started_at: now,
            duration_secs,
        });
        Ok(())
    }

    /// Maintenance or non-finite output: drop any injection.
    pub fn clear(&mut self) {
        self.state = FaultState::None;
    }
}
