//! Machine operating state and OEE.
//!
//! The model is advanced once per machine tick. Production accrues for the
//! time spent `Running` since the previous tick; transitions are then taken
//! based on the current fault annotation, shift intensity and dwell times.

use chrono::{DateTime, Duration, NaiveTime, Timelike, Utc};
use plantwire_core::{
    FaultAnnotation, FaultPhase, Machine, MachineProfile, MachineState, MachineStateRecord, Shift,
};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Production intensity per shift (probability of starting / staying busy).
///
/// Shifts are primary 06–14, second 14–22 and night 22–06, in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftCalendar {
    pub primary: f64,
    pub second: f64,
    pub night: f64,
}

impl Default for ShiftCalendar {
    fn default() -> Self {
        Self {
            primary: 0.9,
            second: 0.7,
            night: 0.4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShiftWindow {
    pub shift: Shift,
    pub starts_at: DateTime<Utc>,
    pub intensity: f64,
}

impl ShiftCalendar {
    pub fn at(&self, ts: DateTime<Utc>) -> ShiftWindow {
        let date = ts.date_naive();
        let hour = ts.hour();
        let (shift, day, start_hour, intensity) = match hour {
            6..=13 => (Shift::Primary, date, 6, self.primary),
            14..=21 => (Shift::Second, date, 14, self.second),
            22..=23 => (Shift::Night, date, 22, self.night),
            _ => (Shift::Night, date - Duration::days(1), 22, self.night),
        };
        let start = NaiveTime::from_hms_opt(start_hour, 0, 0).unwrap_or(NaiveTime::MIN);
        ShiftWindow {
            shift,
            starts_at: day.and_time(start).and_utc(),
            intensity: intensity.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSettings {
    /// A critical fault trips the machine when its severity exceeds this.
    pub trip_severity: f64,
    /// Fault → maintenance without an operator after this long.
    pub auto_ack_secs: u64,
    pub maintenance_secs: u64,
    /// Per-tick chance of a minor stoppage while running.
    pub minor_stop_probability: f64,
    pub minor_stop_secs: u64,
    /// Per-tick chance of going idle, scaled by `1 − shift intensity`.
    pub idle_probability: f64,
    pub shifts: ShiftCalendar,
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self {
            trip_severity: 0.5,
            auto_ack_secs: 1800,
            maintenance_secs: 7200,
            minor_stop_probability: 0.01,
            minor_stop_secs: 300,
            idle_probability: 0.05,
            shifts: ShiftCalendar::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: MachineState,
    pub to: MachineState,
}

#[derive(Debug, Clone)]
pub struct MachineTick {
    pub record: MachineStateRecord,
    pub transition: Option<Transition>,
}

#[derive(Debug, Clone, Default)]
struct ShiftCounters {
    run_secs: f64,
    parts: u64,
    rejected: u64,
    cycle_progress: f64,
}

/// Operating state of one machine.
#[derive(Debug, Clone)]
pub struct MachineStateModel {
    machine: Machine,
    profile: MachineProfile,
    settings: MachineSettings,
    state: MachineState,
    state_since: DateTime<Utc>,
    last_tick: DateTime<Utc>,
    shift: ShiftWindow,
    setup_done: bool,
    counters: ShiftCounters,
    pending_ack: bool,
    failures: u64,
    lifetime_run_secs: f64,
    fault_since: Option<DateTime<Utc>>,
    repairs: u64,
    repair_secs: f64,
}

fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds().max(0) as f64 / 1000.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Cycle-time multiplier and extra reject fraction for a fault phase.
fn fault_drag(fault: Option<&FaultAnnotation>) -> (f64, f64) {
    match fault {
        Some(f) => match f.phase {
            FaultPhase::Latent => (1.0, 0.005),
            FaultPhase::Warning => (1.15, 0.03),
            FaultPhase::Critical => (1.3 + 0.4 * f.severity, 0.08 + 0.12 * f.severity),
            FaultPhase::Resolved => (1.0, 0.0),
        },
        None => (1.0, 0.0),
    }
}

impl MachineStateModel {
    /// New model in `Idle` as of `started_at`.
    pub fn new(machine: Machine, settings: MachineSettings, started_at: DateTime<Utc>) -> Self {
        let profile = machine.kind.profile();
        let shift = settings.shifts.at(started_at);
        Self {
            machine,
            profile,
            settings,
            state: MachineState::Idle,
            state_since: started_at,
            last_tick: started_at,
            shift,
            setup_done: false,
            counters: ShiftCounters::default(),
            pending_ack: false,
            failures: 0,
            lifetime_run_secs: 0.0,
            fault_since: None,
            repairs: 0,
            repair_secs: 0.0,
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    /// Operator acknowledgement; applied on the next tick if the machine is
    /// still in `Fault`. Returns whether the machine is currently faulted.
    pub fn acknowledge(&mut self) -> bool {
        self.pending_ack = true;
        self.state == MachineState::Fault
    }

    pub fn tick<R: Rng + ?Sized>(
        &mut self,
        now: DateTime<Utc>,
        fault: Option<&FaultAnnotation>,
        rng: &mut R,
    ) -> MachineTick {
        let window = self.settings.shifts.at(now);
        if window.starts_at != self.shift.starts_at {
            let boundary = window.starts_at.max(self.last_tick);
            self.accrue(secs_between(self.last_tick, boundary), fault, rng);
            self.shift = window;
            self.counters = ShiftCounters::default();
            self.setup_done = false;
            self.accrue(secs_between(boundary, now), fault, rng);
        } else {
            self.shift = window;
            self.accrue(secs_between(self.last_tick, now), fault, rng);
        }
        self.last_tick = now;

        let transition = self.next_state(now, fault, rng).map(|to| {
            let from = self.state;
            self.enter(to, now);
            Transition { from, to }
        });
        self.pending_ack = false;

        MachineTick {
            record: self.record(now, fault),
            transition,
        }
    }

    fn accrue<R: Rng + ?Sized>(&mut self, secs: f64, fault: Option<&FaultAnnotation>, rng: &mut R) {
        if self.state != MachineState::Running || secs <= 0.0 {
            return;
        }
        let (slowdown, extra_reject) = fault_drag(fault);
        let cycle = self.machine.ideal_cycle_secs * slowdown;
        let reject_rate = (self.profile.base_reject_rate + extra_reject).clamp(0.0, 1.0);

        self.counters.run_secs += secs;
        self.lifetime_run_secs += secs;
        self.counters.cycle_progress += secs / cycle;
        let completed = self.counters.cycle_progress.floor();
        self.counters.cycle_progress -= completed;

        let completed = completed as u64;
        for _ in 0..completed {
            if reject_rate > 0.0 && rng.gen_bool(reject_rate) {
                self.counters.rejected += 1;
            }
        }
        self.counters.parts += completed;
    }

    fn trips(&self, fault: Option<&FaultAnnotation>) -> bool {
        fault.is_some_and(|f| f.phase == FaultPhase::Critical && f.severity > self.settings.trip_severity)
    }

    fn next_state<R: Rng + ?Sized>(
        &self,
        now: DateTime<Utc>,
        fault: Option<&FaultAnnotation>,
        rng: &mut R,
    ) -> Option<MachineState> {
        let dwell = secs_between(self.state_since, now);
        let intensity = self.shift.intensity;
        let mut chance = |p: f64| p > 0.0 && rng.gen_bool(p.min(1.0));

        match self.state {
            MachineState::Running => {
                if self.trips(fault) {
                    Some(MachineState::Fault)
                } else if chance(self.settings.minor_stop_probability) {
                    Some(MachineState::Stopped)
                } else if chance(self.settings.idle_probability * (1.0 - intensity)) {
                    Some(MachineState::Idle)
                } else {
                    None
                }
            }
            MachineState::Stopped => {
                (dwell >= self.settings.minor_stop_secs as f64).then_some(MachineState::Running)
            }
            MachineState::Setup => {
                (dwell >= self.profile.setup_secs as f64).then_some(MachineState::Running)
            }
            MachineState::Idle => {
                if !chance(intensity) {
                    None
                } else if self.setup_done {
                    Some(MachineState::Running)
                } else {
                    Some(MachineState::Setup)
                }
            }
            MachineState::Fault => (self.pending_ack || dwell >= self.settings.auto_ack_secs as f64)
                .then_some(MachineState::Maintenance),
            MachineState::Maintenance => {
                (dwell >= self.settings.maintenance_secs as f64).then_some(MachineState::Idle)
            }
        }
    }

    fn enter(&mut self, to: MachineState, now: DateTime<Utc>) {
        match (self.state, to) {
            (_, MachineState::Fault) => {
                self.failures += 1;
                self.fault_since = Some(now);
            }
            (MachineState::Setup, MachineState::Running) => self.setup_done = true,
            (MachineState::Maintenance, MachineState::Idle) => {
                if let Some(since) = self.fault_since.take() {
                    self.repairs += 1;
                    self.repair_secs += secs_between(since, now);
                }
            }
            _ => {}
        }
        self.state = to;
        self.state_since = now;
    }

    fn record(&self, now: DateTime<Utc>, fault: Option<&FaultAnnotation>) -> MachineStateRecord {
        let elapsed = secs_between(self.shift.starts_at, now);
        let c = &self.counters;

        let availability = if elapsed > 0.0 {
            (c.run_secs / elapsed).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let performance = if c.run_secs > 0.0 {
            (self.machine.ideal_cycle_secs * c.parts as f64 / c.run_secs).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let quality = if c.parts > 0 {
            ((c.parts - c.rejected) as f64 / c.parts as f64).clamp(0.0, 1.0)
        } else {
            1.0
        };

        MachineStateRecord {
            machine_id: self.machine.id.clone(),
            line_id: self.machine.line_id.clone(),
            factory_id: self.machine.factory_id.clone(),
            machine_kind: self.machine.kind,
            recorded_at: now,
            state: self.state,
            shift: self.shift.shift,
            time_in_state_secs: secs_between(self.state_since, now) as u64,
            availability: round2(availability * 100.0),
            performance: round2(performance * 100.0),
            quality: round2(quality * 100.0),
            oee: round2(availability * performance * quality),
            parts_produced: c.parts,
            parts_rejected: c.rejected,
            failure_count: self.failures,
            mtbf_hours: (self.failures > 0)
                .then(|| round2(self.lifetime_run_secs / 3600.0 / self.failures as f64)),
            mttr_hours: (self.repairs > 0)
                .then(|| round2(self.repair_secs / 3600.0 / self.repairs as f64)),
            fault: fault.cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plantwire_core::{FactoryId, FaultKind, FaultOrigin, LineId, MachineId, MachineKind};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    fn lathe() -> Machine {
        Machine {
            id: MachineId::new("LTH-001"),
            line_id: LineId::new("F01-L1"),
            factory_id: FactoryId::new("F01"),
            kind: MachineKind::Lathe,
            name: "lathe".into(),
            ideal_cycle_secs: 30.0,
        }
    }

    fn steady() -> MachineSettings {
        MachineSettings {
            minor_stop_probability: 0.0,
            idle_probability: 0.0,
            shifts: ShiftCalendar {
                primary: 1.0,
                second: 1.0,
                night: 1.0,
            },
            ..MachineSettings::default()
        }
    }

    fn critical(severity: f64, started_at: DateTime<Utc>) -> FaultAnnotation {
        FaultAnnotation {
            kind: FaultKind::ToolWear,
            phase: FaultPhase::Critical,
            severity,
            origin: FaultOrigin::Manual,
            started_at,
            progress: 0.95,
        }
    }

    #[test]
    fn shift_calendar_handles_the_night_shift() {
        let cal = ShiftCalendar::default();
        let w = cal.at(at("2026-03-02T03:30:00Z"));
        assert_eq!(w.shift, Shift::Night);
        assert_eq!(w.starts_at, at("2026-03-01T22:00:00Z"));
        assert_eq!(cal.at(at("2026-03-02T06:00:00Z")).shift, Shift::Primary);
        assert_eq!(cal.at(at("2026-03-02T21:59:59Z")).shift, Shift::Second);
    }

    #[test]
    fn first_start_of_shift_goes_through_setup() {
        let t0 = at("2026-03-02T06:00:00Z");
        let mut model = MachineStateModel::new(lathe(), steady(), t0);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(model.state(), MachineState::Idle);

        let tick = model.tick(t0 + Duration::seconds(60), None, &mut rng);
        assert_eq!(tick.record.state, MachineState::Setup);

        // Lathe changeover is 900 s.
        let tick = model.tick(t0 + Duration::seconds(960), None, &mut rng);
        assert_eq!(tick.record.state, MachineState::Running);
        let tick = model.tick(t0 + Duration::seconds(1020), None, &mut rng);
        assert_eq!(tick.record.parts_produced, 2);
        assert_eq!(tick.record.performance, 100.0);
    }

    #[test]
    fn critical_fault_trips_then_auto_acknowledges_and_repairs() {
        let t0 = at("2026-03-02T06:00:00Z");
        let mut model = MachineStateModel::new(lathe(), steady(), t0);
        let mut rng = StdRng::seed_from_u64(2);
        model.tick(t0 + Duration::seconds(60), None, &mut rng);
        model.tick(t0 + Duration::seconds(1020), None, &mut rng);
        assert_eq!(model.state(), MachineState::Running);

        let fault = critical(0.8, t0);
        let trip_at = t0 + Duration::seconds(1080);
        let tick = model.tick(trip_at, Some(&fault), &mut rng);
        assert_eq!(
            tick.transition,
            Some(Transition {
                from: MachineState::Running,
                to: MachineState::Fault
            })
        );
        assert_eq!(tick.record.failure_count, 1);

        let tick = model.tick(trip_at + Duration::seconds(1800), Some(&fault), &mut rng);
        assert_eq!(tick.record.state, MachineState::Maintenance);

        let tick = model.tick(trip_at + Duration::seconds(1800 + 7200), None, &mut rng);
        assert_eq!(tick.record.state, MachineState::Idle);
        assert_eq!(tick.record.mttr_hours, Some(2.5));
        assert!(tick.record.mtbf_hours.is_some());
    }

    #[test]
    fn low_severity_critical_does_not_trip() {
        let t0 = at("2026-03-02T06:00:00Z");
        let mut model = MachineStateModel::new(lathe(), steady(), t0);
        let mut rng = StdRng::seed_from_u64(3);
        model.tick(t0 + Duration::seconds(60), None, &mut rng);
        model.tick(t0 + Duration::seconds(1020), None, &mut rng);

        let fault = critical(0.4, t0);
        let tick = model.tick(t0 + Duration::seconds(1080), Some(&fault), &mut rng);
        assert_eq!(tick.record.state, MachineState::Running);
    }

    #[test]
    fn operator_acknowledgement_moves_fault_to_maintenance() {
        let t0 = at("2026-03-02T06:00:00Z");
        let mut model = MachineStateModel::new(lathe(), steady(), t0);
        let mut rng = StdRng::seed_from_u64(4);
        model.tick(t0 + Duration::seconds(60), None, &mut rng);
        model.tick(t0 + Duration::seconds(1020), None, &mut rng);
        let fault = critical(0.9, t0);
        model.tick(t0 + Duration::seconds(1080), Some(&fault), &mut rng);

        assert!(model.acknowledge());
        let tick = model.tick(t0 + Duration::seconds(1140), Some(&fault), &mut rng);
        assert_eq!(tick.record.state, MachineState::Maintenance);
    }

    #[test]
    fn counters_reset_at_shift_boundary() {
        let t0 = at("2026-03-02T13:00:00Z");
        let mut model = MachineStateModel::new(lathe(), steady(), t0);
        let mut rng = StdRng::seed_from_u64(5);
        let mut now = t0;
        for _ in 0..55 {
            now += Duration::seconds(60);
            model.tick(now, None, &mut rng);
        }
        let before = model.tick(at("2026-03-02T13:59:00Z"), None, &mut rng).record;
        assert!(before.parts_produced > 0);

        let after = model.tick(at("2026-03-02T14:01:00Z"), None, &mut rng).record;
        assert_eq!(after.shift, Shift::Second);
        assert_eq!(after.parts_produced, 2);
    }

    #[test]
    fn oee_components_stay_in_bounds() {
        let t0 = at("2026-03-02T05:00:00Z");
        let mut model = MachineStateModel::new(lathe(), MachineSettings::default(), t0);
        let mut rng = StdRng::seed_from_u64(6);
        for i in 1..=600 {
            let fault = (i % 50 > 40).then(|| critical(0.3, t0));
            let r = model.tick(t0 + Duration::seconds(60 * i), fault.as_ref(), &mut rng).record;
            for pct in [r.availability, r.performance, r.quality] {
                assert!((0.0..=100.0).contains(&pct));
            }
            assert!((0.0..=1.0).contains(&r.oee));
            assert!(r.parts_rejected <= r.parts_produced);
        }
    }
}
