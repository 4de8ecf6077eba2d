//! Partition workers.
//!
//! A partition owns a fixed set of machines. Its sensor worker owns the
//! fault engines and statistics windows of those machines; its machine
//! worker owns their state models. The two talk through two `watch`
//! channels per machine: fault snapshots flow to the machine worker and a
//! maintenance counter flows back, so a repair clears the injection on the
//! next sensor tick no matter how busy the command channel is.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use plantwire_core::{
    EntityCatalog, FaultAnnotation, MachineId, MachineState, PlantError, Reading, Sensor, TelemetryRecord,
};
use plantwire_sim::{FaultEngine, MachineStateModel, StatWindow, signal};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use super::control::{MachineCommand, SensorCommand};
use super::{SchedulerCounters, SimClock};
use crate::config::SimulationConfig;
use crate::dispatch::SinkDispatcher;

/// Everything both workers of one partition share. Survives worker
/// restarts, so a restarted worker resumes after the last completed tick.
pub(crate) struct PartitionContext {
    pub index: usize,
    pub machines: Vec<MachineId>,
    pub catalog: Arc<EntityCatalog>,
    pub dispatcher: Arc<SinkDispatcher>,
    pub simulation: SimulationConfig,
    pub sensor_period: Duration,
    pub machine_period: Duration,
    pub clock: SimClock,
    pub seed: u64,
    pub faults: BTreeMap<MachineId, watch::Sender<Option<FaultAnnotation>>>,
    /// Bumped by the machine worker each time a machine enters maintenance.
    pub maintenance: BTreeMap<MachineId, watch::Sender<u64>>,
    pub sensor_rx: Mutex<mpsc::Receiver<SensorCommand>>,
    pub machine_rx: Mutex<mpsc::Receiver<MachineCommand>>,
    pub last_sensor_tick: AtomicU64,
    pub last_machine_tick: AtomicU64,
    pub counters: Arc<SchedulerCounters>,
    pub shutdown: watch::Receiver<bool>,
}

const SENSOR_ROLE: u64 = 0x5e45_0000;
const MACHINE_ROLE: u64 = 0x3ac4_0000;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl PartitionContext {
    /// Per-machine RNG seed. `resume_tick` makes a restarted worker draw a
    /// fresh sequence instead of replaying the crashed one.
    fn rng_for(&self, machine: &MachineId, role: u64, resume_tick: u64) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ fnv1a(machine.as_str().as_bytes()) ^ role ^ resume_tick.rotate_left(32))
    }

    fn injection_due(&self, tick: u64) -> bool {
        let every = (self.machine_period.as_secs() / self.sensor_period.as_secs().max(1)).max(1);
        tick % every == 0
    }

    pub(crate) fn name(&self, role: &str) -> String {
        format!("partition-{}-{}", self.index, role)
    }
}

struct SensorChannel {
    sensor: Sensor,
    window: StatWindow,
    /// Emit on every `stride`-th sensor tick.
    stride: u64,
}

struct MachineSensors {
    machine: MachineId,
    engine: FaultEngine,
    channels: Vec<SensorChannel>,
    rng: StdRng,
    fault_tx: watch::Sender<Option<FaultAnnotation>>,
    maintenance_rx: watch::Receiver<u64>,
}

impl MachineSensors {
    /// Drop any injection and publish the empty snapshot. Returns whether
    /// one was present.
    fn clear_fault(&mut self, now: DateTime<Utc>, ctx: &PartitionContext) -> bool {
        let present = self.engine.annotation(now).is_some();
        self.engine.clear();
        self.fault_tx.send_replace(None);
        if present {
            ctx.counters.faults_cleared.fetch_add(1, Ordering::Relaxed);
        }
        present
    }

    fn tick(&mut self, tick: u64, at: DateTime<Utc>, ctx: &PartitionContext, out: &mut Vec<TelemetryRecord>) {
        if self.maintenance_rx.has_changed().unwrap_or(false) {
            self.maintenance_rx.borrow_and_update();
            if self.clear_fault(at, ctx) {
                info!(machine = %self.machine, at = %at, "fault cleared by maintenance");
            }
        }
        self.engine.advance(at);
        if ctx.injection_due(tick) {
            let tick_secs = ctx.machine_period.as_secs_f64();
            if let Some(kind) = self.engine.maybe_inject(at, tick_secs, &mut self.rng) {
                ctx.counters.faults_injected.fetch_add(1, Ordering::Relaxed);
                info!(machine = %self.machine, fault = %kind, at = %at, "fault injected");
            }
        }

        let scorer = &ctx.simulation.anomaly;
        for channel in &mut self.channels {
            if tick % channel.stride != 0 {
                continue;
            }
            let sensor = &channel.sensor;
            let offset = self.engine.offset(sensor, at, &mut self.rng);
            let value = signal::sample(sensor, offset, &mut self.rng);
            if !value.is_finite() {
                ctx.counters.non_finite_discarded.fetch_add(1, Ordering::Relaxed);
                warn!(sensor = %sensor.id, machine = %self.machine, at = %at, "non-finite value discarded, resetting fault state");
                self.engine.clear();
                channel.window.reset();
                continue;
            }

            let window = channel.window.push(at, value);
            let anomaly_score = scorer.score(&sensor.thresholds, value, &window);
            let flags = sensor.thresholds.flags(value);
            out.push(TelemetryRecord::SensorReading(Reading {
                sensor_id: sensor.id.clone(),
                machine_id: sensor.machine_id.clone(),
                line_id: sensor.line_id.clone(),
                factory_id: sensor.factory_id.clone(),
                sensor_kind: sensor.kind,
                recorded_at: at,
                value,
                unit: sensor.unit.clone(),
                quality: self.engine.quality(sensor.kind, at),
                flags,
                status: flags.status(),
                window,
                anomaly_score,
                is_anomaly: scorer.is_anomaly(anomaly_score),
                fault: self.engine.annotation(at),
            }));
        }

        self.fault_tx.send_replace(self.engine.annotation(at));
    }
}

fn record_tick(last: &AtomicU64, tick: u64, missed: &AtomicU64) {
    let previous = last.swap(tick, Ordering::AcqRel);
    if tick > previous + 1 {
        missed.fetch_add(tick - previous - 1, Ordering::Relaxed);
    }
}

pub(crate) async fn run_sensor_worker(ctx: Arc<PartitionContext>) {
    let name = ctx.name("sensors");
    let mut commands = ctx.sensor_rx.lock().await;
    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return;
    }

    let resume = ctx.last_sensor_tick.load(Ordering::Acquire);
    let cadence_secs = ctx.sensor_period.as_secs().max(1);
    let mut machines: Vec<MachineSensors> = ctx
        .machines
        .iter()
        .filter_map(|id| {
            let fault_tx = ctx.faults.get(id)?.clone();
            let maintenance_rx = ctx.maintenance.get(id)?.subscribe();
            let channels = ctx
                .catalog
                .sensors_of(id)
                .map(|sensor| SensorChannel {
                    sensor: sensor.clone(),
                    window: StatWindow::new(ctx.simulation.window_secs),
                    stride: sensor.sampling_interval_secs.div_ceil(cadence_secs).max(1),
                })
                .collect();
            Some(MachineSensors {
                machine: id.clone(),
                engine: FaultEngine::new(id.clone(), ctx.catalog.sensor_kinds_of(id), ctx.simulation.faults.clone()),
                channels,
                rng: ctx.rng_for(id, SENSOR_ROLE, resume),
                fault_tx,
                maintenance_rx,
            })
        })
        .collect();

    let period = ctx.sensor_period;
    let mut ticker = interval_at(ctx.clock.instant_of(resume + 1, period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(worker = %name, machines = machines.len(), resume_after = resume, "sensor worker started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(cmd) = commands.recv() => handle_sensor_command(&mut machines, cmd, ctx.clock.now(), &ctx),
            scheduled = ticker.tick() => {
                let tick = ctx.clock.tick_of(scheduled, period);
                let at = ctx.clock.at(tick, period);
                let mut records = Vec::new();
                for machine in &mut machines {
                    machine.tick(tick, at, &ctx, &mut records);
                }
                let emitted = records.len() as u64;
                if !records.is_empty() {
                    ctx.dispatcher.submit(records).await;
                }
                ctx.counters.readings_emitted.fetch_add(emitted, Ordering::Relaxed);
                ctx.counters.sensor_ticks.fetch_add(1, Ordering::Relaxed);
                record_tick(&ctx.last_sensor_tick, tick, &ctx.counters.missed_ticks);
                debug!(worker = %name, tick, readings = emitted, "sensor tick");
            }
        }
    }
    info!(worker = %name, "sensor worker stopping");
}

fn handle_sensor_command(
    machines: &mut [MachineSensors],
    cmd: SensorCommand,
    now: DateTime<Utc>,
    ctx: &PartitionContext,
) {
    match cmd {
        SensorCommand::InjectFault {
            machine,
            kind,
            duration_secs,
            severity,
            reply,
        } => {
            let result = match machines.iter_mut().find(|m| m.machine == machine) {
                Some(m) => {
                    let result = m.engine.inject_manual(kind, duration_secs, severity, now);
                    if result.is_ok() {
                        m.fault_tx.send_replace(m.engine.annotation(now));
                    }
                    result
                }
                None => Err(PlantError::unknown("machine", machine.to_string())),
            };
            match &result {
                Ok(()) => {
                    ctx.counters.manual_faults.fetch_add(1, Ordering::Relaxed);
                    info!(machine = %machine, fault = %kind, severity, "manual fault injected");
                }
                Err(e) => warn!(machine = %machine, fault = %kind, error = %e, "manual fault rejected"),
            }
            let _ = reply.send(result);
        }
        SensorCommand::ClearFault { machine, reply } => {
            let cleared = machines
                .iter_mut()
                .find(|m| m.machine == machine)
                .is_some_and(|m| m.clear_fault(now, ctx));
            if cleared {
                info!(machine = %machine, "fault cleared by operator");
            }
            let _ = reply.send(cleared);
        }
    }
}

struct MachineSim {
    model: MachineStateModel,
    rng: StdRng,
    fault_rx: watch::Receiver<Option<FaultAnnotation>>,
}

pub(crate) async fn run_machine_worker(ctx: Arc<PartitionContext>) {
    let name = ctx.name("machines");
    let mut commands = ctx.machine_rx.lock().await;
    let mut shutdown = ctx.shutdown.clone();
    if *shutdown.borrow() {
        return;
    }

    let resume = ctx.last_machine_tick.load(Ordering::Acquire);
    let period = ctx.machine_period;
    let started_at = ctx.clock.at(resume, period);
    let mut machines: Vec<MachineSim> = ctx
        .machines
        .iter()
        .filter_map(|id| {
            let machine = ctx.catalog.machine(id)?.clone();
            Some(MachineSim {
                model: MachineStateModel::new(machine, ctx.simulation.machines.clone(), started_at),
                rng: ctx.rng_for(id, MACHINE_ROLE, resume),
                fault_rx: ctx.faults.get(id)?.subscribe(),
            })
        })
        .collect();

    let mut ticker = interval_at(ctx.clock.instant_of(resume + 1, period), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(worker = %name, machines = machines.len(), resume_after = resume, "machine worker started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            Some(cmd) = commands.recv() => match cmd {
                MachineCommand::Acknowledge { machine, reply } => {
                    let faulted = machines
                        .iter_mut()
                        .find(|m| m.model.machine().id == machine)
                        .map(|m| m.model.acknowledge())
                        .unwrap_or(false);
                    info!(machine = %machine, faulted, "acknowledged by operator");
                    let _ = reply.send(faulted);
                }
            },
            scheduled = ticker.tick() => {
                let tick = ctx.clock.tick_of(scheduled, period);
                let at = ctx.clock.at(tick, period);
                let mut records = Vec::with_capacity(machines.len());
                for sim in &mut machines {
                    let fault = sim.fault_rx.borrow().clone();
                    let step = sim.model.tick(at, fault.as_ref(), &mut sim.rng);
                    if let Some(transition) = step.transition {
                        ctx.counters.transitions.fetch_add(1, Ordering::Relaxed);
                        let machine = &sim.model.machine().id;
                        info!(machine = %machine, from = transition.from.as_str(), to = transition.to.as_str(), at = %at, "machine state changed");
                        if transition.to == MachineState::Maintenance {
                            if let Some(repairs) = ctx.maintenance.get(machine) {
                                repairs.send_modify(|n| *n += 1);
                            }
                        }
                    }
                    records.push(TelemetryRecord::MachineState(step.record));
                }
                let emitted = records.len() as u64;
                if !records.is_empty() {
                    ctx.dispatcher.submit(records).await;
                }
                ctx.counters.machine_records_emitted.fetch_add(emitted, Ordering::Relaxed);
                ctx.counters.machine_ticks.fetch_add(1, Ordering::Relaxed);
                record_tick(&ctx.last_machine_tick, tick, &ctx.counters.missed_ticks);
                debug!(worker = %name, tick, records = emitted, "machine tick");
            }
        }
    }
    info!(worker = %name, "machine worker stopping");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn missed_ticks_are_counted() {
        let last = AtomicU64::new(0);
        let missed = AtomicU64::new(0);
        record_tick(&last, 1, &missed);
        record_tick(&last, 4, &missed);
        assert_eq!(last.load(Ordering::Relaxed), 4);
        assert_eq!(missed.load(Ordering::Relaxed), 2);
    }
}
