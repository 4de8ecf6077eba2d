//! Periodic simulation scheduling.
//!
//! Machines are split round-robin into partitions; every partition runs a
//! sensor worker on the sensor cadence and a machine worker on the machine
//! cadence, both supervised. Tick `n` of a cadence fires at
//! `epoch + n * period` (the first at `epoch + period`) and stamps its
//! records with the same instant on the simulated UTC timeline.

mod control;
mod worker;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use plantwire_core::{EntityCatalog, MachineId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PlantwireConfig;
use crate::dispatch::SinkDispatcher;
use crate::supervisor::{Supervisor, SupervisorError, SupervisorProbe, WorkerFuture};

pub use control::{ControlError, MachineCommand, SchedulerControl, SensorCommand};
use control::PartitionChannels;
use worker::{PartitionContext, run_machine_worker, run_sensor_worker};

const CONTROL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Maps tick numbers to Tokio instants and simulated UTC timestamps.
#[derive(Debug, Clone, Copy)]
pub struct SimClock {
    epoch_utc: DateTime<Utc>,
    epoch: Instant,
}

impl SimClock {
    pub fn new(epoch_utc: DateTime<Utc>, epoch: Instant) -> Self {
        Self { epoch_utc, epoch }
    }

    /// Epoch at the current whole second.
    pub fn starting_now() -> Self {
        let now = Utc::now();
        let epoch_utc = DateTime::from_timestamp(now.timestamp(), 0).unwrap_or(now);
        Self::new(epoch_utc, Instant::now())
    }

    pub fn epoch_utc(&self) -> DateTime<Utc> {
        self.epoch_utc
    }

    fn offset(tick: u64, period: Duration) -> Duration {
        Duration::from_millis((period.as_millis() as u64).saturating_mul(tick))
    }

    pub fn at(&self, tick: u64, period: Duration) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(Self::offset(tick, period)).unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch_utc + offset
    }

    pub fn instant_of(&self, tick: u64, period: Duration) -> Instant {
        self.epoch + Self::offset(tick, period)
    }

    /// Nearest tick number for a scheduled instant.
    pub fn tick_of(&self, at: Instant, period: Duration) -> u64 {
        let elapsed = at.saturating_duration_since(self.epoch).as_millis();
        let period = period.as_millis().max(1);
        ((elapsed + period / 2) / period) as u64
    }

    /// Simulated wall time for work done between ticks (operator commands).
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.epoch.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.epoch_utc + elapsed
    }
}

#[derive(Debug, Default)]
pub(crate) struct SchedulerCounters {
    pub sensor_ticks: AtomicU64,
    pub machine_ticks: AtomicU64,
    pub readings_emitted: AtomicU64,
    pub machine_records_emitted: AtomicU64,
    pub non_finite_discarded: AtomicU64,
    pub faults_injected: AtomicU64,
    pub manual_faults: AtomicU64,
    pub faults_cleared: AtomicU64,
    pub transitions: AtomicU64,
    pub missed_ticks: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub partitions: usize,
    pub machines: usize,
    pub sensors: usize,
    pub sensor_ticks: u64,
    pub machine_ticks: u64,
    pub readings_emitted: u64,
    pub machine_records_emitted: u64,
    pub non_finite_discarded: u64,
    pub faults_injected: u64,
    pub manual_faults: u64,
    pub faults_cleared: u64,
    pub transitions: u64,
    pub missed_ticks: u64,
}

#[derive(Debug, Clone)]
pub struct SchedulerProbe {
    counters: Arc<SchedulerCounters>,
    partitions: usize,
    machines: usize,
    sensors: usize,
}

impl SchedulerProbe {
    pub fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            partitions: self.partitions,
            machines: self.machines,
            sensors: self.sensors,
            sensor_ticks: c.sensor_ticks.load(Ordering::Relaxed),
            machine_ticks: c.machine_ticks.load(Ordering::Relaxed),
            readings_emitted: c.readings_emitted.load(Ordering::Relaxed),
            machine_records_emitted: c.machine_records_emitted.load(Ordering::Relaxed),
            non_finite_discarded: c.non_finite_discarded.load(Ordering::Relaxed),
            faults_injected: c.faults_injected.load(Ordering::Relaxed),
            manual_faults: c.manual_faults.load(Ordering::Relaxed),
            faults_cleared: c.faults_cleared.load(Ordering::Relaxed),
            transitions: c.transitions.load(Ordering::Relaxed),
            missed_ticks: c.missed_ticks.load(Ordering::Relaxed),
        }
    }
}

/// Round-robin assignment of machines (in id order) to at most `workers`
/// non-empty partitions.
pub fn partition(catalog: &EntityCatalog, workers: usize) -> Vec<Vec<MachineId>> {
    let count = workers.max(1).min(catalog.machine_count());
    let mut partitions = vec![Vec::new(); count];
    for (i, machine) in catalog.machines().enumerate() {
        partitions[i % count].push(machine.id.clone());
    }
    partitions
}

#[derive(Debug)]
pub struct Scheduler {
    supervisor: Supervisor,
    shutdown: watch::Sender<bool>,
    control: SchedulerControl,
    probe: SchedulerProbe,
    drain_timeout: Duration,
    seed: u64,
}

impl Scheduler {
    /// Partition the catalog and start every worker under supervision.
    /// Restart-budget exhaustion is reported on `fatal`.
    pub fn start(
        catalog: Arc<EntityCatalog>,
        dispatcher: Arc<SinkDispatcher>,
        config: &PlantwireConfig,
        clock: SimClock,
        fatal: mpsc::Sender<SupervisorError>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut supervisor = Supervisor::new(config.supervisor.clone(), fatal, shutdown_rx.clone());
        let counters = Arc::new(SchedulerCounters::default());

        let seed = config.simulation.seed.unwrap_or_else(rand::random);
        info!(seed, configured = config.simulation.seed.is_some(), "simulation seed");

        let plan = partition(&catalog, config.scheduler.workers);
        if plan.is_empty() {
            warn!("catalog has no machines, nothing to simulate");
        }

        let mut routes = BTreeMap::new();
        let mut channels = Vec::with_capacity(plan.len());
        for (index, machines) in plan.into_iter().enumerate() {
            let (sensor_tx, sensor_rx) = mpsc::channel(config.scheduler.control_buffer.max(1));
            let (machine_tx, machine_rx) = mpsc::channel(config.scheduler.control_buffer.max(1));
            for id in &machines {
                routes.insert(id.clone(), index);
            }
            let faults = machines.iter().map(|id| (id.clone(), watch::channel(None).0)).collect();
            let maintenance = machines.iter().map(|id| (id.clone(), watch::channel(0).0)).collect();

            let ctx = Arc::new(PartitionContext {
                index,
                machines,
                catalog: catalog.clone(),
                dispatcher: dispatcher.clone(),
                simulation: config.simulation.clone(),
                sensor_period: config.scheduler.sensor_cadence(),
                machine_period: config.scheduler.machine_cadence(),
                clock,
                seed,
                faults,
                maintenance,
                sensor_rx: Mutex::new(sensor_rx),
                machine_rx: Mutex::new(machine_rx),
                last_sensor_tick: AtomicU64::new(0),
                last_machine_tick: AtomicU64::new(0),
                counters: counters.clone(),
                shutdown: shutdown_rx.clone(),
            });
            channels.push(PartitionChannels {
                sensor: sensor_tx,
                machine: machine_tx,
            });

            let sensors = ctx.clone();
            supervisor.spawn(
                ctx.name("sensors"),
                Arc::new(move || Box::pin(run_sensor_worker(sensors.clone())) as WorkerFuture),
            );
            let machines = ctx.clone();
            supervisor.spawn(
                ctx.name("machines"),
                Arc::new(move || Box::pin(run_machine_worker(machines.clone())) as WorkerFuture),
            );
        }

        let probe = SchedulerProbe {
            counters,
            partitions: channels.len(),
            machines: catalog.machine_count(),
            sensors: catalog.sensor_count(),
        };
        info!(
            partitions = probe.partitions,
            machines = probe.machines,
            sensors = probe.sensors,
            sensor_cadence_secs = config.scheduler.sensor_cadence_secs,
            machine_cadence_secs = config.scheduler.machine_cadence_secs,
            "scheduler started"
        );

        Self {
            supervisor,
            shutdown,
            control: SchedulerControl {
                catalog,
                routes: Arc::new(routes),
                partitions: Arc::new(channels),
                reply_timeout: CONTROL_REPLY_TIMEOUT,
            },
            probe,
            drain_timeout: config.scheduler.drain_timeout(),
            seed,
        }
    }

    pub fn control(&self) -> SchedulerControl {
        self.control.clone()
    }

    pub fn probe(&self) -> SchedulerProbe {
        self.probe.clone()
    }

    pub fn supervisor(&self) -> SupervisorProbe {
        self.supervisor.probe()
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn stats(&self) -> SchedulerStats {
        self.probe.stats()
    }

    /// Stop ticking and wait for workers to finish the tick in progress,
    /// bounded by the drain timeout. Returns the abandoned workers.
    pub async fn stop(self) -> Vec<String> {
        self.shutdown.send_replace(true);
        let abandoned = self.supervisor.join(self.drain_timeout).await;
        info!(stats = ?self.probe.stats(), "scheduler stopped");
        abandoned
    }
}
