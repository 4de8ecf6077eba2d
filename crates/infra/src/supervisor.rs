//! Restart supervision for simulation workers.
//!
//! Every worker is spawned from a factory so a crashed worker can be
//! rebuilt with the same partition. A panic is isolated to its task, logged
//! and followed by a restart; more than `max_restarts` crashes of one worker
//! inside `restart_window_secs` is reported on the fatal channel and that
//! worker stays down.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{error, info, warn};

use crate::config::SupervisorConfig;

pub type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Builds a fresh run of a worker. Called once at spawn and once per restart.
pub type WorkerFactory = Arc<dyn Fn() -> WorkerFuture + Send + Sync + 'static>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("worker {worker} crashed {crashes} times within {window_secs}s, restart budget exhausted")]
    RestartBudgetExhausted {
        worker: String,
        crashes: usize,
        window_secs: u64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub workers: u64,
    pub crashes: u64,
    pub restarts: u64,
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    workers: AtomicU64,
    crashes: AtomicU64,
    restarts: AtomicU64,
    exhausted: AtomicU64,
}

/// Sliding-window crash budget for one worker.
#[derive(Debug)]
struct RestartBudget {
    max_restarts: usize,
    window: Duration,
    crashes: VecDeque<Instant>,
}

impl RestartBudget {
    fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts: max_restarts as usize,
            window,
            crashes: VecDeque::new(),
        }
    }

    /// Record a crash at `now`; `false` once the budget is spent.
    fn record(&mut self, now: Instant) -> bool {
        while let Some(first) = self.crashes.front() {
            if now.duration_since(*first) >= self.window {
                self.crashes.pop_front();
            } else {
                break;
            }
        }
        self.crashes.push_back(now);
        self.crashes.len() <= self.max_restarts
    }

    fn recent(&self) -> usize {
        self.crashes.len()
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    counters: Arc<Counters>,
    fatal: mpsc::Sender<SupervisorError>,
    shutdown: watch::Receiver<bool>,
    monitors: Vec<(String, JoinHandle<()>)>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("workers", &self.monitors.len())
            .finish()
    }
}

/// Cheap, cloneable view of supervisor counters.
#[derive(Debug, Clone)]
pub struct SupervisorProbe(Arc<Counters>);

impl SupervisorProbe {
    pub fn stats(&self) -> SupervisorStats {
        SupervisorStats {
            workers: self.0.workers.load(Ordering::Relaxed),
            crashes: self.0.crashes.load(Ordering::Relaxed),
            restarts: self.0.restarts.load(Ordering::Relaxed),
            exhausted: self.0.exhausted.load(Ordering::Relaxed),
        }
    }
}

impl Supervisor {
    /// `shutdown` flipping to `true` suppresses further restarts; workers
    /// are expected to observe the same signal and return.
    pub fn new(config: SupervisorConfig, fatal: mpsc::Sender<SupervisorError>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            fatal,
            shutdown,
            monitors: Vec::new(),
        }
    }

    pub fn probe(&self) -> SupervisorProbe {
        SupervisorProbe(self.counters.clone())
    }

    pub fn stats(&self) -> SupervisorStats {
        self.probe().stats()
    }

    pub fn spawn(&mut self, name: impl Into<String>, factory: WorkerFactory) {
        let name = name.into();
        self.counters.workers.fetch_add(1, Ordering::Relaxed);
        let monitor = tokio::spawn(monitor(
            name.clone(),
            factory,
            RestartBudget::new(
                self.config.max_restarts,
                Duration::from_secs(self.config.restart_window_secs),
            ),
            self.config.restart_window_secs,
            self.counters.clone(),
            self.fatal.clone(),
            self.shutdown.clone(),
        ));
        self.monitors.push((name, monitor));
    }

    /// Wait for every worker to return, aborting stragglers after
    /// `drain_timeout`. Returns the names of abandoned workers.
    pub async fn join(self, drain_timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + drain_timeout;
        let mut abandoned = Vec::new();
        for (name, mut handle) in self.monitors {
            let left = deadline.saturating_duration_since(Instant::now());
            if timeout(left, &mut handle).await.is_err() {
                handle.abort();
                abandoned.push(name);
            }
        }
        if !abandoned.is_empty() {
            error!(workers = ?abandoned, "drain timeout expired, workers abandoned mid-tick");
        }
        abandoned
    }
}

async fn monitor(
    name: String,
    factory: WorkerFactory,
    mut budget: RestartBudget,
    window_secs: u64,
    counters: Arc<Counters>,
    fatal: mpsc::Sender<SupervisorError>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let panic = match tokio::spawn(factory()).await {
            Ok(()) => {
                info!(worker = %name, "worker stopped");
                return;
            }
            Err(e) if e.is_panic() => e.into_panic(),
            Err(_) => {
                info!(worker = %name, "worker cancelled");
                return;
            }
        };

        counters.crashes.fetch_add(1, Ordering::Relaxed);
        let reason = panic_message(panic.as_ref());
        if *shutdown.borrow() {
            warn!(worker = %name, reason = %reason, "worker crashed during shutdown");
            return;
        }

        if !budget.record(Instant::now()) {
            counters.exhausted.fetch_add(1, Ordering::Relaxed);
            error!(worker = %name, crashes = budget.recent(), window_secs, reason = %reason, "restart budget exhausted");
            let _ = fatal
                .send(SupervisorError::RestartBudgetExhausted {
                    worker: name.clone(),
                    crashes: budget.recent(),
                    window_secs,
                })
                .await;
            return;
        }

        counters.restarts.fetch_add(1, Ordering::Relaxed);
        warn!(worker = %name, crashes = budget.recent(), reason = %reason, "worker crashed, restarting");
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
