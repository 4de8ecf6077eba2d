//! Operator and machine-worker commands routed to partition workers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use plantwire_core::{EntityCatalog, FaultKind, MachineId, PlantError, PlantResult};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

/// Handled by the sensor worker, which owns every fault engine of its
/// partition.
#[derive(Debug)]
pub enum SensorCommand {
    InjectFault {
        machine: MachineId,
        kind: FaultKind,
        duration_secs: Option<u64>,
        severity: f64,
        reply: oneshot::Sender<PlantResult<()>>,
    },
    /// Drop any injection; the reply says whether one was present.
    ClearFault {
        machine: MachineId,
        reply: oneshot::Sender<bool>,
    },
}

/// Handled by the machine worker.
#[derive(Debug)]
pub enum MachineCommand {
    /// Reply says whether the machine was in `fault` when acknowledged.
    Acknowledge {
        machine: MachineId,
        reply: oneshot::Sender<bool>,
    },
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown machine '{0}'")]
    UnknownMachine(MachineId),

    #[error(transparent)]
    Rejected(#[from] PlantError),

    #[error("worker unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub(crate) struct PartitionChannels {
    pub sensor: mpsc::Sender<SensorCommand>,
    pub machine: mpsc::Sender<MachineCommand>,
}

/// Cloneable entry point for commands; routes by machine to the owning
/// partition.
#[derive(Debug, Clone)]
pub struct SchedulerControl {
    pub(crate) catalog: Arc<EntityCatalog>,
    pub(crate) routes: Arc<BTreeMap<MachineId, usize>>,
    pub(crate) partitions: Arc<Vec<PartitionChannels>>,
    pub(crate) reply_timeout: Duration,
}

impl SchedulerControl {
    fn route(&self, machine: &MachineId) -> Result<&PartitionChannels, ControlError> {
        self.routes
            .get(machine)
            .and_then(|idx| self.partitions.get(*idx))
            .ok_or_else(|| ControlError::UnknownMachine(machine.clone()))
    }

    pub fn catalog(&self) -> &EntityCatalog {
        &self.catalog
    }

    async fn send<C>(&self, tx: &mpsc::Sender<C>, cmd: C) -> Result<(), ControlError> {
        match timeout(self.reply_timeout, tx.send(cmd)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ControlError::Unavailable("worker channel closed".into())),
            Err(_) => Err(ControlError::Unavailable("control channel full".into())),
        }
    }

    async fn await_reply<T>(&self, rx: oneshot::Receiver<T>) -> Result<T, ControlError> {
        match timeout(self.reply_timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ControlError::Unavailable("worker dropped the request".into())),
            Err(_) => Err(ControlError::Unavailable("no reply from worker".into())),
        }
    }

    /// Manual fault injection. `duration_secs` defaults to the middle of the
    /// pattern's duration range.
    pub async fn inject_fault(
        &self,
        machine: &MachineId,
        kind: FaultKind,
        duration_secs: Option<u64>,
        severity: f64,
    ) -> Result<(), ControlError> {
        let channels = self.route(machine)?;
        let (reply, rx) = oneshot::channel();
        self.send(
            &channels.sensor,
            SensorCommand::InjectFault {
                machine: machine.clone(),
                kind,
                duration_secs,
                severity,
                reply,
            },
        )
        .await?;
        Ok(self.await_reply(rx).await??)
    }

    pub async fn clear_faults(&self, machine: &MachineId) -> Result<bool, ControlError> {
        let channels = self.route(machine)?;
        let (reply, rx) = oneshot::channel();
        self.send(
            &channels.sensor,
            SensorCommand::ClearFault {
                machine: machine.clone(),
                reply,
            },
        )
        .await?;
        self.await_reply(rx).await
    }

    pub async fn acknowledge(&self, machine: &MachineId) -> Result<bool, ControlError> {
        let channels = self.route(machine)?;
        let (reply, rx) = oneshot::channel();
        self.send(
            &channels.machine,
            MachineCommand::Acknowledge {
                machine: machine.clone(),
                reply,
            },
        )
        .await?;
        self.await_reply(rx).await
    }
}
