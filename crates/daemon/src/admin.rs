//! Operator admin API.
//!
//! - `GET  /health` - liveness and restart-budget status
//! - `GET  /stats` - scheduler, dispatcher and supervisor counters
//! - `POST /faults` - manual fault injection
//! - `POST /machines/:id/acknowledge` - operator acknowledgement of a fault
//! - `POST /machines/:id/faults/clear` - drop any injection on a machine

use std::net::SocketAddr;

use axum::{
    Extension, Json, Router,
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use plantwire_core::{FaultKind, MachineId, PlantError};
use plantwire_infra::{ControlError, PlantHandle};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Severity used when a request does not name one.
pub const DEFAULT_SEVERITY: f64 = 0.8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InjectFaultRequest {
    pub machine_id: MachineId,
    pub kind: FaultKind,
    #[serde(default)]
    pub severity: Option<f64>,
    /// Defaults to the middle of the pattern's duration range.
    #[serde(default)]
    pub duration_secs: Option<u64>,
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

fn control_error_to_response(err: ControlError) -> axum::response::Response {
    match err {
        ControlError::UnknownMachine(id) => {
            json_error(StatusCode::NOT_FOUND, "unknown_machine", format!("unknown machine '{id}'"))
        }
        ControlError::Rejected(PlantError::Conflict(msg)) => json_error(StatusCode::CONFLICT, "conflict", msg),
        ControlError::Rejected(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        ControlError::Unavailable(msg) => json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
    }
}

pub fn router(plant: PlantHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/faults", post(inject_fault))
        .route("/machines/:id/acknowledge", post(acknowledge))
        .route("/machines/:id/faults/clear", post(clear_faults))
        .layer(Extension(plant))
}

async fn health(Extension(plant): Extension<PlantHandle>) -> axum::response::Response {
    Json(plant.health()).into_response()
}

async fn stats(Extension(plant): Extension<PlantHandle>) -> axum::response::Response {
    Json(plant.stats()).into_response()
}

async fn inject_fault(
    Extension(plant): Extension<PlantHandle>,
    Json(body): Json<InjectFaultRequest>,
) -> axum::response::Response {
    let severity = body.severity.unwrap_or(DEFAULT_SEVERITY);
    match plant
        .inject_fault(&body.machine_id, body.kind, body.duration_secs, severity)
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "machine_id": body.machine_id,
                "kind": body.kind,
                "severity": severity,
            })),
        )
            .into_response(),
        Err(e) => control_error_to_response(e),
    }
}

async fn acknowledge(Extension(plant): Extension<PlantHandle>, Path(id): Path<String>) -> axum::response::Response {
    let machine = MachineId::new(id);
    match plant.acknowledge(&machine).await {
        Ok(was_faulted) => Json(json!({ "machine_id": machine, "was_faulted": was_faulted })).into_response(),
        Err(e) => control_error_to_response(e),
    }
}

async fn clear_faults(Extension(plant): Extension<PlantHandle>, Path(id): Path<String>) -> axum::response::Response {
    let machine = MachineId::new(id);
    match plant.clear_faults(&machine).await {
        Ok(cleared) => Json(json!({ "machine_id": machine, "cleared": cleared })).into_response(),
        Err(e) => control_error_to_response(e),
    }
}

/// Running admin server; stop it with [`AdminServer::shutdown`].
#[derive(Debug)]
pub struct AdminServer {
    pub addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl AdminServer {
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

pub async fn serve(addr: SocketAddr, plant: PlantHandle) -> std::io::Result<AdminServer> {
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    let (stop, stopped) = oneshot::channel::<()>();
    let app = router(plant);

    let task = tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = stopped.await;
        });
        if let Err(e) = server.await {
            error!(error = %e, "admin server failed");
        }
    });
    info!(addr = %addr, "admin api listening");

    Ok(AdminServer { addr, stop, task })
}
