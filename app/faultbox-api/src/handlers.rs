//! Action protocol handlers.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use faultbox_action::{ActionKind, ActionRequest, StatusReport, StopReport};

use crate::error::ApiError;
use crate::server::AppState;

/// Body of start/status/stop calls.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionIdBody {
    /// Id handed out by prepare.
    pub action_id: String,
}

/// Response of a successful prepare.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
    /// New action instance id.
    pub action_id: String,
    /// Initial state.
    pub state: &'static str,
}

/// `GET /` - the manifest of everything this agent serves.
pub async fn manifest(State(state): State<AppState>) -> Json<Value> {
    let actions: Vec<Value> = ActionKind::all()
        .into_iter()
        .map(|kind| {
            let id = kind.as_str();
            json!({
                "id": id,
                "endpoints": {
                    "prepare": format!("/{id}/prepare"),
                    "start": format!("/{id}/start"),
                    "status": format!("/{id}/status"),
                    "stop": format!("/{id}/stop"),
                }
            })
        })
        .collect();

    let engine = state.coordinator.engine();
    let engine_version = engine
        .version()
        .await
        .unwrap_or_else(|_| "unknown".to_string());
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "engine": {
            "kind": engine.kind().as_str(),
            "version": engine_version,
            "socket": engine.socket().display().to_string(),
        },
        "actions": actions,
        "discovery": { "targets": "/discovery/targets" },
    }))
}

/// `GET /discovery/targets` - the latest discovery snapshot.
pub async fn discovery_targets(State(state): State<AppState>) -> Json<Value> {
    let targets = state.discovery.snapshot().await;
    Json(json!({ "targets": targets }))
}

/// `POST /:action/prepare`.
pub async fn prepare(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(request): Json<ActionRequest>,
) -> Result<Json<PrepareResponse>, ApiError> {
    let kind = ActionKind::parse(&action)?;
    let action_id = state.coordinator.prepare(kind, &request).await?;
    Ok(Json(PrepareResponse {
        action_id,
        state: "preparing",
    }))
}

/// `POST /:action/start`.
pub async fn start(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(body): Json<ActionIdBody>,
) -> Result<Json<StatusReport>, ApiError> {
    ActionKind::parse(&action)?;
    let report = state.coordinator.start(&body.action_id).await?;
    Ok(Json(report))
}

/// `POST /:action/status`.
pub async fn status(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(body): Json<ActionIdBody>,
) -> Result<Json<StatusReport>, ApiError> {
    ActionKind::parse(&action)?;
    let report = state.coordinator.status(&body.action_id)?;
    Ok(Json(report))
}

/// `POST /:action/stop`.
pub async fn stop(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(body): Json<ActionIdBody>,
) -> Result<Json<StopReport>, ApiError> {
    ActionKind::parse(&action)?;
    let report = state.coordinator.stop(&body.action_id).await?;
    Ok(Json(report))
}

/// `GET /health/liveness`.
pub async fn liveness() -> &'static str {
    "OK"
}

/// `GET /health/readiness` - ready once the engine responds.
pub async fn readiness(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    state.coordinator.engine().version().await?;
    Ok("OK")
}
