//! Update status and trigger endpoints.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{ApiError, AppState};
use crate::engine::EngineState;
use crate::report::{UpdateOutcome, UpdateRecord};

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub state: EngineState,
    pub installed: Option<String>,
    pub busy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_outcome: Option<UpdateOutcome>,
}

/// GET /status - engine state, installed version and last attempt
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let engine = &state.engine;
    let last_outcome = engine
        .history(1)
        .ok()
        .and_then(|records| records.first().map(|r| r.outcome));
    Json(StatusResponse {
        state: engine.current_state(),
        installed: engine.installed_version().ok().map(|v| v.to_string()),
        busy: engine.is_busy(),
        last_outcome,
    })
}

/// GET /version - installed system version and agent build
pub async fn version(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let installed = state
        .engine
        .installed_version()
        .map_err(anyhow::Error::from)?;
    Ok(Json(json!({
        "installed": installed.to_string(),
        "agent": env!("CARGO_PKG_VERSION"),
    })))
}

/// POST /updates/check - manual trigger, answers before the cycle runs
pub async fn check_now(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if state.engine.is_busy() {
        return Err(ApiError::Conflict(
            "update cycle already running".to_string(),
        ));
    }
    let engine = state.engine.clone();
    tokio::spawn(async move { engine.run_cycle_detached().await });
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

/// GET /updates/history?limit=N - most recent update records, newest first
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<UpdateRecord>>, ApiError> {
    let records = state
        .engine
        .history(query.limit)
        .map_err(anyhow::Error::from)?;
    Ok(Json(records))
}
