//! Admin workflow endpoints under `/api/v1/workflows`.
//!
//! Auth: `Authorization: Bearer <token>` when `gateway.auth.mode = "token"`.
//! Every response uses the envelope `{ "success", "message", "data" }`.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use subtrack_core::types::WorkflowHandle;
use subtrack_scheduler::SchedulerError;
use tracing::warn;

use crate::app::AppState;
use crate::auth::check_auth;

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    pub data: Value,
}

type ApiResult = Result<Json<Envelope>, (StatusCode, Json<Envelope>)>;

fn ok(message: &str, data: impl Serialize) -> ApiResult {
    let data = serde_json::to_value(data).map_err(|e| {
        failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), Some("SERIALIZATION_ERROR"))
    })?;
    Ok(Json(Envelope {
        success: true,
        message: message.to_string(),
        code: None,
        data,
    }))
}

fn failure(status: StatusCode, message: String, code: Option<&'static str>) -> (StatusCode, Json<Envelope>) {
    (
        status,
        Json(Envelope {
            success: false,
            message,
            code,
            data: Value::Null,
        }),
    )
}

fn from_error(e: SchedulerError) -> (StatusCode, Json<Envelope>) {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!(code = e.code(), "admin request failed: {e}");
    }
    failure(status, e.to_string(), Some(e.code()))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<Envelope>)> {
    if check_auth(&state.config.gateway.auth, headers) {
        Ok(())
    } else {
        Err(failure(
            StatusCode::UNAUTHORIZED,
            "Unauthorized. Set 'Authorization: Bearer <your-token>' header.".to_string(),
            Some("AUTH_FAILED"),
        ))
    }
}

/// GET /api/v1/workflows
pub async fn running(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authorize(&state, &headers)?;
    let rows = state.admin.running().map_err(from_error)?;
    ok(&format!("{} live workflow(s)", rows.len()), rows)
}

/// GET /api/v1/workflows/failed
pub async fn failed(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authorize(&state, &headers)?;
    let rows = state.admin.failed().map_err(from_error)?;
    ok(&format!("{} failed workflow(s)", rows.len()), rows)
}

/// GET /api/v1/workflows/undelivered
pub async fn undelivered(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authorize(&state, &headers)?;
    let rows = state.admin.undelivered().map_err(from_error)?;
    ok(&format!("{} undelivered reminder(s)", rows.len()), rows)
}

/// GET /api/v1/workflows/{handle}
pub async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> ApiResult {
    authorize(&state, &headers)?;
    let instance = state
        .admin
        .status(&WorkflowHandle::from(handle))
        .map_err(from_error)?;
    ok(&format!("workflow is {}", instance.status), instance)
}

/// GET /api/v1/workflows/{handle}/steps
pub async fn steps(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> ApiResult {
    authorize(&state, &headers)?;
    let steps = state
        .admin
        .steps(&WorkflowHandle::from(handle))
        .map_err(from_error)?;
    ok(&format!("{} journaled step(s)", steps.len()), steps)
}

/// POST /api/v1/workflows/{handle}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(handle): Path<String>,
) -> ApiResult {
    authorize(&state, &headers)?;
    let report = state
        .admin
        .cancel(&WorkflowHandle::from(handle))
        .map_err(from_error)?;
    ok(&format!("workflow {}", report.outcome), report)
}

/// POST /api/v1/workflows/cancel-all
pub async fn cancel_all(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    authorize(&state, &headers)?;
    let reports = state.admin.cancel_all().map_err(from_error)?;
    ok(&format!("{} workflow(s) cancelled", reports.len()), reports)
}
