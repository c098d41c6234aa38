use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness check with build metadata.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let live = state.admin.running().map(|r| r.len()).ok();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "git_sha": env!("SUBTRACK_GIT_SHA"),
        "live_workflows": live,
    }))
}
