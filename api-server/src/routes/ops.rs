//! Operator APIs
//!
//! Manual recovery actions that bypass the background loops' time windows.

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::info;

use agent_runner::ManagerStats;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupResponse {
    removed: usize,
}

/// GET /api/ops/summary - Agent and queue counters
async fn summary(State(state): State<AppState>) -> Json<ManagerStats> {
    Json(state.manager().stats().await)
}

/// POST /api/ops/cleanup - Remove every notified terminal agent now
async fn force_cleanup(State(state): State<AppState>) -> Json<CleanupResponse> {
    let removed = state.manager().force_cleanup().await;
    info!(removed, "Force cleanup requested");
    Json(CleanupResponse { removed })
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/ops/summary", get(summary))
        .route("/api/ops/cleanup", post(force_cleanup))
}
