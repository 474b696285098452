//! Queue API endpoints

use std::collections::BTreeMap;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use orch_core::QueueEntryView;

use crate::routes::{executor_error, ApiError};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    /// Pending count per folder
    pub queues: BTreeMap<String, usize>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDetailsResponse {
    pub queues: BTreeMap<String, Vec<QueueEntryView>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceQueueRequest {
    pub folder: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceQueueResponse {
    /// Agent started by this call, if the slot was free and the queue non-empty
    pub started: Option<String>,
}

/// GET /api/queue - Pending counts per folder
async fn queue_status(State(state): State<AppState>) -> Json<QueueStatusResponse> {
    let queues = state.manager().queue_status().await;
    let total = queues.values().sum();
    Json(QueueStatusResponse { queues, total })
}

/// GET /api/queue/details - Pending entries per folder
async fn queue_details(State(state): State<AppState>) -> Json<QueueDetailsResponse> {
    Json(QueueDetailsResponse {
        queues: state.manager().queue_details().await,
    })
}

/// POST /api/queue/advance - Promote the next entry if the folder is idle
async fn advance_queue(
    State(state): State<AppState>,
    Json(req): Json<AdvanceQueueRequest>,
) -> Result<Json<AdvanceQueueResponse>, ApiError> {
    let started = state
        .manager()
        .advance_queue(&req.folder)
        .await
        .map_err(executor_error)?;
    Ok(Json(AdvanceQueueResponse { started }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/queue", get(queue_status))
        .route("/api/queue/details", get(queue_details))
        .route("/api/queue/advance", post(advance_queue))
}
