//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use agent_runner::ManagerStats;

use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    agent_program: String,
    notifications: String,
    #[serde(flatten)]
    stats: ManagerStats,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        agent_program: state.config().agent_command.program.clone(),
        notifications: state.notification_target().to_string(),
        stats: state.manager().stats().await,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
