//! Agent API endpoints
//!
//! Launch, inspect and kill agents.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use orch_core::{AgentSnapshot, LaunchOutcome, LaunchRequest};

use crate::routes::{executor_error, ApiError};
use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchAgentRequest {
    pub folder: String,
    pub prompt: String,
    /// Who should hear about the outcome
    pub requester: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchAgentResponse {
    /// Agent ID, or `queued:<position>:<queue_id>`
    pub id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
}

impl From<LaunchOutcome> for LaunchAgentResponse {
    fn from(outcome: LaunchOutcome) -> Self {
        let id = outcome.id();
        match outcome {
            LaunchOutcome::Started { agent_id } => Self {
                id,
                status: "started".to_string(),
                agent_id: Some(agent_id),
                queue_id: None,
                position: None,
            },
            LaunchOutcome::Queued { queue_id, position } => Self {
                id,
                status: "queued".to_string(),
                agent_id: None,
                queue_id: Some(queue_id),
                position: Some(position),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentListResponse {
    pub agents: Vec<AgentSnapshot>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/agents - Launch an agent or queue it behind the folder's runner
async fn launch_agent(
    State(state): State<AppState>,
    Json(req): Json<LaunchAgentRequest>,
) -> Result<(StatusCode, Json<LaunchAgentResponse>), ApiError> {
    let mut request = LaunchRequest::new(req.folder, req.prompt);
    if let Some(requester) = req.requester.filter(|r| !r.trim().is_empty()) {
        request = request.with_requester(requester);
    }

    let outcome = state
        .manager()
        .launch(request)
        .await
        .map_err(executor_error)?;

    let status = if outcome.is_queued() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome.into())))
}

/// GET /api/agents - List all known agents
async fn list_agents(State(state): State<AppState>) -> Json<AgentListResponse> {
    Json(AgentListResponse {
        agents: state.manager().list().await,
    })
}

/// GET /api/agents/{id} - Get one agent
async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentSnapshot>, ApiError> {
    state
        .manager()
        .get(&agent_id)
        .await
        .map(Json)
        .map_err(executor_error)
}

/// POST /api/agents/{id}/kill - Kill a running agent
async fn kill_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentSnapshot>, ApiError> {
    state
        .manager()
        .kill(&agent_id)
        .await
        .map(Json)
        .map_err(executor_error)
}

// ============================================================================
// Router
// ============================================================================

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/agents", post(launch_agent).get(list_agents))
        .route("/api/agents/{id}", get(get_agent))
        .route("/api/agents/{id}/kill", post(kill_agent))
}
