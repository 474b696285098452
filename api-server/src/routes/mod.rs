//! Route handlers

pub mod agents;
pub mod health;
pub mod ops;
pub mod queue;

use axum::{http::StatusCode, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use agent_runner::ExecutorError;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn error_response(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

/// Map orchestration errors onto HTTP status codes
pub fn executor_error(err: ExecutorError) -> ApiError {
    let status = match &err {
        ExecutorError::AgentNotFound { .. } => StatusCode::NOT_FOUND,
        ExecutorError::AlreadyTerminal { .. } | ExecutorError::NotRemovable { .. } => {
            StatusCode::CONFLICT
        }
        ExecutorError::InvalidFolder { .. } | ExecutorError::InvalidAgentType { .. } => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(status, err.to_string())
}

/// Full REST application
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(agents::router())
        .merge(queue::router())
        .merge(ops::router())
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
