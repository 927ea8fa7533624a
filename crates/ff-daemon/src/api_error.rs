//! HTTP API error types.
//!
//! Every failure leaves the API as `{"error": "..."}` with a status code
//! derived from the orchestrator error taxonomy.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ff_agents::OrchestratorError;
use serde_json::json;
use thiserror::Error;

use crate::daemon::LoopError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    /// The request conflicts with the current task or agent state.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    /// Well-formed but rejected: validation failures and refused queries.
    #[error("{0}")]
    Unprocessable(String),

    /// Retry later: no idle agent, concurrency limit, or the loop is down.
    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let msg = err.to_string();
        match err {
            OrchestratorError::NotFound { .. } => ApiError::NotFound(msg),
            OrchestratorError::InvalidTransition { .. } | OrchestratorError::NotRunnable { .. } => {
                ApiError::Conflict(msg)
            }
            OrchestratorError::Validation(_) | OrchestratorError::QueryRejected(_) => {
                ApiError::Unprocessable(msg)
            }
            OrchestratorError::NoAgentAvailable { .. } | OrchestratorError::AtCapacity { .. } => {
                ApiError::Unavailable(msg)
            }
            OrchestratorError::Storage(_) => ApiError::InternalError(msg),
        }
    }
}

impl From<LoopError> for ApiError {
    fn from(err: LoopError) -> Self {
        match err {
            LoopError::Stopped => ApiError::Unavailable(err.to_string()),
            LoopError::Orchestrator(inner) => inner.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.to_string()
        }));
        (status, body).into_response()
    }
}
