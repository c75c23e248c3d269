//! HTTP mapping for engine errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::utils::errors::AgentError;

pub struct ApiError(pub AgentError);

impl From<AgentError> for ApiError {
    fn from(e: AgentError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            AgentError::AlreadyRunning => (StatusCode::CONFLICT, "already_running"),
            AgentError::RemoteConflict(_) => (StatusCode::CONFLICT, "conflict"),
            AgentError::Precondition(_) | AgentError::Config(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "precondition")
            }
            AgentError::LineageViolation(_) | AgentError::MissingParent(_) => {
                (StatusCode::CONFLICT, "lineage")
            }
            AgentError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            _ => {
                tracing::error!("Internal error: {:#}", self.0);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        (status, Json(json!({ "error": self.0.to_string(), "kind": kind }))).into_response()
    }
}
