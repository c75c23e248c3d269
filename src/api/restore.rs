//! Restore endpoints.

use axum::extract::State;
use axum::Json;

use super::error::ApiError;
use super::AppState;
use crate::restore::{RestoreDescriptor, RestoreRequest, RestoreStatus};

/// POST /restore/start - Resolve, verify and apply a restore chain
pub async fn start_restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreDescriptor>, ApiError> {
    let descriptor = state.restore.start(req).await?;
    Ok(Json(descriptor))
}

/// GET /restore/status
pub async fn restore_status(State(state): State<AppState>) -> Json<RestoreStatus> {
    Json(state.restore.status())
}
