//! Backup run endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use super::error::ApiError;
use super::AppState;
use crate::run::{RunStatus, StartRequest};
use crate::store::{ArchiveKind, RunOutcome, RunRecord};
use crate::utils::errors::AgentError;

#[derive(Debug, Deserialize)]
pub struct StartBackupRequest {
    /// "full" or "incremental"
    pub mode: Option<String>,
    #[serde(default)]
    pub force_full: bool,
    pub subvolumes: Option<Vec<String>>,
}

/// POST /backup/start - Start a backup run
pub async fn start_backup(
    State(state): State<AppState>,
    Json(req): Json<StartBackupRequest>,
) -> Result<Json<RunRecord>, ApiError> {
    let mode = match req.mode.as_deref() {
        None => None,
        Some(text) => Some(ArchiveKind::parse(text).ok_or_else(|| {
            AgentError::Precondition(format!("unknown backup mode '{}'", text))
        })?),
    };

    let run = state
        .controller
        .start(StartRequest {
            mode,
            force_full: req.force_full,
            subvolumes: req.subvolumes,
        })
        .await?;
    Ok(Json(run))
}

/// POST /backup/cancel - Cancel the active run (no-op when idle)
pub async fn cancel_backup(State(state): State<AppState>) -> Json<serde_json::Value> {
    let cancelled = state.controller.cancel().await;
    Json(serde_json::json!({ "cancelled": cancelled }))
}

/// GET /backup/status - Current run descriptor plus latest progress sample
pub async fn backup_status(State(state): State<AppState>) -> Result<Json<RunStatus>, ApiError> {
    Ok(Json(state.controller.status().await?))
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Filter by outcome (success, partial, failed, cancelled, ...)
    pub outcome: Option<String>,
}

/// GET /runs - Run history, newest first
pub async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let outcome = match query.outcome.as_deref() {
        None => None,
        Some(text) => Some(RunOutcome::parse(text).ok_or_else(|| {
            AgentError::Precondition(format!("unknown run outcome '{}'", text))
        })?),
    };
    let runs = state
        .store
        .list_runs(query.limit.unwrap_or(50).min(500), query.offset.unwrap_or(0), outcome)
        .await?;
    Ok(Json(runs))
}
