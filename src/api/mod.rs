//! HTTP control plane consumed by the external UI.

pub mod archives;
pub mod backup;
pub mod error;
pub mod health;
pub mod restore;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::config::Config;
use crate::restore::RestoreEngine;
use crate::run::RunController;
use crate::store::LineageStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<LineageStore>,
    pub controller: Arc<RunController>,
    pub restore: Arc<RestoreEngine>,
}

/// Create the API router with all endpoints
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        // Backup endpoints
        .route("/backup/start", post(backup::start_backup))
        .route("/backup/cancel", post(backup::cancel_backup))
        .route("/backup/status", get(backup::backup_status))
        .route("/runs", get(backup::list_runs))
        // Archive browsing
        .route("/archives", get(archives::browse_archives))
        // Restore endpoints
        .route("/restore/start", post(restore::start_restore))
        .route("/restore/status", get(restore::restore_status))
        .with_state(state)
}
