//! Graceful shutdown for the agent process.
//!
//! On SIGTERM/SIGINT the active backup run, if any, is asked to cancel
//! cooperatively so remote `.part` state is cleaned before the process
//! exits. The wait is bounded: a wedged stream must not stall exit.

use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};

use crate::run::RunController;

/// Block until SIGTERM or SIGINT arrives.
pub async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Cancel the active backup run and wait for its cleanup to finish.
/// Returns immediately when no run is active.
pub async fn drain_active_run(controller: &RunController, timeout: Duration) {
    if !controller.cancel().await {
        return;
    }
    info!("Waiting for the active run to cancel");
    if tokio::time::timeout(timeout, controller.wait_idle())
        .await
        .is_err()
    {
        warn!(
            timeout_secs = timeout.as_secs(),
            "Active run did not cancel in time; exiting anyway"
        );
    }
}
