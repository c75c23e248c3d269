//! Snapsend backup agent - Main entry point

use anyhow::Result;
use clap::Parser;
use snapsend::{
    api, config::Config, daemon::shutdown, remote::ssh::SshChannel,
    restore::{BtrfsReceive, RestoreEngine}, run::RunController, snapshot::BtrfsSnapshots,
    store::LineageStore, utils,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = if let Some(config_path) = args.config {
        Config::from_file(&config_path)?
    } else {
        Config::default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;
    api::health::init_start_time();

    tracing::info!(
        "Starting snapsend v{} (client_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.client_id
    );

    std::fs::create_dir_all(&config.agent.data_dir)?;
    let store = Arc::new(LineageStore::open(&config.store_path())?);

    // Runs left non-terminal by a crash can never complete
    let repaired = store.repair_interrupted_runs().await?;
    if repaired > 0 {
        tracing::warn!(repaired, "Marked interrupted runs as failed");
    }

    let config = Arc::new(config);
    let remote = Arc::new(SshChannel::from_config(&config.remote));
    let source = Arc::new(BtrfsSnapshots::new(config.backup.snapshot_dir.clone()));

    let controller = RunController::new(
        Arc::clone(&config),
        Arc::clone(&store),
        remote.clone(),
        source,
    );
    let restore = RestoreEngine::new(
        Arc::clone(&config),
        Arc::clone(&store),
        remote,
        Arc::new(BtrfsReceive),
    );

    let state = api::AppState {
        config: Arc::clone(&config),
        store,
        controller: Arc::clone(&controller),
        restore,
    };
    let app = api::router(state);

    let port = args.port.unwrap_or(config.agent.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app);
    let server_handle = tokio::spawn(async move { server.await });

    shutdown::wait_for_signal().await;
    shutdown::drain_active_run(&controller, std::time::Duration::from_secs(30)).await;

    server_handle.abort();
    match server_handle.await {
        Ok(Ok(())) => tracing::info!("Server shutdown complete"),
        Ok(Err(e)) => tracing::error!("Server error during shutdown: {}", e),
        Err(e) if e.is_cancelled() => tracing::info!("Server stopped"),
        Err(e) => tracing::error!("Server task panicked: {}", e),
    }

    Ok(())
}
