//! Update Agent - Main entry point
//!
//! Long-running daemon that keeps the device's services current with the
//! published update repository.

use anyhow::{Context, Result};
use clap::Parser;
use semver::Version;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use update_agent::daemon::shutdown::shutdown_signal;
use update_agent::engine::{CycleOutcome, UpdateEngine};
use update_agent::executor::compose::DockerCompose;
use update_agent::report::StatusReporter;
use update_agent::repository::HttpManifestRepository;
use update_agent::version_store::VersionStore;
use update_agent::{api, utils, Config};

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

    /// Run a single update cycle and exit instead of daemonizing
    #[arg(long)]
    once: bool,

    /// Write the version record on first install if none exists yet
    #[arg(long, value_name = "X.Y.Z")]
    seed_version: Option<Version>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    // Initialize start time for uptime tracking
    api::health::init_start_time();

    tracing::info!(
        "Starting update-agent v{} (device: {})",
        env!("CARGO_PKG_VERSION"),
        config.agent.device_id
    );

    let store = VersionStore::new(&config.agent.state_dir);
    if let Some(seed) = &args.seed_version {
        if store.seed(seed)? {
            tracing::info!(version = %seed, "Seeded version record");
        }
    }
    // Refuse to start without readable ground truth
    let installed = store
        .current()
        .context("version record unreadable; on a fresh install run with --seed-version")?;
    tracing::info!(version = %installed, "Installed system version");

    let repo = Arc::new(HttpManifestRepository::new(&config.source)?);
    let compose = Arc::new(DockerCompose::new(config.engine.compose_file.clone()));
    let reporter = StatusReporter::new(
        &config.agent.state_dir,
        &config.agent.device_id,
        &config.telemetry,
    );

    let cancel = CancellationToken::new();
    let engine = Arc::new(UpdateEngine::new(
        &config,
        store,
        repo,
        compose,
        reporter,
        cancel.clone(),
    ));

    if args.once {
        return match engine.run_cycle().await? {
            CycleOutcome::Aborted { failed_at, error } => {
                Err(anyhow::anyhow!("update to {failed_at} failed: {error}"))
            }
            outcome => {
                tracing::info!(?outcome, "Cycle complete");
                Ok(())
            }
        };
    }

    // Background check loop
    let engine_handle = tokio::spawn(engine.clone().run_loop());

    // HTTP API
    let app = api::create_router(api::AppState {
        engine: engine.clone(),
    });
    let port = args.port.unwrap_or(config.agent.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);
    tracing::info!("Manual check: POST http://{}/updates/check", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    // Server is down; stop the engine at its next boundary and drain it.
    cancel.cancel();
    match tokio::time::timeout(std::time::Duration::from_secs(30), engine_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Engine stopped"),
        Ok(Ok(Err(e))) => {
            return Err(anyhow::Error::new(e)).context("engine stopped with a fatal error")
        }
        Ok(Err(e)) => tracing::error!("Engine task panicked: {}", e),
        Err(_) => tracing::warn!("Engine shutdown timeout, forcing exit"),
    }

    tracing::info!("update-agent stopped");
    Ok(())
}
