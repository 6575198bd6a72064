//! gpufleet daemon
//!
//! Control plane process: loads configuration, wires the store, engine
//! connections, telemetry and scheduler together, runs reconciliation and
//! serves the API.

use anyhow::Context;
use clap::Parser;
use gpufleet_api::create_router;
use gpufleet_core::DaemonConfig;
use gpufleet_runtime::{ConnectionManager, ContainerDriver, EngineConnector};
use gpufleet_scheduler::{ReconciliationLoop, WorkloadService};
use gpufleet_store::{FleetStore, MemoryStore};
use gpufleet_telemetry::TelemetryCollector;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// gpufleetd - GPU fleet scheduler and container orchestrator
#[derive(Parser, Debug)]
#[command(name = "gpufleetd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the REST API server
    #[arg(long)]
    port: Option<u16>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Seed file with nodes, specs, images and workloads
    #[arg(long)]
    seed: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(address) = &args.address {
        config.api.address = address.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if let Some(seed) = &args.seed {
        config.store.seed_file = Some(seed.clone());
    }
    Ok(config)
}

async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("Starting gpufleet daemon v{}", env!("CARGO_PKG_VERSION"));

    let store: Arc<dyn FleetStore> = match &config.store.seed_file {
        Some(path) => {
            info!(seed = %path.display(), "Loading seed records");
            Arc::new(MemoryStore::from_seed(path).await?)
        }
        None => Arc::new(MemoryStore::new()),
    };

    let connector: Arc<dyn EngineConnector> =
        Arc::new(ConnectionManager::new(config.engine.clone()));
    let driver = Arc::new(ContainerDriver::new(connector.clone(), config.engine.clone()));
    let telemetry = Arc::new(TelemetryCollector::new(
        connector.clone(),
        &config.telemetry,
        config.engine.probe_timeout(),
    ));
    let service = Arc::new(WorkloadService::new(store, connector, driver, telemetry));

    let cancel = CancellationToken::new();
    let reconcile = if config.reconcile.enabled {
        let reconcile = Arc::new(ReconciliationLoop::new(
            service.clone(),
            config.reconcile.clone(),
        ));
        Some(tokio::spawn(reconcile.run(cancel.clone())))
    } else {
        info!("Reconciliation disabled");
        None
    };

    let router = create_router(service, config.api.cors_enabled);
    let addr: SocketAddr = format!("{}:{}", config.api.address, config.api.port)
        .parse()
        .context("invalid API address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("API server listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("API server failed")?;

    cancel.cancel();
    if let Some(handle) = reconcile {
        if let Err(e) = handle.await {
            warn!(error = %e, "Reconciliation task ended abnormally");
        }
    }
    info!("gpufleet daemon stopped");
    Ok(())
}
