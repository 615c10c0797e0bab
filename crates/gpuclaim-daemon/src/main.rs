//! gpuclaim daemon
//!
//! Hosts the scheduling core behind the REST API, backed by the in-memory
//! store.

use anyhow::Context;
use clap::Parser;
use gpuclaim_api::create_router;
use gpuclaim_core::GpuclaimConfig;
use gpuclaim_scheduler::{CycleCoordinator, Scheduler};
use gpuclaim_store::{load_snapshot, MemoryStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// gpuclaim daemon - topology-aware GPU placement with device leases
#[derive(Parser, Debug)]
#[command(name = "gpuclaimd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a TOML configuration file
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

    /// Directory of claim and node report JSON files to load at startup
    #[arg(long)]
    snapshot_dir: Option<PathBuf>,
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn init_logging(level: &str, format: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_level(level).to_string().to_lowercase()));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false);

    let result = if format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    result.context("Failed to set subscriber")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GpuclaimConfig::from_file(path)?,
        None => GpuclaimConfig::default(),
    };
    if let Some(address) = args.address {
        config.api.rest_address = address;
    }
    if let Some(port) = args.port {
        config.api.rest_port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(dir) = args.snapshot_dir {
        config.storage.snapshot_dir = Some(dir);
    }

    init_logging(&config.logging.level, &config.logging.format)?;

    info!("Starting gpuclaim daemon v{}", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(MemoryStore::new());
    if let Some(dir) = &config.storage.snapshot_dir {
        load_snapshot(dir, &store).await?;
    }

    let coordinator = CycleCoordinator::new(
        &config,
        store.clone(),
        store.clone(),
        store.clone(),
        store.clone(),
    );
    let scheduler = Arc::new(Scheduler::new(Arc::new(coordinator)));

    let router = create_router(scheduler, store);

    let addr: SocketAddr = format!("{}:{}", config.api.rest_address, config.api.rest_port)
        .parse()
        .context("Invalid address")?;

    info!("API server listening on {}", addr);
    info!(
        namespace = %config.scheduler.lease_namespace,
        timeout_ms = config.scheduler.call_timeout_ms,
        "Lease store ready"
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind")?;
    axum::serve(listener, router).await.context("Server error")?;
    Ok(())
}
