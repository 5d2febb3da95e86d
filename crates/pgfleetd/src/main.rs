//! pgfleetd: the pgfleet daemon.
//!
//! Single binary that assembles the control plane:
//! - State store (redb)
//! - Allocation planner
//! - Provisioning orchestrator + worker
//! - Health monitor
//! - Migration coordinator + worker
//! - REST API
//!
//! # Usage
//!
//! ```text
//! pgfleetd --config /etc/pgfleet/pgfleet.toml --data-dir /var/lib/pgfleet --port 7070
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pgfleet_core::FleetConfig;
use pgfleet_state::StateStore;
use pgfleetd::{Fleet, remote};

const DEFAULT_FILTER: &str = "info,pgfleetd=debug,pgfleet=debug";

#[derive(Parser)]
#[command(name = "pgfleetd", about = "PostgreSQL fleet control plane")]
struct Cli {
    /// Path to pgfleet.toml. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long, default_value = "/var/lib/pgfleet")]
    data_dir: PathBuf,

    /// Port to listen on.
    #[arg(long, default_value = "7070")]
    port: u16,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = match &cli.config {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => FleetConfig::default(),
    };

    run(config, cli.data_dir, cli.port).await
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run(config: FleetConfig, data_dir: PathBuf, port: u16) -> anyhow::Result<()> {
    info!("pgfleet daemon starting");

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("pgfleet.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let collaborators = remote::connect(&config.collaborators)?;
    info!(
        executor = %config.collaborators.executor_url,
        volumes = %config.collaborators.volumes_url,
        workload = %config.collaborators.workload_url,
        mover = %config.collaborators.mover_url,
        entitlements = %config.collaborators.entitlements_url,
        "collaborator clients configured"
    );

    let fleet = Fleet::assemble(store, &config, collaborators);
    info!("control plane assembled");

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = fleet.spawn_background(&shutdown_rx);

    // ── API server ─────────────────────────────────────────────

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, fleet.router())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    for handle in handles {
        let _ = handle.await;
    }

    info!("pgfleet daemon stopped");
    Ok(())
}
