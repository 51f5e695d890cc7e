//! Stratus Node Agent
//!
//! Runs on each hypervisor host and keeps the node's QEMU virtual machines
//! and their networks in line with the instance records.
//!
//! ## Architecture
//!
//! - **Reconciler**: periodically discovers VM units and commits their state
//! - **VM Manager**: lifecycle operations over systemd, QMP and qemu-img
//! - **Network Engine**: per-VM namespaces, bridges and NAT

use std::sync::Arc;

use anyhow::{Context, Result};
use stratus_node_agent::cloudinit::NoCloudWriter;
use stratus_node_agent::command::{CommandRunner, SystemRunner};
use stratus_node_agent::image::QemuImgStore;
use stratus_node_agent::paths::Paths;
use stratus_node_agent::qemu::QmpMonitor;
use stratus_node_agent::systemd::SystemdSupervisor;
use stratus_node_agent::{
    Collaborators, Config, Reconciler, ReconcilerConfig, SqliteRecordStore, StateCache, VmManager,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting stratus node agent");

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!(
        node_id = %config.node_id,
        lib_dir = %config.lib_dir.display(),
        network_mode = ?config.network_mode,
        "Configuration loaded"
    );

    let paths = Paths::from_config(&config);
    std::fs::create_dir_all(paths.lib_dir())
        .with_context(|| format!("failed to create {}", paths.lib_dir().display()))?;

    let records = Arc::new(
        SqliteRecordStore::open(paths.state_db()).context("failed to open record store")?,
    );
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);

    let parts = Collaborators {
        runner: Arc::clone(&runner),
        supervisor: Arc::new(SystemdSupervisor::new(Arc::clone(&runner))),
        guest: Arc::new(QmpMonitor::new(paths.clone())),
        records,
        images: Arc::new(QemuImgStore::new(Arc::clone(&runner), paths.clone())),
        cloud_init: Arc::new(NoCloudWriter::new(paths.clone())),
    };

    let manager = Arc::new(VmManager::new(
        Arc::clone(&config),
        Arc::new(StateCache::new()),
        parts,
    ));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        Arc::clone(&manager),
        ReconcilerConfig {
            interval: config.reconcile_interval,
        },
    );
    let reconciler_handle = tokio::spawn(async move {
        reconciler.run(shutdown_rx).await;
    });

    info!("Node agent running, press Ctrl+C to stop");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(true);

    if let Err(e) = reconciler_handle.await {
        error!(error = %e, "Reconciler task failed");
    }

    info!("Node agent stopped");
    Ok(())
}
