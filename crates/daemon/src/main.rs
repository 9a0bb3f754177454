// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Warden Contributors

// Tunnel Warden - Daemon
// Headless host for the tunnel supervision engine

mod pidfile;
mod process;
mod supervisor;
mod tunnel;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use process::SpawnOptions;
use supervisor::Supervisor;
use tunnel_warden_common::default_config_path;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "tunnel_warden_daemon=debug,tunnel_warden_common=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Tunnel Warden daemon starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Prevent multiple instances
    let _pid_guard = pidfile::PidFileGuard::create()
        .context("Failed to create PID file - another daemon may already be running")?;

    let config_path = match std::env::args().nth(1) {
        Some(arg) => PathBuf::from(arg),
        None => default_config_path().context("Failed to determine configuration path")?,
    };
    info!("Using configuration file {}", config_path.display());

    let supervisor = Arc::new(Supervisor::new(config_path, SpawnOptions::default()));

    supervisor
        .load_config()
        .await
        .context("Failed to load initial configuration")?;

    info!(
        "{}/{} tunnels connected",
        supervisor.healthy_count().await,
        supervisor.total_count().await
    );

    supervisor.start_monitoring();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown signal received, stopping all tunnels...");
    supervisor.stop_all().await;
    info!("Shutdown complete");

    Ok(())
}
