// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Warden Contributors

// Tunnel Warden - Supervisor Module
// Owns the tunnel registry, drives reloads and the health-check loop

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_warden_common::{Config, Result, TunnelSnapshot};

use crate::process::SpawnOptions;
use crate::tunnel::Tunnel;

/// Delay between starting a new tunnel generation and the first
/// health sweep, so a reload reports fresh status without waiting a
/// full polling interval
const STARTUP_SETTLE: Duration = Duration::from_secs(1);

/// The registry is replaced wholesale on reload: the name order
/// mirrors the configuration file, and every name in it has a live
/// entry in the map. Both are swapped together under the write lock,
/// so readers never observe tunnels from two configuration
/// generations.
#[derive(Default)]
struct Registry {
    tunnels: HashMap<String, Arc<Tunnel>>,
    order: Vec<String>,
    config: Config,
}

/// Supervises the whole tunnel fleet
pub struct Supervisor {
    config_path: PathBuf,
    options: SpawnOptions,
    registry: RwLock<Registry>,
    /// Cancelling this stops the monitoring loop; it does not stop
    /// individual tunnels (stop_all does both)
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(config_path: PathBuf, options: SpawnOptions) -> Self {
        Self {
            config_path,
            options,
            registry: RwLock::new(Registry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load (or reload) the configuration and replace the whole tunnel
    /// fleet with it.
    ///
    /// Specs that fail validation are logged and skipped; the rest of
    /// the reload proceeds. Specs that pass validation but fail the
    /// credential pre-flight become tunnels that are marked failed
    /// instead of started, so their error is visible in status output.
    pub async fn load_config(&self) -> Result<()> {
        let config = Config::load(&self.config_path)?;

        let mut tunnels: HashMap<String, Arc<Tunnel>> = HashMap::new();
        let mut order: Vec<String> = Vec::new();

        for spec in config.enabled_tunnels() {
            if let Err(e) = spec.validate() {
                warn!("Skipping tunnel '{}': {}", spec.name, e);
                continue;
            }
            if tunnels.contains_key(&spec.name) {
                warn!("Skipping tunnel '{}': duplicate name", spec.name);
                continue;
            }

            let tunnel = Arc::new(Tunnel::new(spec.clone(), self.options.clone()));

            if let Err(e) = spec.check_credentials() {
                tunnel.set_error_status(&e.to_string()).await;
            }

            order.push(spec.name.clone());
            tunnels.insert(spec.name.clone(), tunnel);
        }

        let loaded = order.len();

        // Swap generations atomically, then tear the old one down
        // outside the lock
        let old = {
            let mut registry = self.registry.write().await;
            std::mem::replace(
                &mut *registry,
                Registry {
                    tunnels,
                    order,
                    config,
                },
            )
        };

        if !old.tunnels.is_empty() {
            let mut stops = JoinSet::new();
            for (name, tunnel) in old.tunnels {
                stops.spawn(async move {
                    if let Err(e) = tunnel.stop().await {
                        warn!("Failed to stop tunnel '{}' during reload: {}", name, e);
                    }
                });
            }
            while stops.join_next().await.is_some() {}
        }

        // Start the new generation asynchronously
        for tunnel in self.ordered_tunnels().await {
            if tunnel.is_permanently_failed().await {
                continue;
            }
            tokio::spawn(async move {
                if let Err(e) = tunnel.start().await {
                    warn!("Failed to start tunnel '{}': {}", tunnel.name(), e);
                }
            });
        }

        info!("Configuration loaded: {} tunnels active", loaded);

        // One immediate sweep so status is fresh right after a reload
        tokio::time::sleep(STARTUP_SETTLE).await;
        self.check_all().await;

        Ok(())
    }

    /// Stop every tunnel concurrently, wait for all of them, then stop
    /// the monitoring loop. Individual stop failures are logged, never
    /// propagated.
    pub async fn stop_all(&self) {
        let tunnels = self.ordered_tunnels().await;

        info!("Stopping {} tunnels", tunnels.len());

        let mut stops = JoinSet::new();
        for tunnel in tunnels {
            stops.spawn(async move {
                if let Err(e) = tunnel.stop().await {
                    warn!("Failed to stop tunnel '{}': {}", tunnel.name(), e);
                }
            });
        }
        while stops.join_next().await.is_some() {}

        self.shutdown.cancel();
    }

    /// Run the periodic health-check loop until the supervisor is shut
    /// down. The interval is re-read from the current configuration on
    /// every tick, so a reload takes effect without restarting the
    /// loop; a tunnel failure never terminates it.
    pub fn start_monitoring(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);

        tokio::spawn(async move {
            info!("Monitoring loop started");
            loop {
                let interval = {
                    let registry = supervisor.registry.read().await;
                    registry.config.check_interval()
                };

                tokio::select! {
                    _ = supervisor.shutdown.cancelled() => {
                        info!("Monitoring loop stopped");
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }

                supervisor.check_all().await;
            }
        });
    }

    /// Probe every registered tunnel, one concurrent probe per tunnel
    pub async fn check_all(&self) {
        let tunnels = self.ordered_tunnels().await;

        let mut probes = JoinSet::new();
        for tunnel in tunnels {
            probes.spawn(tunnel.check_connection());
        }
        while probes.join_next().await.is_some() {}

        debug!(
            "Health sweep complete: {}/{} connected",
            self.healthy_count().await,
            self.total_count().await
        );
    }

    /// Ordered snapshot of all tunnels, in configuration-file order
    pub async fn tunnel_statuses(&self) -> Vec<TunnelSnapshot> {
        let registry = self.registry.read().await;

        let mut statuses = Vec::with_capacity(registry.order.len());
        for name in &registry.order {
            if let Some(tunnel) = registry.tunnels.get(name) {
                statuses.push(tunnel.snapshot().await);
            }
        }
        statuses
    }

    pub async fn healthy_count(&self) -> usize {
        let tunnels = self.ordered_tunnels().await;

        let mut count = 0;
        for tunnel in tunnels {
            if tunnel.is_healthy().await {
                count += 1;
            }
        }
        count
    }

    pub async fn total_count(&self) -> usize {
        self.registry.read().await.tunnels.len()
    }

    async fn ordered_tunnels(&self) -> Vec<Arc<Tunnel>> {
        let registry = self.registry.read().await;
        registry
            .order
            .iter()
            .filter_map(|name| registry.tunnels.get(name).cloned())
            .collect()
    }
}
