// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Warden Contributors

// Tunnel Warden - Tunnel Module
// Per-tunnel supervision: state machine, retry budget, health probing

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tunnel_warden_common::{Error, Result, TunnelSnapshot, TunnelSpec, TunnelStatus};

use crate::process::{forward_args, ForwardProcess, SpawnOptions};

/// Consecutive failed probes tolerated before automatic recovery is
/// abandoned
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Timeout for one TCP probe of the forwarded local port
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Delay before a restart scheduled by a failed probe
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);
/// Settle delay between killing the old process and starting anew
pub const RESTART_SETTLE: Duration = Duration::from_secs(1);

/// Mutable tunnel state, guarded by the tunnel's single lock
struct TunnelState {
    spec: TunnelSpec,
    status: TunnelStatus,
    /// Consecutive probe failures since the last success
    retry_count: u32,
    last_error: Option<String>,
    last_check: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    /// At most one live forwarding process at a time
    process: Option<ForwardProcess>,
    /// Scope tied to the current process; cancelled on stop/restart so
    /// pending restart tasks abandon the old process generation
    cancel: CancellationToken,
}

/// One supervised local-to-remote port forward, backed by one external
/// client process. All mutation goes through the operations below;
/// `start`, `stop`, `restart` and `check_connection` are serialized on
/// the internal lock, so a probe never races a shutdown on the same
/// tunnel.
pub struct Tunnel {
    name: String,
    max_retries: u32,
    options: SpawnOptions,
    state: Mutex<TunnelState>,
}

impl Tunnel {
    pub fn new(spec: TunnelSpec, options: SpawnOptions) -> Self {
        Self {
            name: spec.name.clone(),
            max_retries: DEFAULT_MAX_RETRIES,
            options,
            state: Mutex::new(TunnelState {
                spec,
                status: TunnelStatus::Disconnected,
                retry_count: 0,
                last_error: None,
                last_check: None,
                last_success: None,
                process: None,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawn the forwarding process. Idempotent while a connection is
    /// already up or in progress. The status stays `Connecting` until
    /// a health probe confirms the forward is actually usable.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if matches!(
            state.status,
            TunnelStatus::Connected | TunnelStatus::Connecting
        ) {
            return Ok(());
        }

        state.status = TunnelStatus::Connecting;
        state.last_error = None;

        // A stop leaves the previous scope cancelled; this process
        // gets its own
        if state.cancel.is_cancelled() {
            state.cancel = CancellationToken::new();
        }

        let args = forward_args(&state.spec);
        match ForwardProcess::spawn(&self.options, &args) {
            Ok(process) => {
                state.process = Some(process);
                info!(
                    "Tunnel '{}' forwarding process started: {}",
                    self.name,
                    state.spec.connection_string()
                );
                Ok(())
            }
            Err(e) => {
                state.status = TunnelStatus::Error;
                state.last_error = Some(e.to_string());
                error!("Tunnel '{}' failed to start: {}", self.name, e);
                Err(e)
            }
        }
    }

    /// Stop the tunnel and release its local port. Blocks for up to
    /// the grace and drain periods while the process is torn down.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.status == TunnelStatus::Disconnected {
            return Ok(());
        }

        state.cancel.cancel();

        if let Some(process) = state.process.take() {
            process.terminate().await;
        }

        state.status = TunnelStatus::Disconnected;
        state.last_error = None;
        info!("Tunnel '{}' stopped", self.name);
        Ok(())
    }

    /// Kill any existing process and start over with a fresh
    /// cancellation scope. Rejected once the retry budget is spent;
    /// only an operator-initiated start or a config reload recovers a
    /// tunnel past that point.
    pub async fn restart(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;

            if state.retry_count >= self.max_retries {
                warn!(
                    "Tunnel '{}' not restarted, retry limit ({}) exceeded",
                    self.name, self.max_retries
                );
                return Err(Error::RetryLimitExceeded(self.max_retries));
            }

            if let Some(process) = state.process.take() {
                process.kill().await;
            }

            // The old scope may already be cancelled
            state.cancel = CancellationToken::new();
            state.status = TunnelStatus::Disconnected;
        }

        tokio::time::sleep(RESTART_SETTLE).await;
        self.start().await
    }

    /// Probe the forwarded local port. Invoked periodically by the
    /// supervisor, never by the tunnel itself.
    ///
    /// A tunnel that is in `Error` with its retry budget spent is
    /// considered permanently failed and is left alone. Otherwise a
    /// successful probe promotes `Connecting`/`Error` to `Connected`
    /// and resets the budget; a failed probe on a live tunnel spends
    /// one retry and, if budget remains, schedules one restart after a
    /// backoff delay.
    pub async fn check_connection(self: Arc<Self>) {
        let mut state = self.state.lock().await;

        state.last_check = Some(Utc::now());

        if state.status == TunnelStatus::Error && state.retry_count >= self.max_retries {
            return;
        }

        let addr = format!("127.0.0.1:{}", state.spec.local_port);
        let probe = tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await;

        let failure = match probe {
            Ok(Ok(_stream)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("probe timed out after {:?}", PROBE_TIMEOUT)),
        };

        match failure {
            None => match state.status {
                TunnelStatus::Connecting => {
                    state.status = TunnelStatus::Connected;
                    state.last_error = None;
                    state.retry_count = 0;
                    state.last_success = Some(Utc::now());
                    info!("Tunnel '{}' connected", self.name);
                }
                TunnelStatus::Error => {
                    state.status = TunnelStatus::Connected;
                    state.last_error = None;
                    state.retry_count = 0;
                    state.last_success = Some(Utc::now());
                    info!("Tunnel '{}' recovered", self.name);
                }
                TunnelStatus::Connected => {
                    state.retry_count = 0;
                    state.last_success = Some(Utc::now());
                }
                TunnelStatus::Disconnected => {}
            },
            Some(reason) => {
                if !matches!(
                    state.status,
                    TunnelStatus::Connected | TunnelStatus::Connecting
                ) {
                    return;
                }

                state.retry_count += 1;
                state.status = TunnelStatus::Error;

                if state.retry_count >= self.max_retries {
                    state.last_error = Some(format!(
                        "Retry limit ({}) exceeded: {}",
                        self.max_retries, reason
                    ));
                    warn!(
                        "Tunnel '{}' giving up after {} failed probes",
                        self.name, self.max_retries
                    );
                } else {
                    state.last_error = Some(format!(
                        "Local port {} probe failed: {} (retry {}/{})",
                        state.spec.local_port, reason, state.retry_count, self.max_retries
                    ));
                    warn!(
                        "Tunnel '{}' probe failed, restarting in {:?} ({}/{})",
                        self.name, RESTART_BACKOFF, state.retry_count, self.max_retries
                    );

                    // Fire-and-forget so the probe returns promptly and
                    // does not hold the lock across process teardown
                    let tunnel = Arc::clone(&self);
                    let cancel = state.cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
                        }
                        if let Err(e) = tunnel.restart().await {
                            warn!("Tunnel '{}' automatic restart failed: {}", tunnel.name, e);
                        }
                    });
                }
            }
        }
    }

    /// Replace the spec. A connected tunnel is restarted to pick up
    /// the new parameters; in any other state they simply take effect
    /// on the next start.
    pub async fn update_spec(self: Arc<Self>, new_spec: TunnelSpec) {
        let mut state = self.state.lock().await;

        if state.spec == new_spec {
            return;
        }

        info!("Tunnel '{}' configuration changed", self.name);
        state.spec = new_spec;

        if state.status == TunnelStatus::Connected {
            let tunnel = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = tunnel.restart().await {
                    warn!("Tunnel '{}' restart after update failed: {}", tunnel.name, e);
                }
            });
        }
    }

    /// Administrative override for specs that fail pre-flight checks
    /// (unreadable key file, unusable credentials). Spends the whole
    /// retry budget so the health loop does not try to resurrect a
    /// tunnel whose configuration is known broken.
    pub async fn set_error_status(&self, message: &str) {
        let mut state = self.state.lock().await;

        state.status = TunnelStatus::Error;
        state.last_error = Some(message.to_string());
        state.retry_count = self.max_retries;
        warn!("Tunnel '{}' marked as failed: {}", self.name, message);
    }

    /// True when the tunnel is in `Error` with its retry budget spent
    pub async fn is_permanently_failed(&self) -> bool {
        let state = self.state.lock().await;
        state.status == TunnelStatus::Error && state.retry_count >= self.max_retries
    }

    pub async fn status(&self) -> TunnelStatus {
        self.state.lock().await.status
    }

    pub async fn is_healthy(&self) -> bool {
        self.state.lock().await.status == TunnelStatus::Connected
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    pub async fn last_check(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_check
    }

    pub async fn spec(&self) -> TunnelSpec {
        self.state.lock().await.spec.clone()
    }

    pub async fn connection_string(&self) -> String {
        self.state.lock().await.spec.connection_string()
    }

    pub async fn snapshot(&self) -> TunnelSnapshot {
        let state = self.state.lock().await;
        TunnelSnapshot {
            name: self.name.clone(),
            status: state.status,
            spec: state.spec.clone(),
            last_error: state.last_error.clone(),
            last_check: state.last_check,
            connection: state.spec.connection_string(),
        }
    }
}
