// Common types for Tunnel Warden

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::TunnelSpec;

/// Status of a supervised tunnel
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Disconnected, // no forwarding process owned
    Connecting,   // process spawned, forward not yet confirmed by a probe
    Connected,    // local port probe succeeded
    Error,        // spawn failure or probe failure (may be permanent at the retry limit)
}

impl TunnelStatus {
    /// Check if the status represents a confirmed, usable forward
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelStatus::Connected)
    }

    /// Check if the status represents a transitional state
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TunnelStatus::Connecting)
    }
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelStatus::Disconnected => "disconnected",
            TunnelStatus::Connecting => "connecting",
            TunnelStatus::Connected => "connected",
            TunnelStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Point-in-time view of one tunnel, as reported by the supervisor.
/// Read-only aggregation for presentation layers; taking one never
/// mutates the tunnel it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSnapshot {
    pub name: String,
    pub status: TunnelStatus,
    pub spec: TunnelSpec,
    pub last_error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
    /// Human-readable forward description, e.g.
    /// `127.0.0.1:8080 -> db.internal:5432 (via ops@bastion:22)`
    pub connection: String,
}
