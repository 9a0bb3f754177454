// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Warden Contributors

// Tunnel Warden - Common Library
// Shared types, configuration structures, and error handling

pub mod config;
pub mod error;
pub mod types;

pub use config::{default_config_path, Config, TunnelSpec};
pub use error::{Error, Result};
pub use types::{TunnelSnapshot, TunnelStatus};

// Re-export commonly used external types
pub use chrono::{DateTime, Utc};
