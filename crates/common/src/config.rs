// Configuration structures for Tunnel Warden

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};

/// One local-to-remote port forward, as configured.
/// Immutable connection parameters for one tunnel lifecycle instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Unique tunnel name among active tunnels
    pub name: String,
    /// Local port to bind the forward to
    pub local_port: u16,
    /// Remote host the forward targets (as seen from the SSH server)
    pub remote_host: String,
    /// Remote port the forward targets
    pub remote_port: u16,
    /// SSH server hostname or IP
    pub ssh_host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// SSH username
    pub ssh_user: String,
    /// Path to SSH private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    /// SSH password. Accepted by validation, but the external client
    /// invocation cannot consume it; see `check_credentials`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_password: Option<String>,
    /// Disabled specs never become tunnels
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Complete supervisor configuration: an ordered list of tunnel specs
/// plus the health-check interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnels: Vec<TunnelSpec>,
    /// Health-check interval in seconds (non-positive values fall back
    /// to the default of 30)
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_enabled() -> bool {
    true
}

fn default_check_interval() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tunnels: Vec::new(),
            check_interval: default_check_interval(),
        }
    }
}

impl TunnelSpec {
    /// Validate the spec. A spec that passes is never silently
    /// corrected afterwards; an invalid spec never becomes a tunnel.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Config("Tunnel name cannot be empty".to_string()));
        }
        if self.local_port == 0 {
            return Err(Error::Config(format!(
                "Tunnel '{}': local port must be greater than 0",
                self.name
            )));
        }
        if self.remote_host.is_empty() {
            return Err(Error::Config(format!(
                "Tunnel '{}': remote host cannot be empty",
                self.name
            )));
        }
        if self.remote_port == 0 {
            return Err(Error::Config(format!(
                "Tunnel '{}': remote port must be greater than 0",
                self.name
            )));
        }
        if self.ssh_host.is_empty() {
            return Err(Error::Config(format!(
                "Tunnel '{}': SSH host cannot be empty",
                self.name
            )));
        }
        if self.ssh_port == 0 {
            return Err(Error::Config(format!(
                "Tunnel '{}': SSH port must be greater than 0",
                self.name
            )));
        }
        if self.ssh_user.is_empty() {
            return Err(Error::Config(format!(
                "Tunnel '{}': SSH user cannot be empty",
                self.name
            )));
        }
        if self.ssh_key_path.is_none() && self.ssh_password.is_none() {
            return Err(Error::Config(format!(
                "Tunnel '{}': either an SSH key path or a password is required",
                self.name
            )));
        }
        Ok(())
    }

    /// Pre-flight check of the configured credentials, run before a
    /// tunnel is first started. Separate from `validate` because a
    /// failure here marks the tunnel as permanently errored instead of
    /// dropping it from the registry.
    ///
    /// A password-only spec fails here: the external secure-shell
    /// client is driven non-interactively and has no way to consume a
    /// configured password.
    pub fn check_credentials(&self) -> Result<()> {
        let Some(key_path) = &self.ssh_key_path else {
            return Err(Error::Config(
                "Password authentication is not supported by the external \
                 SSH client invocation; configure ssh_key_path instead"
                    .to_string(),
            ));
        };

        let meta = fs::metadata(key_path).map_err(|e| {
            Error::Config(format!(
                "SSH key file {} is not accessible: {}",
                key_path.display(),
                e
            ))
        })?;

        if !meta.is_file() {
            return Err(Error::Config(format!(
                "SSH key path {} is not a regular file",
                key_path.display()
            )));
        }

        // OpenSSH itself refuses keys readable by group/other
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(Error::Config(format!(
                    "SSH key file {} permissions are too open (mode {:o}, expected 600)",
                    key_path.display(),
                    mode & 0o777
                )));
            }
        }

        Ok(())
    }

    /// Human-readable description of the forward
    pub fn connection_string(&self) -> String {
        format!(
            "127.0.0.1:{} -> {}:{} (via {}@{}:{})",
            self.local_port,
            self.remote_host,
            self.remote_port,
            self.ssh_user,
            self.ssh_host,
            self.ssh_port
        )
    }
}

impl Config {
    /// Load configuration from a file. A missing file bootstraps a
    /// default (empty) configuration on disk.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "No configuration found, writing defaults to {}",
                path.display()
            );
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&contents)?;

        if config.check_interval == 0 {
            config.check_interval = default_check_interval();
        }

        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Save configuration to a file, creating parent directories as needed
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Specs that should become tunnels, in file order
    pub fn enabled_tunnels(&self) -> impl Iterator<Item = &TunnelSpec> {
        self.tunnels.iter().filter(|t| t.enabled)
    }

    pub fn check_interval(&self) -> Duration {
        let secs = if self.check_interval == 0 {
            default_check_interval()
        } else {
            self.check_interval
        };
        Duration::from_secs(secs)
    }
}

/// Default configuration file location
pub fn default_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;
    Ok(config_dir.join("tunnel-warden").join("tunnels.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> TunnelSpec {
        TunnelSpec {
            name: name.to_string(),
            local_port: 8080,
            remote_host: "db.internal".to_string(),
            remote_port: 5432,
            ssh_host: "bastion".to_string(),
            ssh_port: 22,
            ssh_user: "ops".to_string(),
            ssh_key_path: Some(PathBuf::from("/k")),
            ssh_password: None,
            enabled: true,
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(spec("web").validate().is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        assert!(spec("").validate().is_err());
    }

    #[test]
    fn test_zero_ports_rejected() {
        let mut s = spec("web");
        s.local_port = 0;
        assert!(s.validate().is_err());

        let mut s = spec("web");
        s.remote_port = 0;
        assert!(s.validate().is_err());

        let mut s = spec("web");
        s.ssh_port = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_missing_fields_rejected() {
        let mut s = spec("web");
        s.remote_host = String::new();
        assert!(s.validate().is_err());

        let mut s = spec("web");
        s.ssh_host = String::new();
        assert!(s.validate().is_err());

        let mut s = spec("web");
        s.ssh_user = String::new();
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_credential_required() {
        let mut s = spec("web");
        s.ssh_key_path = None;
        s.ssh_password = None;
        assert!(s.validate().is_err());

        // A password alone satisfies validation
        s.ssh_password = Some("secret".to_string());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_password_only_fails_preflight() {
        let mut s = spec("web");
        s.ssh_key_path = None;
        s.ssh_password = Some("secret".to_string());
        let err = s.check_credentials().unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_missing_key_file_fails_preflight() {
        let mut s = spec("web");
        s.ssh_key_path = Some(PathBuf::from("/nonexistent/key/path"));
        assert!(s.check_credentials().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permission_check() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        fs::write(&key, "fake key material").unwrap();

        let mut s = spec("web");
        s.ssh_key_path = Some(key.clone());

        fs::set_permissions(&key, fs::Permissions::from_mode(0o644)).unwrap();
        assert!(s.check_credentials().is_err());

        fs::set_permissions(&key, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(s.check_credentials().is_ok());
    }

    #[test]
    fn test_connection_string_format() {
        assert_eq!(
            spec("web").connection_string(),
            "127.0.0.1:8080 -> db.internal:5432 (via ops@bastion:22)"
        );
    }

    #[test]
    fn test_enabled_filter_preserves_order() {
        let mut a = spec("a");
        let mut b = spec("b");
        b.enabled = false;
        let c = spec("c");
        a.enabled = true;

        let config = Config {
            tunnels: vec![a, b, c],
            check_interval: 30,
        };

        let names: Vec<&str> = config.enabled_tunnels().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_load_bootstraps_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.toml");

        let config = Config::load(&path).unwrap();
        assert!(config.tunnels.is_empty());
        assert_eq!(config.check_interval, 30);
        assert!(path.exists());
    }

    #[test]
    fn test_load_save_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.toml");

        let config = Config {
            tunnels: vec![spec("web"), spec("db")],
            check_interval: 15,
        };
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.tunnels, config.tunnels);
        assert_eq!(loaded.check_interval, 15);
    }

    #[test]
    fn test_zero_check_interval_coerced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnels.toml");
        fs::write(&path, "check_interval = 0\n").unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.check_interval, 30);
        assert_eq!(loaded.check_interval(), Duration::from_secs(30));
    }

    #[test]
    fn test_ssh_port_defaults_to_22() {
        let toml_src = r#"
            [[tunnels]]
            name = "web"
            local_port = 8080
            remote_host = "db.internal"
            remote_port = 5432
            ssh_host = "bastion"
            ssh_user = "ops"
            ssh_key_path = "/k"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.tunnels[0].ssh_port, 22);
        assert!(config.tunnels[0].enabled);
    }
}
