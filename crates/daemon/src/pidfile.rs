// Tunnel Warden - PID File Management
// Ensures only one daemon instance runs at a time

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// PID file guard - removes the PID file on drop
#[derive(Debug)]
pub struct PidFileGuard {
    path: PathBuf,
}

impl PidFileGuard {
    /// Claim the default PID file, failing if another daemon holds it
    pub fn create() -> Result<Self> {
        Self::create_at(Self::pid_file_path()?)
    }

    /// Claim a PID file at an explicit path. A stale file left behind
    /// by a dead process is removed and reclaimed.
    pub fn create_at(path: PathBuf) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read PID file {}", path.display()))?;

            if let Ok(pid) = contents.trim().parse::<u32>() {
                if is_process_running(pid) {
                    anyhow::bail!(
                        "Daemon is already running with PID {}. \
                         Stop it first or remove {} if it is stale.",
                        pid,
                        path.display()
                    );
                }
                warn!("Removing stale PID file for dead process {}", pid);
            } else {
                warn!("Removing unparseable PID file {}", path.display());
            }
            fs::remove_file(&path).context("Failed to remove stale PID file")?;
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create runtime directory")?;
        }

        let pid = std::process::id();
        fs::write(&path, pid.to_string()).context("Failed to write PID file")?;

        info!("Created PID file {} (pid {})", path.display(), pid);
        Ok(Self { path })
    }

    fn pid_file_path() -> Result<PathBuf> {
        let runtime_dir = dirs::runtime_dir()
            .or_else(dirs::cache_dir)
            .ok_or_else(|| anyhow::anyhow!("Could not determine runtime directory"))?;

        Ok(runtime_dir.join("tunnel-warden").join("daemon.pid"))
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove PID file {}: {}", self.path.display(), e);
        } else {
            debug!("Removed PID file {}", self.path.display());
        }
    }
}

/// Check whether a process with the given PID exists
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 performs the permission checks without delivering
    // anything
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM still means the process exists
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    // Without a liveness check, assume the recorded process is alive;
    // a genuinely stale file needs manual cleanup on this platform
    warn!("Process existence check not implemented for this platform");
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_instance_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        let guard = PidFileGuard::create_at(path.clone()).unwrap();

        let result = PidFileGuard::create_at(path.clone());
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("already running"));

        drop(guard);
        let _guard = PidFileGuard::create_at(path).expect("reclaim after drop");
    }

    #[test]
    fn test_stale_pid_file_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.pid");

        // A PID far beyond any default pid_max
        fs::write(&path, "999999999").unwrap();

        let _guard = PidFileGuard::create_at(path.clone()).expect("stale file reclaimed");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }
}
