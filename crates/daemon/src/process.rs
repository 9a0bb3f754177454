// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Warden Contributors

// Tunnel Warden - External Forwarding Process
// Builds the secure-shell client invocation and owns the spawned child

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use tunnel_warden_common::{Error, Result, TunnelSpec};

/// Grace period between a termination signal and a forced kill
pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
/// Drain period after termination for OS process-table cleanup
pub const TERMINATE_DRAIN: Duration = Duration::from_secs(1);

/// How forwarding processes are spawned. Passed in by the host instead
/// of probing the OS inside the state machine.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// The secure-shell client executable
    pub program: String,
    /// Suppress any interactive console the child would open
    /// (CREATE_NO_WINDOW on Windows; no effect elsewhere)
    pub suppress_console: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            suppress_console: true,
        }
    }
}

fn null_device() -> &'static str {
    if cfg!(windows) {
        "NUL"
    } else {
        "/dev/null"
    }
}

/// Build the argument list for the external client: local forward,
/// keep-alive and timeout options, no remote command, user@host last.
pub fn forward_args(spec: &TunnelSpec) -> Vec<String> {
    let mut args = Vec::new();

    if spec.ssh_port != 22 {
        args.push("-p".to_string());
        args.push(spec.ssh_port.to_string());
    }

    args.push("-L".to_string());
    args.push(format!(
        "{}:{}:{}",
        spec.local_port, spec.remote_host, spec.remote_port
    ));

    if let Some(key_path) = &spec.ssh_key_path {
        args.push("-i".to_string());
        args.push(key_path.display().to_string());
    }

    // Robustness options for unattended operation
    args.push("-o".to_string());
    args.push("ConnectTimeout=10".to_string());
    args.push("-o".to_string());
    args.push("ServerAliveInterval=20".to_string());
    args.push("-o".to_string());
    args.push("ServerAliveCountMax=3".to_string());
    args.push("-o".to_string());
    args.push("StrictHostKeyChecking=no".to_string());
    args.push("-o".to_string());
    args.push(format!("UserKnownHostsFile={}", null_device()));

    // No remote command, forwarding only
    args.push("-N".to_string());

    args.push(format!("{}@{}", spec.ssh_user, spec.ssh_host));

    args
}

/// One spawned forwarding process. A tunnel owns at most one of these
/// at a time.
#[derive(Debug)]
pub struct ForwardProcess {
    child: Child,
}

impl ForwardProcess {
    /// Spawn the external client with its output discarded
    pub fn spawn(options: &SpawnOptions, args: &[String]) -> Result<Self> {
        let mut command = Command::new(&options.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        if options.suppress_console {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {}", options.program, e)))?;

        debug!(
            "Spawned forwarding process {} (pid {:?})",
            options.program,
            child.id()
        );

        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Request graceful termination, escalate to a forced kill after
    /// the grace period, then wait out the drain period so the bound
    /// local port is actually released before the caller reports the
    /// tunnel as stopped.
    pub async fn terminate(mut self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.child.id() {
                // SIGTERM first; the client exits cleanly on it
                let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if rc != 0 {
                    debug!("SIGTERM to pid {} failed (already exited?)", pid);
                }
            }

            match tokio::time::timeout(TERMINATE_GRACE, self.child.wait()).await {
                Ok(Ok(status)) => debug!("Forwarding process exited: {}", status),
                Ok(Err(e)) => warn!("Failed to reap forwarding process: {}", e),
                Err(_) => {
                    warn!(
                        "Forwarding process did not exit within {:?}, killing",
                        TERMINATE_GRACE
                    );
                    if let Err(e) = self.child.kill().await {
                        warn!("Failed to kill forwarding process: {}", e);
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            // No termination signal on this platform; kill directly
            if let Err(e) = self.child.kill().await {
                warn!("Failed to kill forwarding process: {}", e);
            }
        }

        tokio::time::sleep(TERMINATE_DRAIN).await;
    }

    /// Forced kill, waiting for the child to be reaped. Used by
    /// restart, which must not spawn a successor while the previous
    /// process may still hold the local port.
    pub async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill forwarding process: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec() -> TunnelSpec {
        TunnelSpec {
            name: "web".to_string(),
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
    fn test_forward_args_default_port() {
        let args = forward_args(&spec());

        // Default SSH port is not passed explicitly
        assert!(!args.contains(&"-p".to_string()));

        let l = args.iter().position(|a| a == "-L").unwrap();
        assert_eq!(args[l + 1], "8080:db.internal:5432");

        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/k");

        assert!(args.contains(&"-N".to_string()));
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(args.last().unwrap(), "ops@bastion");
    }

    #[test]
    fn test_forward_args_custom_port() {
        let mut s = spec();
        s.ssh_port = 2222;
        let args = forward_args(&s);

        let p = args.iter().position(|a| a == "-p").unwrap();
        assert_eq!(args[p + 1], "2222");
    }

    #[test]
    fn test_forward_args_without_key() {
        let mut s = spec();
        s.ssh_key_path = None;
        s.ssh_password = Some("secret".to_string());
        let args = forward_args(&s);

        assert!(!args.contains(&"-i".to_string()));
        // The password never reaches the argument list
        assert!(!args.iter().any(|a| a.contains("secret")));
    }

    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let options = SpawnOptions {
            program: "/nonexistent/ssh-client".to_string(),
            suppress_console: false,
        };
        let result = ForwardProcess::spawn(&options, &[]);
        assert!(matches!(result, Err(Error::Spawn(_))));
    }

    #[tokio::test]
    async fn test_terminate_long_lived_child() {
        let options = SpawnOptions {
            program: "sleep".to_string(),
            suppress_console: false,
        };
        let process = ForwardProcess::spawn(&options, &["30".to_string()]).unwrap();
        assert!(process.id().is_some());

        let started = std::time::Instant::now();
        process.terminate().await;

        // SIGTERM takes effect well within the grace period; only the
        // drain period should dominate
        assert!(started.elapsed() < TERMINATE_GRACE + TERMINATE_DRAIN + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_kill_reaps_child() {
        let options = SpawnOptions {
            program: "sleep".to_string(),
            suppress_console: false,
        };
        let process = ForwardProcess::spawn(&options, &["30".to_string()]).unwrap();
        process.kill().await;
    }
}
