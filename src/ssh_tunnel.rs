//! Ambient — SSH tunnel (spec §5 "Shared resource policy", §6.1 `ssh*`
//! options). A single local port is reference-counted across sessions: the
//! first acquire spawns `ssh -L`, the last release schedules a delayed
//! kill so a session that reconnects moments later reuses the same tunnel
//! instead of re-paying the SSH handshake. This module has no teacher
//! analogue to adapt (the retrieval pack's copy of the teacher's own
//! `ssh_tunnel.rs` was filtered out), so it is written fresh in the
//! teacher's idiom: a `tokio::process::Command` child held behind a
//! `parking_lot::Mutex`, `tracing::instrument`ed like the rest of this
//! crate's I/O boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tokio::time::sleep;

use crate::connection_url::SshOptions;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TunnelKey {
    ssh_host: String,
    ssh_user: String,
    remote_host: String,
    remote_port: u16,
}

struct TunnelHandle {
    child: Child,
    local_port: u16,
    refcount: u32,
}

/// How long a tunnel is kept alive after its last session releases it, to
/// absorb a session that reconnects moments later (spec §5).
const CLOSE_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SshTunnelManager {
    tunnels: Arc<Mutex<HashMap<TunnelKey, TunnelHandle>>>,
}

impl SshTunnelManager {
    pub fn new() -> Self {
        SshTunnelManager { tunnels: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Brings up (or joins) the tunnel for `(ssh, remote_host, remote_port)`,
    /// returning the local port to connect to instead. Reference-counted:
    /// call `release` with the same key once the session no longer needs it.
    #[tracing::instrument(skip(self, ssh), fields(remote_host, remote_port))]
    pub async fn acquire(&self, ssh: &SshOptions, remote_host: &str, remote_port: u16) -> EngineResult<u16> {
        let ssh_host = ssh
            .host
            .clone()
            .ok_or_else(|| EngineError::invalid_connection_properties("sshHost is required when an SSH tunnel is configured"))?;
        let ssh_user = ssh
            .user
            .clone()
            .ok_or_else(|| EngineError::invalid_connection_properties("sshUser is required when an SSH tunnel is configured"))?;
        let key = TunnelKey { ssh_host: ssh_host.clone(), ssh_user: ssh_user.clone(), remote_host: remote_host.to_string(), remote_port };

        let mut tunnels = self.tunnels.lock();
        if let Some(handle) = tunnels.get_mut(&key) {
            handle.refcount += 1;
            return Ok(handle.local_port);
        }

        let local_port = pick_local_port();
        let child = spawn_tunnel(ssh, &ssh_host, &ssh_user, remote_host, remote_port, local_port)?;
        tunnels.insert(key, TunnelHandle { child, local_port, refcount: 1 });
        tracing::info!(local_port, "ssh tunnel established");
        Ok(local_port)
    }

    /// Releases one reference. The underlying `ssh -L` process is killed
    /// only after `CLOSE_DELAY` elapses with no intervening `acquire`.
    pub async fn release(&self, ssh_host: &str, ssh_user: &str, remote_host: &str, remote_port: u16) {
        let key = TunnelKey {
            ssh_host: ssh_host.to_string(),
            ssh_user: ssh_user.to_string(),
            remote_host: remote_host.to_string(),
            remote_port,
        };
        let hit_zero = {
            let mut tunnels = self.tunnels.lock();
            match tunnels.get_mut(&key) {
                Some(handle) if handle.refcount > 1 => {
                    handle.refcount -= 1;
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if !hit_zero {
            return;
        }

        let tunnels = self.tunnels.clone();
        let spawn_key = key.clone();
        tokio::spawn(async move {
            sleep(CLOSE_DELAY).await;
            let mut tunnels = tunnels.lock();
            if let Some(handle) = tunnels.get(&spawn_key) {
                if handle.refcount == 0 {
                    if let Some(mut handle) = tunnels.remove(&spawn_key) {
                        let _ = handle.child.start_kill();
                    }
                }
            }
        });
        // Mark as drained immediately so a concurrent `acquire` racing the
        // delay window spawns a fresh tunnel rather than reusing a zombie.
        if let Some(handle) = self.tunnels.lock().get_mut(&key) {
            handle.refcount = 0;
        }
    }
}

impl Default for SshTunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

fn pick_local_port() -> u16 {
    use std::net::TcpListener;
    TcpListener::bind("127.0.0.1:0")
        .and_then(|l| l.local_addr())
        .map(|addr| addr.port())
        .unwrap_or(0)
}

fn spawn_tunnel(
    ssh: &SshOptions,
    ssh_host: &str,
    ssh_user: &str,
    remote_host: &str,
    remote_port: u16,
    local_port: u16,
) -> EngineResult<Child> {
    let mut command = Command::new("ssh");
    command
        .arg("-N")
        .arg("-L")
        .arg(format!("{local_port}:{remote_host}:{remote_port}"))
        .arg(format!("{ssh_user}@{ssh_host}"));

    if let Some(key_file) = &ssh.private_key_file {
        command.arg("-i").arg(key_file);
    }
    if !ssh.strict_host_key_checking {
        command.arg("-o").arg("StrictHostKeyChecking=no");
    }
    if let Some(known_hosts) = &ssh.known_hosts_file {
        command.arg("-o").arg(format!("UserKnownHostsFile={known_hosts}"));
    }

    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| EngineError::connection_error(format!("failed to spawn ssh tunnel: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_local_port_returns_nonzero() {
        assert_ne!(pick_local_port(), 0);
    }

    #[test]
    fn tunnel_key_equality_ignores_unrelated_fields() {
        let a = TunnelKey { ssh_host: "bastion".into(), ssh_user: "ubuntu".into(), remote_host: "db".into(), remote_port: 27017 };
        let b = a.clone();
        assert_eq!(a, b);
    }
}
