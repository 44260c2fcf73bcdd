use std::{path::PathBuf, sync::Arc};

use devdeck_process::{ProcessMeta, Server, Tunnel};
use tracing::{error, info, warn};

use crate::{settings::Settings, store::JsonStore, supervisor::Supervisor};

/// Starts a port-forward as a supervised process.
pub trait TunnelSpawner: Send + Sync {
    fn start_tunnel(&self, server_id: &str, tunnel_id: &str) -> Option<u32>;
}

pub(crate) fn ssh_args(server: &Server, tunnel: &Tunnel, keepalive_secs: u64) -> Vec<String> {
    let mut args = vec![
        "-N".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    if keepalive_secs > 0 {
        args.push("-o".to_string());
        args.push(format!("ServerAliveInterval={keepalive_secs}"));
    }
    args.push("-L".to_string());
    args.push(tunnel.forward_spec());
    args.push("-p".to_string());
    args.push(server.port.to_string());
    if let Some(identity) = &server.identity_file {
        args.push("-i".to_string());
        args.push(identity.display().to_string());
    }
    args.push(server.destination());
    args
}

pub struct SshTunnelSpawner {
    store: Arc<JsonStore>,
    supervisor: Supervisor,
    ssh_program: String,
    keepalive_secs: u64,
    cwd: PathBuf,
}

impl SshTunnelSpawner {
    pub fn new(store: Arc<JsonStore>, supervisor: Supervisor, settings: &Settings) -> Self {
        let cwd = directories::UserDirs::new()
            .map(|d| d.home_dir().to_path_buf())
            .unwrap_or_else(std::env::temp_dir);
        Self {
            store,
            supervisor,
            ssh_program: settings.ssh_program.clone(),
            keepalive_secs: settings.ssh_server_alive_interval_secs,
            cwd,
        }
    }
}

impl TunnelSpawner for SshTunnelSpawner {
    fn start_tunnel(&self, server_id: &str, tunnel_id: &str) -> Option<u32> {
        let (server, tunnel) = match self.store.find_tunnel(server_id, tunnel_id) {
            Ok(Some(v)) => v,
            Ok(None) => {
                warn!(server_id, tunnel_id, "unknown server/tunnel");
                return None;
            }
            Err(e) => {
                error!(server_id, tunnel_id, error = %e, "tunnel lookup failed");
                return None;
            }
        };

        // One forward per tunnel definition; a second ssh would fail to bind anyway.
        match self.supervisor.get_tunnel_processes(&tunnel.id) {
            Ok(running) => {
                if let Some(rec) = running
                    .into_iter()
                    .find(|r| r.owner.server_id.as_deref() == Some(server.id.as_str()))
                {
                    info!(pid = rec.pid, tunnel = %tunnel.name, "tunnel already running");
                    return Some(rec.pid);
                }
            }
            Err(e) => warn!(error = %e, "could not check running tunnels"),
        }

        let args = ssh_args(&server, &tunnel, self.keepalive_secs);
        let name = format!(
            "{} -> {} ({})",
            tunnel.name,
            server.name,
            tunnel.forward_spec()
        );
        self.supervisor.start_process(
            &self.ssh_program,
            &args,
            &self.cwd,
            ProcessMeta::tunnel(name, &server.id, &tunnel.id),
        )
    }
}
