//! WireGuard backend (spec.md §4.D). Grounded on the teacher's
//! `wg_tooling.rs` `connect_session`/`close_session`, which already
//! shell out to `wg-quick up|down <path>`; simplified to match the
//! spec's contract where `server.config_path` is pre-rendered by the
//! caller rather than built from an `InterfaceInfo`/`PeerInfo` pair.

use async_trait::async_trait;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;
use tokio::process::Command;

use super::{Backend, BackendStats, Error};
use crate::server::VPNServer;
use crate::shell::{self, TUNNEL_ESTABLISH_TIMEOUT};

pub struct WireGuardBackend {
    config_path: Option<std::path::PathBuf>,
    up: bool,
    dns_servers: Vec<Ipv4Addr>,
}

impl Default for WireGuardBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl WireGuardBackend {
    pub fn new() -> Self {
        WireGuardBackend { config_path: None, up: false, dns_servers: Vec::new() }
    }
}

fn transfer_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\S+)\s+(\d+)\s+(\d+)$").expect("static regex is valid"))
}

/// Parses `wg show all transfer` output: one line per peer,
/// `interface peer received sent`. Stats are peer-summed (§4.D).
fn parse_transfer(output: &str) -> (u64, u64) {
    let mut received = 0u64;
    let mut sent = 0u64;
    for line in output.lines() {
        if let Some(caps) = transfer_line_re().captures(line.trim()) {
            received += caps[2].parse::<u64>().unwrap_or(0);
            sent += caps[3].parse::<u64>().unwrap_or(0);
        }
    }
    (sent, received)
}

#[async_trait]
impl Backend for WireGuardBackend {
    async fn connect(&mut self, server: &VPNServer) -> Result<bool, Error> {
        let path = server.config_path.clone().ok_or_else(|| Error::StartFailed("wireguard server has no config_path".into()))?;

        let mut cmd = Command::new("wg-quick");
        cmd.arg("up").arg(&path);
        match shell::run_checked(&mut cmd, TUNNEL_ESTABLISH_TIMEOUT).await {
            Ok(_) => {
                self.config_path = Some(path);
                self.up = true;
                Ok(true)
            }
            Err(err) => {
                tracing::error!(%err, "wg-quick up failed");
                Ok(false)
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(path) = &self.config_path {
            let mut cmd = Command::new("wg-quick");
            cmd.arg("down").arg(path);
            if let Err(err) = shell::run_checked(&mut cmd, shell::DESTRUCTIVE_TIMEOUT).await {
                tracing::warn!(%err, "wg-quick down failed");
            }
        }
        self.up = false;
        self.config_path = None;
    }

    async fn force_disconnect(&mut self) {
        // §4.D: WireGuard's force_disconnect delegates to disconnect —
        // there is no child process to SIGKILL, wg-quick is synchronous.
        self.disconnect().await;
    }

    async fn is_up(&self) -> bool {
        self.up
    }

    async fn stats(&self) -> BackendStats {
        let mut cmd = Command::new("wg");
        cmd.args(["show", "all", "transfer"]);
        match shell::run_checked(&mut cmd, shell::ROUTINE_TIMEOUT).await {
            Ok(out) => {
                let (sent, received) = parse_transfer(&out);
                BackendStats { bytes_sent: sent, bytes_received: received, tunnel_ip: None }
            }
            Err(err) => {
                tracing::debug!(%err, "wg show all transfer failed");
                BackendStats::default()
            }
        }
    }

    fn set_dns_servers(&mut self, servers: Vec<Ipv4Addr>) {
        self.dns_servers = servers;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_transfer_output_summed_across_peers() {
        let sample = "wg0\tpeer1key\t1024\t2048\nwg0\tpeer2key\t512\t256\n";
        let (sent, received) = parse_transfer(sample);
        assert_eq!(received, 1536);
        assert_eq!(sent, 2304);
    }

    #[test]
    fn empty_transfer_output_yields_zero_stats() {
        assert_eq!(parse_transfer(""), (0, 0));
    }
}
