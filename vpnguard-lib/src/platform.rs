//! Platform Probe (spec.md §4.A).
//!
//! A pure-query surface: OS family, privilege, tool availability, local
//! networks, default gateway, current DNS. Every probe here fails soft —
//! a missing tool or unparsable line turns into an absent capability,
//! never a propagated error — mirroring the "everything wrapped in
//! try/except, default to unavailable" shape of the original's
//! `system_check.py` and `network_tools.py`.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::process::Command;

use crate::shell::{self, ROUTINE_TIMEOUT};

/// Binaries the Kill-Switch Manager and Tunnel Backends shell out to.
/// Grounded on `check_required_commands()` in the original's
/// `system_check.py`, narrowed to what this crate actually invokes.
pub const REQUIRED_FIREWALL_TOOLS: &[&str] = &["iptables", "ip6tables", "iptables-save", "iptables-restore", "ip"];

#[derive(Clone, Debug, Default)]
pub struct ToolAvailability {
    pub iptables: bool,
    pub ip6tables: bool,
    pub iptables_save: bool,
    pub iptables_restore: bool,
    pub ip: bool,
    pub openvpn: bool,
    pub wg: bool,
    pub wg_quick: bool,
}

impl ToolAvailability {
    /// §4.A: the Controller refuses to start the kill switch unless the
    /// iptables family (including save/restore) is fully present.
    pub fn firewall_capable(&self) -> bool {
        self.iptables && self.ip6tables && self.iptables_save && self.iptables_restore
    }
}

fn which(name: &str) -> bool {
    // `which` itself is a dependency of the probe, not of the crate's
    // runtime surface, so a bare std call (no hard timeout) is fine here.
    std::process::Command::new("which")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn detect_tools() -> ToolAvailability {
    ToolAvailability {
        iptables: which("iptables"),
        ip6tables: which("ip6tables"),
        iptables_save: which("iptables-save"),
        iptables_restore: which("iptables-restore"),
        ip: which("ip"),
        openvpn: which("openvpn"),
        wg: which("wg"),
        wg_quick: which("wg-quick"),
    }
}

pub fn is_linux() -> bool {
    cfg!(target_os = "linux")
}

#[cfg(unix)]
pub fn is_root() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
pub fn is_root() -> bool {
    false
}

/// Parses `ip route show` output for link-scope routes (LAN CIDRs), the
/// way the original's `get_default_gateway`/routing helpers scan line by
/// line for a keyword and split on whitespace.
pub fn parse_lan_cidrs(route_show: &str) -> Vec<Ipv4Network> {
    let mut cidrs = Vec::new();
    for line in route_show.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.is_empty() || parts[0] == "default" {
            continue;
        }
        if let Ok(net) = parts[0].parse::<Ipv4Network>() {
            cidrs.push(net);
        }
    }
    cidrs
}

/// Parses `default via X ...` the way `get_default_gateway` does:
/// scan for the line, split on whitespace, take the token after `via`.
pub fn parse_default_gateway(route_show_default: &str) -> Option<Ipv4Addr> {
    for line in route_show_default.lines() {
        if !line.contains("default via") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        let via_idx = parts.iter().position(|&p| p == "via")?;
        if let Some(addr) = parts.get(via_idx + 1) {
            if let Ok(ip) = addr.parse() {
                return Some(ip);
            }
        }
    }
    None
}

async fn ip_route_show(args: &[&str]) -> Option<String> {
    let mut cmd = Command::new("ip");
    cmd.arg("route").arg("show").args(args);
    shell::run_checked(&mut cmd, ROUTINE_TIMEOUT).await.ok()
}

pub async fn lan_cidrs() -> Vec<Ipv4Network> {
    match ip_route_show(&[]).await {
        Some(out) => parse_lan_cidrs(&out),
        None => {
            tracing::debug!("ip route show unavailable, reporting no LAN ranges");
            Vec::new()
        }
    }
}

pub async fn default_gateway() -> Option<Ipv4Addr> {
    match ip_route_show(&["default"]).await {
        Some(out) => parse_default_gateway(&out),
        None => None,
    }
}

/// Reads `nameserver` lines from `/etc/resolv.conf`, same loop shape as
/// `get_current_dns()` in the original.
pub fn parse_resolv_conf(contents: &str) -> Vec<Ipv4Addr> {
    contents
        .lines()
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.split_whitespace().next())
        .filter_map(|tok| tok.parse().ok())
        .collect()
}

pub fn current_dns(resolv_conf: &Path) -> Vec<Ipv4Addr> {
    match std::fs::read_to_string(resolv_conf) {
        Ok(contents) => parse_resolv_conf(&contents),
        Err(err) => {
            tracing::debug!(%err, path = %resolv_conf.display(), "resolv.conf unreadable, reporting no DNS");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lan_cidrs_skipping_default_route() {
        let sample = "default via 192.168.1.1 dev eth0 proto dhcp metric 100\n\
                       192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.42\n\
                       10.8.0.0/24 dev tun0 proto kernel scope link src 10.8.0.2";
        let cidrs = parse_lan_cidrs(sample);
        assert_eq!(cidrs.len(), 2);
        assert_eq!(cidrs[0].to_string(), "192.168.1.0/24");
    }

    #[test]
    fn parses_default_gateway() {
        let sample = "default via 192.168.1.1 dev eth0 proto dhcp metric 100";
        assert_eq!(parse_default_gateway(sample), Some(Ipv4Addr::new(192, 168, 1, 1)));
    }

    #[test]
    fn missing_default_gateway_returns_none() {
        assert_eq!(parse_default_gateway("10.8.0.0/24 dev tun0 scope link"), None);
    }

    #[test]
    fn parses_nameservers_from_resolv_conf() {
        let sample = "# generated\nnameserver 1.1.1.1\nnameserver 8.8.8.8\nsearch example.com\n";
        let servers = parse_resolv_conf(sample);
        assert_eq!(servers, vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]);
    }

    #[test]
    fn firewall_capable_requires_full_iptables_family() {
        let mut tools = ToolAvailability::default();
        assert!(!tools.firewall_capable());
        tools.iptables = true;
        tools.ip6tables = true;
        tools.iptables_save = true;
        tools.iptables_restore = true;
        assert!(tools.firewall_capable());
    }
}
