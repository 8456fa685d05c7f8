//! Data model shared across the crate (spec.md §3): `VPNServer` and
//! `ConnectionStats`.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Udp,
    Tcp,
    WireGuard,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::WireGuard => "wireguard",
        };
        write!(f, "{s}")
    }
}

/// Username/password pair for backends that authenticate that way
/// (spec.md §4.D "if credentials supplied, writes a second 0600 file
/// for `--auth-user-pass`"). WireGuard's key-based auth never reads
/// this; it only flows through to `OpenVpnBackend`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Optional quality metadata attached to a server by the Selector/Probes.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Quality {
    pub latency_ms: Option<f64>,
    pub load: Option<u8>,
    pub score: f64,
}

/// Immutable once constructed (spec.md §3 "Servers are immutable once
/// constructed"): no field is ever mutated in place. Rotation and
/// rescoring build a new `VPNServer`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VPNServer {
    pub id: String,
    pub hostname: String,
    pub ip: Ipv4Addr,
    pub country: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub protocol: Protocol,
    pub port: u16,
    pub quality: Quality,
    /// Backend-specific config file: an `.ovpn` file for OpenVPN, a
    /// `wg-quick` config for WireGuard.
    pub config_path: Option<PathBuf>,
    pub credentials: Option<Credentials>,
}

impl VPNServer {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, ip: Ipv4Addr, protocol: Protocol, port: u16) -> Self {
        VPNServer {
            id: id.into(),
            hostname: hostname.into(),
            ip,
            country: None,
            city: None,
            isp: None,
            protocol,
            port,
            quality: Quality::default(),
            config_path: None,
            credentials: None,
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials { username: username.into(), password: password.into() });
        self
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_location(mut self, country: impl Into<String>, city: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self.city = Some(city.into());
        self
    }
}

/// A mutable record attached to an active session (spec.md §3). Owned by
/// the [`crate::controller::Controller`]; bytes counters are reset on
/// disconnect, never decremented while CONNECTED (Invariant 2).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    #[serde(skip, default)]
    connected_since: Option<Instant>,
    pub public_ip: Option<Ipv4Addr>,
    pub location: Option<String>,
    pub server_id: Option<String>,
    pub dns_servers: Vec<Ipv4Addr>,
}

impl ConnectionStats {
    pub fn begin_session(&mut self, server_id: String, dns_servers: Vec<Ipv4Addr>) {
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.connected_since = Some(Instant::now());
        self.server_id = Some(server_id);
        self.dns_servers = dns_servers;
        self.public_ip = None;
        self.location = None;
    }

    /// Invariant 2: bytes counters only move forward within a session.
    pub fn update_bytes(&mut self, sent: u64, received: u64) {
        self.bytes_sent = self.bytes_sent.max(sent);
        self.bytes_received = self.bytes_received.max(received);
    }

    pub fn end_session(&mut self) {
        self.bytes_sent = 0;
        self.bytes_received = 0;
        self.connected_since = None;
        self.server_id = None;
        self.dns_servers.clear();
        self.public_ip = None;
        self.location = None;
    }

    pub fn connected_since(&self) -> Option<Instant> {
        self.connected_since
    }

    pub fn session_duration(&self) -> Option<Duration> {
        self.connected_since.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_never_decrease_within_a_session() {
        let mut stats = ConnectionStats::default();
        stats.begin_session("s1".into(), vec![]);
        stats.update_bytes(100, 200);
        stats.update_bytes(50, 1000); // a stale/reordered sample
        assert_eq!(stats.bytes_sent, 100);
        assert_eq!(stats.bytes_received, 1000);
    }

    #[test]
    fn end_session_resets_counters() {
        let mut stats = ConnectionStats::default();
        stats.begin_session("s1".into(), vec![Ipv4Addr::new(1, 1, 1, 1)]);
        stats.update_bytes(10, 10);
        stats.end_session();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.bytes_received, 0);
        assert!(stats.connected_since().is_none());
        assert!(stats.dns_servers.is_empty());
    }
}
