//! Tunnel Backends (spec.md §4.D): a uniform capability set over
//! {OpenVPN-process, WireGuard-quick}. The Controller holds at most one
//! live `Backend` trait object at a time (Invariant 4).

pub mod openvpn;
pub mod wireguard;

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;

use crate::server::{Credentials, Protocol, VPNServer};

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend failed to start: {0}")]
    StartFailed(String),
    #[error("backend authentication failed")]
    AuthFailed,
    #[error("backend timed out establishing the tunnel")]
    Timeout,
    #[error(transparent)]
    Shell(#[from] crate::shell::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BackendStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub tunnel_ip: Option<Ipv4Addr>,
}

/// §4.D's uniform capability set. `connect`/`disconnect` are `&mut self`
/// because each call mutates backend-owned process/monitor state;
/// `is_up`/`stats` are read-only queries safe to poll from the monitor
/// loop.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&mut self, server: &VPNServer) -> Result<bool, Error>;
    async fn disconnect(&mut self);
    async fn force_disconnect(&mut self);
    async fn is_up(&self) -> bool;
    async fn stats(&self) -> BackendStats;
    fn set_dns_servers(&mut self, servers: Vec<Ipv4Addr>);

    /// Only `OpenVpnBackend` reads this (§4.D `--auth-user-pass`);
    /// WireGuard's key-based auth has no use for it, so the default is
    /// a no-op rather than forcing every implementor to override it.
    fn set_credentials(&mut self, credentials: Option<Credentials>) {
        let _ = credentials;
    }
}

/// Picks the Backend implementation by `server.protocol`, as the
/// Controller's `connect()` does in §4.G.
pub fn for_protocol(protocol: Protocol) -> Box<dyn Backend> {
    match protocol {
        Protocol::Udp | Protocol::Tcp => Box::new(openvpn::OpenVpnBackend::new()),
        Protocol::WireGuard => Box::new(wireguard::WireGuardBackend::new()),
    }
}
