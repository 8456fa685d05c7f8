//! Kill-Switch Manager (spec.md §4.C): the policy layer atop the
//! Packet-Filter Driver. Lifecycle states {INACTIVE, ACTIVE}; a single
//! reentrant-in-effect lock (a `tokio::sync::Mutex` guarding the whole
//! manager) serializes `enable`/`disable` against themselves per §5.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;

use crate::dirs;
use crate::firewall::driver::{CommandRunner, SystemRunner};
use crate::firewall::{self, FirewallSnapshot, KillSwitchPolicy};
use crate::platform;
use crate::server::Protocol;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Inactive,
    Active,
}

#[derive(Serialize, Deserialize)]
struct PersistedEndpoint {
    ip: Ipv4Addr,
    protocol: Protocol,
    port: u16,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    active: bool,
    timestamp: f64,
    allowed_dns: Vec<Ipv4Addr>,
    allowed_vpn_servers: Vec<PersistedEndpoint>,
    interface: String,
    backup_interface: String,
}

struct Inner {
    state: State,
    policy: KillSwitchPolicy,
    snapshot: Option<FirewallSnapshot>,
}

/// Owned by the [`crate::controller::Controller`]; `enable`/`disable`
/// take `&self` and serialize through the internal mutex so concurrent
/// callers (a monitor-loop leak response racing an operator
/// `disable()`) cannot interleave (§5).
pub struct KillSwitchManager {
    inner: Mutex<Inner>,
    runner: Box<dyn CommandRunner>,
}

impl Default for KillSwitchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitchManager {
    pub fn new() -> Self {
        Self::with_runner(Box::new(SystemRunner))
    }

    /// Test/property-harness entry point (spec.md §8 S2, S3): swap in a
    /// fake [`CommandRunner`] so `enable`/`disable` can be exercised
    /// without a live firewall or root.
    pub fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        KillSwitchManager { inner: Mutex::new(Inner { state: State::Inactive, policy: KillSwitchPolicy::default(), snapshot: None }), runner }
    }

    pub async fn is_active(&self) -> bool {
        self.inner.lock().await.state == State::Active
    }

    /// `add_vpn_server`/`add_dns` take effect only on the next
    /// `enable(force=true)` per §4.C — callers add endpoints before
    /// calling `enable()`.
    pub async fn add_vpn_server(&self, ip: Ipv4Addr, protocol: Protocol, port: u16) {
        self.inner.lock().await.policy.add_vpn_server(ip, protocol, port);
    }

    pub async fn add_dns(&self, dns: Ipv4Addr) {
        self.inner.lock().await.policy.add_dns(dns);
    }

    /// §4.C `enable(allow_lan, force)`.
    pub async fn enable(&self, allow_lan: bool, force: bool, union_resolv_conf_dns: bool) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.state == State::Active && !force {
            tracing::warn!("kill switch already active");
            return true;
        }

        tracing::info!("enabling kill switch");

        let snapshot = match firewall::driver::snapshot(self.runner.as_ref()).await {
            Ok(snap) => snap,
            Err(err) => {
                tracing::error!(%err, "failed to snapshot firewall state, aborting enable");
                return false;
            }
        };

        // §11 Open Question: unioning in whatever /etc/resolv.conf
        // currently lists is opt-in, not automatic, to avoid silently
        // widening the allow-list to a resolver the operator didn't pick.
        if union_resolv_conf_dns {
            for dns in platform::current_dns(std::path::Path::new("/etc/resolv.conf")) {
                inner.policy.add_dns(dns);
            }
        }

        if allow_lan {
            inner.policy.allow_lan = true;
            inner.policy.local_networks = platform::lan_cidrs().await.into_iter().map(|net| net.to_string()).collect();
        } else {
            inner.policy.allow_lan = false;
        }

        firewall::driver::flush(self.runner.as_ref()).await;

        if let Err(err) = firewall::driver::apply(self.runner.as_ref(), &inner.policy, &snapshot).await {
            tracing::error!(%err, "failed to apply kill switch policy, rolled back");
            return false;
        }

        if !firewall::driver::verify(self.runner.as_ref(), &inner.policy.primary_interface).await {
            tracing::error!("kill switch verification failed, restoring snapshot");
            firewall::driver::restore(self.runner.as_ref(), &snapshot).await;
            return false;
        }

        if let Err(err) = persist_state(&inner.policy).await {
            tracing::warn!(%err, "failed to persist kill switch state file");
        }

        inner.snapshot = Some(snapshot);
        inner.state = State::Active;
        tracing::info!("kill switch enabled");
        true
    }

    /// §4.C `disable()`.
    pub async fn disable(&self) -> bool {
        let mut inner = self.inner.lock().await;

        if inner.state == State::Inactive {
            tracing::debug!("kill switch already inactive");
            return true;
        }

        tracing::info!("disabling kill switch");

        match inner.snapshot.take() {
            Some(snapshot) => firewall::driver::restore(self.runner.as_ref(), &snapshot).await,
            None => {
                tracing::warn!("no in-memory snapshot, restoring from crash-recovery file");
                match FirewallSnapshot::read_backup_file().await {
                    Ok(from_disk) => firewall::driver::restore(self.runner.as_ref(), &from_disk).await,
                    Err(err) => {
                        tracing::error!(%err, "no snapshot available anywhere, forcing emergency open");
                        firewall::driver::emergency_open(self.runner.as_ref()).await;
                    }
                }
            }
        }

        FirewallSnapshot::remove_backup_file().await;
        let _ = tokio::fs::remove_file(dirs::firewall_state_path()).await;

        inner.state = State::Inactive;
        tracing::info!("kill switch disabled");
        true
    }
}

fn unix_timestamp() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

async fn persist_state(policy: &KillSwitchPolicy) -> Result<(), std::io::Error> {
    let state = PersistedState {
        active: true,
        timestamp: unix_timestamp(),
        allowed_dns: policy.allowed_dns.clone(),
        allowed_vpn_servers: policy.allowed_vpn_servers.iter().map(|e| PersistedEndpoint { ip: e.ip, protocol: e.protocol, port: e.port }).collect(),
        interface: policy.primary_interface.clone(),
        backup_interface: policy.backup_interface.clone(),
    };
    let json = serde_json::to_vec_pretty(&state)?;
    tokio::fs::write(dirs::firewall_state_path(), json).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_manager_is_inactive() {
        let manager = KillSwitchManager::new();
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn disable_on_inactive_manager_is_a_no_op_success() {
        let manager = KillSwitchManager::new();
        assert!(manager.disable().await);
        assert!(!manager.is_active().await);
    }

    #[tokio::test]
    async fn add_vpn_server_before_enable_populates_policy() {
        let manager = KillSwitchManager::new();
        manager.add_vpn_server(Ipv4Addr::new(198, 51, 100, 10), Protocol::Udp, 1194).await;
        let inner = manager.inner.lock().await;
        assert_eq!(inner.policy.allowed_vpn_servers.len(), 1);
    }

    /// spec.md §8 S3: a failure partway through applying the ruleset
    /// leaves the Manager INACTIVE rather than half-enabled.
    #[tokio::test]
    async fn enable_failure_leaves_manager_inactive() {
        let runner = firewall::driver::tests::FakeRunner::failing_when(|bin, args| bin == "iptables" && args.first().copied() == Some("-P") && args.last().copied() == Some("DROP"));
        let manager = KillSwitchManager::with_runner(Box::new(runner));

        manager.add_vpn_server(Ipv4Addr::new(198, 51, 100, 10), Protocol::Udp, 1194).await;
        let enabled = manager.enable(true, false, false).await;

        assert!(!enabled);
        assert!(!manager.is_active().await);
    }

    /// spec.md §8 S2: enable() then disable() restores every table the
    /// snapshot captured at entry.
    #[tokio::test]
    async fn enable_then_disable_restores_the_entry_snapshot() {
        let runner = firewall::driver::tests::FakeRunner::new();
        let manager = KillSwitchManager::with_runner(Box::new(runner));

        manager.add_vpn_server(Ipv4Addr::new(198, 51, 100, 10), Protocol::Udp, 1194).await;
        assert!(manager.enable(true, false, false).await);
        assert!(manager.is_active().await);

        assert!(manager.disable().await);
        assert!(!manager.is_active().await);
    }
}
