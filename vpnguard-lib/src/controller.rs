//! VPN Controller (spec.md §4.G): the state machine that owns the current
//! server, the live backend, the kill switch, and the background monitor
//! loop. `connect`/`disconnect`/`rotate_ip` serialize through a single
//! connection lock (§5); `emergency_disconnect` deliberately bypasses it.

use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;
use std::future::Future;

use backoff::backoff::Backoff;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{self, Backend};
use crate::config::Config;
use crate::killswitch::KillSwitchManager;
use crate::platform;
use crate::probe::{DnsLeakProbe, GeoProbe, PublicIpProbe};
use crate::selector::{self, ServerSelector};
use crate::server::{ConnectionStats, VPNServer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VPNState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Rotating,
    Error,
}

/// Coarse failure categories (spec.md §7). `LeakDetected` and
/// `ProbeUnavailable` never surface here — they drive the monitor loop's
/// internal leak-response and are only ever logged.
#[derive(Debug, Error)]
pub enum Error {
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("no suitable server available")]
    NoServerAvailable,
    #[error("failed to apply kill switch policy")]
    FirewallApplyFailed,
    #[error("kill switch unavailable: not Linux, not root, or missing the iptables toolchain")]
    PlatformUnavailable,
    #[error("backend failed to start: {0}")]
    BackendStartFailed(String),
    #[error("backend authentication failed")]
    BackendAuthFailed,
    #[error("backend timed out establishing the tunnel")]
    BackendTimeout,
}

impl From<backend::Error> for Error {
    fn from(err: backend::Error) -> Self {
        match err {
            backend::Error::AuthFailed => Error::BackendAuthFailed,
            backend::Error::Timeout => Error::BackendTimeout,
            other => Error::BackendStartFailed(other.to_string()),
        }
    }
}

/// Outcome of [`Controller::check_for_leak`]. `Ip` names the
/// `PublicIpProbe` service that produced the mismatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeakSignal {
    None,
    Ip(&'static str),
    Dns,
}

#[derive(Clone, Debug, Serialize)]
pub struct Status {
    pub state: VPNState,
    pub connected: bool,
    pub server: Option<VPNServer>,
    pub stats: ConnectionStats,
    pub kill_switch_active: bool,
    pub uptime_secs: f64,
}

type StateChangeCallback = Box<dyn Fn(VPNState, VPNState, &str) + Send + Sync>;
type IpChangeCallback = Box<dyn Fn(Ipv4Addr) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    state_change: Vec<StateChangeCallback>,
    ip_change: Vec<IpChangeCallback>,
    error: Vec<ErrorCallback>,
}

/// Owns everything the spec's state machine needs. Built behind an `Arc`
/// because the monitor loop and reconnect attempts both need to call back
/// into `connect`/`emergency_disconnect` from a spawned task.
pub struct Controller {
    connection_lock: AsyncMutex<()>,
    state: SyncMutex<VPNState>,
    current_server: SyncMutex<Option<VPNServer>>,
    backend: AsyncMutex<Option<Box<dyn Backend>>>,
    stats: SyncMutex<ConnectionStats>,
    servers: SyncMutex<ServerSelector>,
    kill_switch: KillSwitchManager,
    public_ip_probe: PublicIpProbe,
    geo_probe: GeoProbe,
    dns_leak_probe: DnsLeakProbe,
    config: Config,
    callbacks: SyncMutex<Callbacks>,
    monitor_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
    /// Replaced with a fresh token each time the monitor loop starts, so
    /// `stop_monitoring`/`emergency_disconnect` only ever cancel the
    /// currently-running loop rather than leaving it permanently wedged.
    monitor_cancel: SyncMutex<CancellationToken>,
}

impl Controller {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Controller {
            connection_lock: AsyncMutex::new(()),
            state: SyncMutex::new(VPNState::Disconnected),
            current_server: SyncMutex::new(None),
            backend: AsyncMutex::new(None),
            stats: SyncMutex::new(ConnectionStats::default()),
            servers: SyncMutex::new(ServerSelector::default()),
            kill_switch: KillSwitchManager::new(),
            public_ip_probe: PublicIpProbe::new(),
            geo_probe: GeoProbe::new(),
            dns_leak_probe: DnsLeakProbe::new(),
            config,
            callbacks: SyncMutex::new(Callbacks::default()),
            monitor_handle: AsyncMutex::new(None),
            monitor_cancel: SyncMutex::new(CancellationToken::new()),
        })
    }

    /// The candidate pool `rotate_ip`/auto-reconnect pick from. Populated
    /// by the owning CLI/daemon (server-list retrieval is out of scope
    /// here, per the Selector's own "pure in-memory filter" design).
    pub fn set_servers(&self, servers: Vec<VPNServer>) {
        *self.servers.lock().unwrap() = ServerSelector::new(servers);
    }

    pub fn get_state(&self) -> VPNState {
        *self.state.lock().unwrap()
    }

    pub async fn get_status(&self) -> Status {
        let state = self.get_state();
        let server = self.current_server.lock().unwrap().clone();
        let stats = self.stats.lock().unwrap().clone();
        let kill_switch_active = self.kill_switch.is_active().await;
        let uptime_secs = stats.session_duration().map(|d| d.as_secs_f64()).unwrap_or(0.0);
        Status { state, connected: state == VPNState::Connected, server, stats, kill_switch_active, uptime_secs }
    }

    pub fn register_state_change_callback<F>(&self, cb: F)
    where
        F: Fn(VPNState, VPNState, &str) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().state_change.push(Box::new(cb));
    }

    pub fn register_ip_change_callback<F>(&self, cb: F)
    where
        F: Fn(Ipv4Addr) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().ip_change.push(Box::new(cb));
    }

    pub fn register_error_callback<F>(&self, cb: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().error.push(Box::new(cb));
    }

    /// §4.G `connect(server, enable_kill_switch, dns_servers)`.
    pub async fn connect(self: &Arc<Self>, server: VPNServer, enable_kill_switch: bool, dns_servers: Option<Vec<Ipv4Addr>>) -> Result<(), Error> {
        let _guard = self.connection_lock.lock().await;
        self.connect_inner(server, enable_kill_switch, dns_servers).await
    }

    async fn connect_inner(self: &Arc<Self>, server: VPNServer, enable_kill_switch: bool, dns_servers: Option<Vec<Ipv4Addr>>) -> Result<(), Error> {
        if matches!(self.get_state(), VPNState::Connecting | VPNState::Connected) {
            tracing::warn!("already connected or connecting");
            return Err(Error::AlreadyConnected);
        }

        tracing::info!(hostname = %server.hostname, "connecting to vpn server");
        self.change_state(VPNState::Connecting, "");

        match self.connect_attempt(&server, enable_kill_switch, dns_servers).await {
            Ok(()) => {
                *self.current_server.lock().unwrap() = Some(server);
                self.start_monitoring().await;
                self.change_state(VPNState::Connected, "");
                let ip = self.stats.lock().unwrap().public_ip;
                if let Some(ip) = ip {
                    tracing::info!(%ip, "connected successfully");
                    self.notify_ip_change(ip);
                }
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, "connection failed");
                self.cleanup_resources().await;
                self.notify_error(&err.to_string());
                self.change_state(VPNState::Error, &err.to_string());
                Err(err)
            }
        }
    }

    /// The part of `connect` that can fail: kill switch, backend dial,
    /// stats bootstrap. Shared by `connect_inner` and `rotate_ip`, which
    /// each own state transitions around it differently.
    async fn connect_attempt(&self, server: &VPNServer, enable_kill_switch: bool, dns_servers: Option<Vec<Ipv4Addr>>) -> Result<(), Error> {
        let dns_list = dns_servers.unwrap_or_else(|| self.config.dns_servers.clone());

        if enable_kill_switch {
            // §4.A: refuse to even try the kill switch unless the iptables
            // family (including save/restore) is present and we're root —
            // failing up front here instead of deep inside driver::apply.
            if !platform::is_linux() || !platform::is_root() || !platform::detect_tools().firewall_capable() {
                return Err(Error::PlatformUnavailable);
            }

            self.kill_switch.add_vpn_server(server.ip, server.protocol, server.port).await;
            for dns in &dns_list {
                self.kill_switch.add_dns(*dns).await;
            }
            if !self.kill_switch.enable(true, false, self.config.union_resolv_conf_dns).await {
                return Err(Error::FirewallApplyFailed);
            }
        }

        let mut backend = backend::for_protocol(server.protocol);
        backend.set_dns_servers(dns_list.clone());
        backend.set_credentials(server.credentials.clone());

        let connected = backend.connect(server).await?;
        if !connected {
            return Err(Error::BackendStartFailed(format!("{} refused the connection", server.hostname)));
        }

        self.stats.lock().unwrap().begin_session(server.id.clone(), dns_list);
        *self.backend.lock().await = Some(backend);
        self.update_connection_info().await;
        Ok(())
    }

    /// §4.G `disconnect(keep_kill_switch)`.
    pub async fn disconnect(&self, keep_kill_switch: bool) -> Result<(), Error> {
        let _guard = self.connection_lock.lock().await;
        self.disconnect_inner(keep_kill_switch).await
    }

    async fn disconnect_inner(&self, keep_kill_switch: bool) -> Result<(), Error> {
        if self.get_state() == VPNState::Disconnected {
            return Ok(());
        }

        tracing::info!("disconnecting vpn");
        self.change_state(VPNState::Disconnecting, "");

        self.stop_monitoring().await;

        if let Some(backend) = self.backend.lock().await.as_mut() {
            backend.disconnect().await;
        }

        if !keep_kill_switch {
            self.kill_switch.disable().await;
        }

        self.cleanup_resources().await;
        self.change_state(VPNState::Disconnected, "");
        tracing::info!("disconnected successfully");
        Ok(())
    }

    /// §4.G `rotate_ip(new_location, random_location)`. Keeps the monitor
    /// loop running across the swap (only CONNECTED gates its checks) and
    /// falls back to the previous server on failure, same as the original.
    pub async fn rotate_ip(self: &Arc<Self>, new_location: Option<&str>, random_location: bool) -> Result<(), Error> {
        let _guard = self.connection_lock.lock().await;

        if self.get_state() != VPNState::Connected {
            tracing::error!("cannot rotate: not connected");
            return Err(Error::NotConnected);
        }

        tracing::info!("rotating ip address");
        self.change_state(VPNState::Rotating, "");

        let old_ip = self.stats.lock().unwrap().public_ip;
        let exclude = self.current_server.lock().unwrap().as_ref().map(|s| s.id.clone());

        let candidate = {
            let servers = self.servers.lock().unwrap();
            if random_location {
                servers.random().cloned()
            } else if let Some(location) = new_location {
                let filter = selector::Filter { location_substring: Some(location), ..Default::default() };
                servers.find(&filter).into_iter().next().cloned()
            } else {
                servers.best(exclude.as_deref()).cloned()
            }
        };

        let Some(new_server) = candidate else {
            tracing::error!("no suitable server found for rotation");
            self.notify_error("no suitable server found");
            self.change_state(VPNState::Error, "no suitable server found");
            return Err(Error::NoServerAvailable);
        };

        let kill_switch_was_active = self.kill_switch.is_active().await;
        if kill_switch_was_active {
            self.kill_switch.disable().await;
        }

        if let Some(backend) = self.backend.lock().await.as_mut() {
            backend.disconnect().await;
        }

        let dns_servers = self.stats.lock().unwrap().dns_servers.clone();
        let previous_server = self.current_server.lock().unwrap().clone();

        match self.connect_attempt(&new_server, kill_switch_was_active, Some(dns_servers.clone())).await {
            Ok(()) => {
                *self.current_server.lock().unwrap() = Some(new_server);
                self.change_state(VPNState::Connected, "");
                let new_ip = self.stats.lock().unwrap().public_ip;
                tracing::info!(?old_ip, ?new_ip, "ip rotated");
                if let Some(ip) = new_ip {
                    self.notify_ip_change(ip);
                }
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "rotation failed, attempting to reconnect to previous server");
                if let Some(prev) = previous_server {
                    if self.connect_attempt(&prev, kill_switch_was_active, Some(dns_servers)).await.is_ok() {
                        self.change_state(VPNState::Connected, "");
                        return Err(err);
                    }
                }
                self.cleanup_resources().await;
                self.notify_error(&err.to_string());
                self.change_state(VPNState::Error, &err.to_string());
                Err(err)
            }
        }
    }

    /// §4.G `emergency_disconnect()` — bypasses `connection_lock` on
    /// purpose (§5): a caller reaching for this wants the tunnel and the
    /// kill switch down *now*, not queued behind whatever else holds the
    /// lock.
    pub async fn emergency_disconnect(&self) {
        tracing::error!("emergency disconnect triggered");
        self.monitor_cancel.lock().unwrap().cancel();

        if let Some(backend) = self.backend.lock().await.as_mut() {
            backend.force_disconnect().await;
        }

        self.kill_switch.disable().await;
        self.cleanup_resources().await;
        self.change_state(VPNState::Disconnected, "emergency disconnect");
    }

    async fn cleanup_resources(&self) {
        *self.current_server.lock().unwrap() = None;
        self.stats.lock().unwrap().end_session();
        *self.backend.lock().await = None;
    }

    fn change_state(&self, new_state: VPNState, message: &str) {
        let old_state = {
            let mut state = self.state.lock().unwrap();
            let old = *state;
            *state = new_state;
            old
        };
        tracing::debug!(?old_state, ?new_state, message, "state change");
        for cb in &self.callbacks.lock().unwrap().state_change {
            cb(old_state, new_state, message);
        }
    }

    fn notify_ip_change(&self, ip: Ipv4Addr) {
        for cb in &self.callbacks.lock().unwrap().ip_change {
            cb(ip);
        }
    }

    fn notify_error(&self, message: &str) {
        for cb in &self.callbacks.lock().unwrap().error {
            cb(message);
        }
    }

    fn start_monitoring(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut handle_guard = self.monitor_handle.lock().await;
            if handle_guard.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *self.monitor_cancel.lock().unwrap() = token.clone();
            let controller = Arc::clone(self);
            *handle_guard = Some(tokio::spawn(monitor_loop(controller, token)));
        })
    }

    async fn stop_monitoring(&self) {
        self.monitor_cancel.lock().unwrap().cancel();
        if let Some(handle) = self.monitor_handle.lock().await.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }

    async fn backend_is_up(&self) -> bool {
        match self.backend.lock().await.as_ref() {
            Some(backend) => backend.is_up().await,
            None => false,
        }
    }

    async fn update_connection_info(&self) {
        let backend_stats = match self.backend.lock().await.as_ref() {
            Some(backend) => backend.stats().await,
            None => return,
        };

        let ip = self.public_ip_probe.public_ip(false).await;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.update_bytes(backend_stats.bytes_sent, backend_stats.bytes_received);
            if ip.is_some() {
                stats.public_ip = ip;
            }
            tracing::debug!(
                sent = %bytesize::ByteSize(stats.bytes_sent),
                received = %bytesize::ByteSize(stats.bytes_received),
                "connection stats"
            );
        }

        if let Some(ip) = ip {
            let geo = self.geo_probe.geo_location(ip).await;
            self.stats.lock().unwrap().location = Some(geo.location);
        }
    }

    /// §4.G leak check: public-IP mismatch against the session's recorded
    /// IP, or an unexpected DNS resolver. An IP mismatch names which
    /// `PublicIpProbe` service answered, so the monitor loop can require
    /// two consecutive mismatches from *different* services before acting
    /// (§11 Open Question resolution) — a single flaky echo service can't
    /// manufacture a leak on its own.
    async fn check_for_leak(&self) -> LeakSignal {
        if !self.kill_switch.is_active().await {
            return LeakSignal::None;
        }

        let expected_ip = self.stats.lock().unwrap().public_ip;
        if let Some(expected_ip) = expected_ip {
            if let Some((current_ip, service)) = self.public_ip_probe.public_ip_with_source(true).await {
                if current_ip != expected_ip {
                    tracing::warn!(?current_ip, ?expected_ip, %service, "public ip mismatch");
                    return LeakSignal::Ip(service);
                }
            }
        }

        let expected_dns = self.stats.lock().unwrap().dns_servers.clone();
        let leaking_resolvers = self.dns_leak_probe.probe(&expected_dns).await;
        if !leaking_resolvers.is_empty() {
            tracing::warn!(?leaking_resolvers, "dns leak detected");
            return LeakSignal::Dns;
        }

        LeakSignal::None
    }

    async fn handle_leak(self: &Arc<Self>) {
        tracing::error!("leak detected, enforcing kill switch");
        self.kill_switch.enable(true, true, self.config.union_resolv_conf_dns).await;
        self.attempt_reconnect().await;
    }

    async fn attempt_reconnect(self: &Arc<Self>) {
        // Tear down the dead backend and leave CONNECTED before the first
        // `connect()` call below — connect_inner() rejects any attempt
        // while still in CONNECTED, and this runs inside the monitor
        // loop's own task, so it must not go through disconnect_inner's
        // stop_monitoring (that would await its own task's JoinHandle).
        let exclude = self.current_server.lock().unwrap().as_ref().map(|s| s.id.clone());
        let dns_servers = self.stats.lock().unwrap().dns_servers.clone();

        if let Some(backend) = self.backend.lock().await.as_mut() {
            backend.disconnect().await;
        }
        self.cleanup_resources().await;
        self.change_state(VPNState::Disconnected, "reconnecting");

        let mut backoff = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_secs(1))
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build();

        for attempt in 0..self.config.max_reconnect_attempts {
            tracing::info!(attempt = attempt + 1, max = self.config.max_reconnect_attempts, "reconnection attempt");

            let candidate = self.servers.lock().unwrap().best(exclude.as_deref()).cloned();

            if let Some(server) = candidate {
                match self.connect(server, true, Some(dns_servers.clone())).await {
                    Ok(()) => {
                        tracing::info!("reconnected successfully");
                        return;
                    }
                    Err(err) => tracing::error!(%err, attempt = attempt + 1, "reconnect attempt failed"),
                }
            } else {
                tracing::error!("no suitable server found for reconnect");
            }

            let delay = backoff.next_backoff().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }

        tracing::error!("all reconnection attempts failed");
        self.emergency_disconnect().await;
    }
}

/// Background loop (spec.md §4.G): every `check_interval`, check the
/// backend is still up, refresh stats, and watch for leaks; three
/// consecutive failed checks trigger auto-reconnect (or a terminal ERROR
/// state when disabled). An IP leak must be confirmed by two consecutive
/// mismatches drawn from *different* `PublicIpProbe` services before it's
/// acted on, so one flaky echo service answering wrong twice in a row
/// can't manufacture a leak on its own; a DNS leak needs two consecutive
/// ticks from the (single) DNS leak probe (§11 Open Question resolution).
async fn monitor_loop(controller: Arc<Controller>, cancel: CancellationToken) {
    const MAX_CONSECUTIVE_FAILURES: u32 = 3;
    const LEAK_CONFIRMATION_TICKS: u32 = 2;

    let check_interval = controller.config.check_interval();
    let mut consecutive_failures = 0u32;
    let mut ip_leak_streak = 0u32;
    let mut last_leak_service: Option<&'static str> = None;
    let mut dns_leak_streak = 0u32;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(check_interval) => {}
        }
        if controller.get_state() != VPNState::Connected {
            continue;
        }

        if controller.backend_is_up().await {
            controller.update_connection_info().await;

            if controller.config.check_for_leaks {
                match controller.check_for_leak().await {
                    LeakSignal::Ip(service) => {
                        dns_leak_streak = 0;
                        if last_leak_service == Some(service) {
                            // same flaky service answering wrong twice in a
                            // row isn't two independent observations; stay
                            // at 1 and wait for a different service to agree
                            tracing::debug!(service, "leak signal repeated from the same probe, not yet confirmed");
                            ip_leak_streak = 1;
                        } else {
                            ip_leak_streak += 1;
                            last_leak_service = Some(service);
                        }
                        tracing::warn!(ip_leak_streak, service, "potential ip leak detected");
                        if ip_leak_streak >= LEAK_CONFIRMATION_TICKS {
                            controller.handle_leak().await;
                            ip_leak_streak = 0;
                            last_leak_service = None;
                        }
                    }
                    LeakSignal::Dns => {
                        ip_leak_streak = 0;
                        last_leak_service = None;
                        dns_leak_streak += 1;
                        tracing::warn!(dns_leak_streak, "potential dns leak detected");
                        if dns_leak_streak >= LEAK_CONFIRMATION_TICKS {
                            controller.handle_leak().await;
                            dns_leak_streak = 0;
                        }
                    }
                    LeakSignal::None => {
                        ip_leak_streak = 0;
                        last_leak_service = None;
                        dns_leak_streak = 0;
                    }
                }
            }
            consecutive_failures = 0;
        } else {
            consecutive_failures += 1;
            tracing::warn!(consecutive_failures, "connection check failed");
            if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                if controller.config.auto_reconnect {
                    controller.attempt_reconnect().await;
                } else {
                    controller.change_state(VPNState::Error, "connection lost");
                    break;
                }
                consecutive_failures = 0;
            }
        }
    }
}
