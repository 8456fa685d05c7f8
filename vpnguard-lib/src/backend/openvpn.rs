//! OpenVPN backend (spec.md §4.D). Grounded on the original's
//! `OpenVPNClient`: a subprocess is launched, its combined stdout/stderr
//! is monitored line-by-line on a background task, and a handful of
//! substring/regex patterns turn that stream into connection state and
//! stats (§9 "keep pattern matches tolerant").

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{Backend, BackendStats, Error};
use crate::server::{Credentials, VPNServer};
use crate::shell::TUNNEL_ESTABLISH_TIMEOUT;

#[derive(Default)]
struct MonitorState {
    up: bool,
    failed: bool,
    bytes_sent: u64,
    bytes_received: u64,
    tunnel_ip: Option<Ipv4Addr>,
}

pub struct OpenVpnBackend {
    binary: String,
    child: Option<Child>,
    config_file: Option<PathBuf>,
    auth_file: Option<PathBuf>,
    state: Arc<Mutex<MonitorState>>,
    dns_servers: Vec<Ipv4Addr>,
    credentials: Option<Credentials>,
}

impl Default for OpenVpnBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenVpnBackend {
    pub fn new() -> Self {
        OpenVpnBackend {
            binary: "openvpn".into(),
            child: None,
            config_file: None,
            auth_file: None,
            state: Arc::new(Mutex::new(MonitorState::default())),
            dns_servers: Vec::new(),
            credentials: None,
        }
    }

    fn render_config(&self, server: &VPNServer) -> String {
        let dns_lines: String =
            if self.dns_servers.is_empty() { "dhcp-option DNS 1.1.1.1\ndhcp-option DNS 8.8.8.8\n".to_string() } else { self.dns_servers.iter().map(|d| format!("dhcp-option DNS {d}\n")).collect() };

        format!(
            "client\n\
             dev tun\n\
             proto {proto}\n\
             remote {host} {port}\n\
             resolv-retry infinite\n\
             nobind\n\
             persist-key\n\
             persist-tun\n\
             remote-cert-tls server\n\
             cipher AES-256-GCM\n\
             auth SHA256\n\
             verb 3\n\
             redirect-gateway def1\n\
             block-outside-dns\n\
             {dns_lines}\
             keepalive 10 30\n",
            proto = server.protocol,
            host = server.hostname,
            port = server.port,
        )
    }

    async fn write_secret_file(path: &std::path::Path, contents: &[u8]) -> std::io::Result<()> {
        tokio::fs::write(path, contents).await?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
    }

    async fn cleanup_temp_files(&mut self) {
        for path in [self.config_file.take(), self.auth_file.take()] {
            if let Some(path) = path {
                let _ = tokio::fs::remove_file(path).await;
            }
        }
    }
}

fn stats_re() -> &'static (Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"TCP/UDP read bytes,(\d+)").expect("static regex is valid"),
            Regex::new(r"TCP/UDP write bytes,(\d+)").expect("static regex is valid"),
            Regex::new(r"ifconfig.*?(\d+\.\d+\.\d+\.\d+)").expect("static regex is valid"),
        )
    })
}

/// Mutates `state` from a single line of OpenVPN output. Split out from
/// the monitor task so the recognized-pattern logic (§4.D) is directly
/// unit testable.
fn observe_line(state: &mut MonitorState, line: &str) {
    if line.contains("Initialization Sequence Completed") {
        state.up = true;
        tracing::info!("openvpn connection established");
        return;
    }
    if line.contains("AUTH_FAILED") || line.to_uppercase().contains("ERROR") {
        state.failed = true;
        tracing::error!(%line, "openvpn reported an error");
        return;
    }

    let (read_re, write_re, ip_re) = stats_re();
    if let Some(caps) = read_re.captures(line) {
        if let Ok(n) = caps[1].parse() {
            state.bytes_received = n;
        }
    }
    if let Some(caps) = write_re.captures(line) {
        if let Ok(n) = caps[1].parse() {
            state.bytes_sent = n;
        }
    }
    if let Some(caps) = ip_re.captures(line) {
        if let Ok(ip) = caps[1].parse() {
            state.tunnel_ip = Some(ip);
        }
    }

    tracing::debug!(%line, "openvpn output");
}

#[async_trait]
impl Backend for OpenVpnBackend {
    async fn connect(&mut self, server: &VPNServer) -> Result<bool, Error> {
        let config_file = std::env::temp_dir().join(format!("vpnguard-{}.ovpn", server.id));
        OpenVpnBackend::write_secret_file(&config_file, self.render_config(server).as_bytes()).await?;
        self.config_file = Some(config_file.clone());

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--config")
            .arg(&config_file)
            .arg("--auth-nocache")
            .arg("--connect-retry")
            .arg("5")
            .arg("--connect-retry-max")
            .arg("3")
            .arg("--explicit-exit-notify")
            .arg("2");

        if let Some(credentials) = &self.credentials {
            let auth_file = std::env::temp_dir().join(format!("vpnguard-{}.auth", server.id));
            let contents = format!("{}\n{}\n", credentials.username, credentials.password);
            OpenVpnBackend::write_secret_file(&auth_file, contents.as_bytes()).await?;
            cmd.arg("--auth-user-pass").arg(&auth_file);
            self.auth_file = Some(auth_file);
        }

        cmd.stdout(std::process::Stdio::piped()).stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| Error::StartFailed(e.to_string()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let state = self.state.clone();

        if let Some(stdout) = stdout {
            let state = state.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    observe_line(&mut *state.lock().await, &line);
                }
            });
        }
        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    observe_line(&mut *state.lock().await, &line);
                }
            });
        }

        self.child = Some(child);

        let deadline = tokio::time::Instant::now() + TUNNEL_ESTABLISH_TIMEOUT;
        loop {
            {
                let s = self.state.lock().await;
                if s.up {
                    return Ok(true);
                }
                if s.failed {
                    return Err(Error::AuthFailed);
                }
            }
            if let Some(child) = &mut self.child {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::error!(?status, "openvpn process exited before establishing tunnel");
                    return Ok(false);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::error!("openvpn connection timed out");
                return Err(Error::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
            match tokio::time::timeout(Duration::from_secs(10), child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!("openvpn did not exit after SIGTERM, sending SIGKILL");
                    let _ = child.kill().await;
                }
            }
        }
        self.cleanup_temp_files().await;
        *self.state.lock().await = MonitorState::default();
    }

    async fn force_disconnect(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
        self.cleanup_temp_files().await;
        *self.state.lock().await = MonitorState::default();
    }

    async fn is_up(&self) -> bool {
        self.state.lock().await.up
    }

    async fn stats(&self) -> BackendStats {
        let s = self.state.lock().await;
        BackendStats { bytes_sent: s.bytes_sent, bytes_received: s.bytes_received, tunnel_ip: s.tunnel_ip }
    }

    fn set_dns_servers(&mut self, servers: Vec<Ipv4Addr>) {
        self.dns_servers = servers;
    }

    fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }
}
