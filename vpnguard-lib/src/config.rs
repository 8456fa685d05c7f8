//! Controller configuration (spec.md §6, SPEC_FULL §12.3).
//!
//! The original loader versions a TOML schema across migrations; this
//! crate's wire format is the flat JSON object spec.md §6 names
//! literally, so there is nothing to migrate. Loading/writing the file
//! at `~/.config/vpn-manager/config.json` is the CLI/TUI collaborator's
//! job (§1) — this module only defines the shape and a permissive
//! default, and offers `load_str`/`to_json` for that collaborator to use.

use crate::server::Protocol;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

fn default_protocol() -> Protocol {
    Protocol::WireGuard
}

fn default_port() -> u16 {
    1194
}

fn default_true() -> bool {
    true
}

/// §11: widening the DNS allow-list with whatever `/etc/resolv.conf`
/// currently lists is opt-in, never automatic.
fn default_false() -> bool {
    false
}

fn default_dns_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
}

fn default_check_interval() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

/// The eight recognized keys from spec.md §6, plus the §11 DNS-widening
/// opt-in this crate adds to resolve an Open Question.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(default = "default_protocol")]
    pub default_protocol: Protocol,

    #[serde(default = "default_port")]
    pub default_port: u16,

    #[serde(default = "default_true")]
    pub kill_switch_enabled: bool,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<Ipv4Addr>,

    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    #[serde(default = "default_true")]
    pub check_for_leaks: bool,

    /// §11 Open Question resolution: union in `/etc/resolv.conf`
    /// nameservers on `enable()` only when explicitly requested.
    #[serde(default = "default_false")]
    pub union_resolv_conf_dns: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_protocol: default_protocol(),
            default_port: default_port(),
            kill_switch_enabled: default_true(),
            auto_reconnect: default_true(),
            dns_servers: default_dns_servers(),
            check_interval: default_check_interval(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            check_for_leaks: default_true(),
            union_resolv_conf_dns: default_false(),
        }
    }
}

impl Config {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn from_json(text: &str) -> Result<Self, Error> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
