//! Packet-Filter Driver (spec.md §4.B).

pub mod driver;
pub mod policy;
pub mod snapshot;

pub use driver::{CommandRunner, SystemRunner};
pub use policy::{KillSwitchPolicy, Rule, VpnEndpoint};
pub use snapshot::{FirewallSnapshot, Table};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("firewall snapshot failed: {0}")]
    Snapshot(String),
    #[error("firewall rule application failed: {0}")]
    Apply(String),
}
