//! Ambient logging setup (SPEC_FULL §12.1).
//!
//! Every critical-path event the spec calls out — emergency recovery,
//! apply/restore failures, leak detection — goes through `tracing` so a
//! collaborator (daemon, CLI) can route it anywhere without this crate
//! knowing about files, journald, or a TTY.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_LOG_FILTER: &str = "info";
const ENV_VAR_LOG_FILTER: &str = "VPNGUARD_LOG";

/// Installs a global `tracing` subscriber writing structured logs to
/// stderr. Safe to call once per process; a second call is a no-op error
/// that callers should ignore (tests call this from many threads).
pub fn init() {
    let filter = std::env::var(ENV_VAR_LOG_FILTER)
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}
