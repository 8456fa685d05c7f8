//! Well-known filesystem locations used by the kill switch and controller.
//!
//! Paths mirror the ones spec.md names literally (`/tmp/vpn_killswitch_*`,
//! `~/.config/vpn-manager/config.json`) so a crashed process and the next
//! invocation agree on where to look.

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "";
const ORGANIZATION: &str = "";
const APPLICATION: &str = "vpn-manager";

/// In-memory snapshot mirror, read back after a crash (§4.B, §6).
pub const FIREWALL_BACKUP_FILE: &str = "/tmp/vpn_killswitch_backup.json";

/// Kill-switch lifecycle state, written on `enable()` and removed on `disable()` (§4.C, §6).
pub const FIREWALL_STATE_FILE: &str = "/tmp/vpn_killswitch_state.json";

pub fn firewall_backup_path() -> PathBuf {
    PathBuf::from(FIREWALL_BACKUP_FILE)
}

pub fn firewall_state_path() -> PathBuf {
    PathBuf::from(FIREWALL_STATE_FILE)
}

/// `~/.config/vpn-manager/config.json`, or its XDG-equivalent on other platforms.
///
/// Loading this file is the out-of-scope CLI/TUI collaborator's job; this
/// helper only resolves *where* it would live so `config::load` has a
/// sensible default.
pub fn config_path() -> Option<PathBuf> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
        .map(|dirs| dirs.config_dir().join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firewall_paths_match_spec() {
        assert_eq!(firewall_backup_path(), PathBuf::from("/tmp/vpn_killswitch_backup.json"));
        assert_eq!(firewall_state_path(), PathBuf::from("/tmp/vpn_killswitch_state.json"));
    }

    #[test]
    fn config_path_ends_in_vpn_manager() {
        let path = config_path().expect("project dirs resolvable in test environment");
        assert!(path.ends_with("config.json"));
        assert!(path.to_string_lossy().contains("vpn-manager"));
    }
}
