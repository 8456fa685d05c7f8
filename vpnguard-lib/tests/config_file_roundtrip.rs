//! `Config` loaded from an actual file on disk, the way the `vpnguard`
//! binary's `load_config` does it, rather than from an in-memory string
//! (already covered by config.rs's own unit tests).

use rstest::rstest;
use std::io::Write;
use vpnguard_lib::config::Config;

#[test]
fn round_trips_through_a_real_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let cfg = Config { check_interval: 45, max_reconnect_attempts: 7, ..Config::default() };
    write!(file, "{}", cfg.to_json().unwrap()).unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let loaded = Config::from_json(&text).unwrap();

    assert_eq!(loaded.check_interval, 45);
    assert_eq!(loaded.max_reconnect_attempts, 7);
}

#[rstest]
#[case("{}", 30, 3)]
#[case(r#"{"check_interval": 5}"#, 5, 3)]
#[case(r#"{"max_reconnect_attempts": 0}"#, 30, 0)]
#[case(r#"{"check_interval": 120, "max_reconnect_attempts": 10}"#, 120, 10)]
fn partial_json_files_fill_in_missing_keys_from_defaults(#[case] contents: &str, #[case] expected_interval: u64, #[case] expected_attempts: u32) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let cfg = Config::from_json(&text).unwrap();

    assert_eq!(cfg.check_interval, expected_interval);
    assert_eq!(cfg.max_reconnect_attempts, expected_attempts);
}

#[test]
fn malformed_json_file_is_rejected_not_silently_defaulted() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "not valid json").unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    assert!(Config::from_json(&text).is_err());
}
