//! Packet-Filter Driver (spec.md §4.B): snapshot, flush, apply, restore,
//! emergency-open, verify. Grounded on the original's
//! `_flush_rules`/`_apply_ipv4_rules`/`_apply_ipv6_rules`/`_verify_rules`/
//! `_emergency_recovery`, and on the Rust shape of
//! `Iptables::apply_rules`/`backup`/`restore` in the ProtonVPN-CLI
//! reference (argv-per-rule, sequential application, no shell quoting).

use async_trait::async_trait;
use tokio::process::Command;

use super::policy::KillSwitchPolicy;
use super::snapshot::{FirewallSnapshot, Table, TABLES};
use super::Error;
use crate::shell::{self, DESTRUCTIVE_TIMEOUT, ROUTINE_TIMEOUT};

const IPV6_SYSCTLS: [&str; 2] = ["/proc/sys/net/ipv6/conf/all/disable_ipv6", "/proc/sys/net/ipv6/conf/default/disable_ipv6"];

/// Seam between the Driver and the subprocesses it shells out to,
/// grounded on the `CommandRunner`/`WgRunner` injection pattern used
/// elsewhere in the retrieval pack for the same reason: §8's property
/// tests (invariant 2, invariant 6, S2, S3) exercise rollback and
/// snapshot/restore round-trips without a live firewall or root.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, bin: &str, args: &[&str]) -> Result<(), shell::Error>;
    async fn run_output(&self, bin: &str, args: &[&str]) -> Result<String, shell::Error>;
    async fn restore_table(&self, bin: &str, table_flag: &str, rules: &str) -> bool;
}

/// The real runner: shells out via [`crate::shell`], same as the
/// pre-refactor free functions did directly.
#[derive(Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, bin: &str, args: &[&str]) -> Result<(), shell::Error> {
        let mut cmd = Command::new(bin);
        cmd.args(args);
        shell::run_checked(&mut cmd, ROUTINE_TIMEOUT).await.map(|_| ())
    }

    async fn run_output(&self, bin: &str, args: &[&str]) -> Result<String, shell::Error> {
        let mut cmd = Command::new(bin);
        cmd.args(args);
        shell::run_checked(&mut cmd, ROUTINE_TIMEOUT).await
    }

    async fn restore_table(&self, bin: &str, table_flag: &str, rules: &str) -> bool {
        let mut cmd = Command::new(bin);
        cmd.arg("-T").arg(table_flag);
        match shell::feed_stdin(&mut cmd, rules.as_bytes(), DESTRUCTIVE_TIMEOUT).await {
            Ok(out) if out.status.success() => true,
            Ok(out) => {
                tracing::warn!(status = ?out.status.code(), %bin, %table_flag, "restore exited nonzero");
                false
            }
            Err(err) => {
                tracing::warn!(%err, %bin, %table_flag, "restore command failed");
                false
            }
        }
    }
}

/// §4.B `snapshot()`.
pub async fn snapshot(runner: &dyn CommandRunner) -> Result<FirewallSnapshot, Error> {
    FirewallSnapshot::capture(runner).await
}

/// §4.B `flush()`: sets default policies to ACCEPT, flushes and deletes
/// user chains across all three tables for both families. Idempotent —
/// every failure is swallowed, matching the original's `_flush_rules`
/// (each command wrapped in its own try/except).
pub async fn flush(runner: &dyn CommandRunner) {
    let flush_commands: &[(&str, &[&str])] = &[
        ("iptables", &["-F"]),
        ("iptables", &["-t", "nat", "-F"]),
        ("iptables", &["-t", "mangle", "-F"]),
        ("iptables", &["-X"]),
        ("iptables", &["-t", "nat", "-X"]),
        ("iptables", &["-t", "mangle", "-X"]),
        ("iptables", &["-P", "INPUT", "ACCEPT"]),
        ("iptables", &["-P", "FORWARD", "ACCEPT"]),
        ("iptables", &["-P", "OUTPUT", "ACCEPT"]),
        ("ip6tables", &["-F"]),
        ("ip6tables", &["-t", "nat", "-F"]),
        ("ip6tables", &["-t", "mangle", "-F"]),
        ("ip6tables", &["-X"]),
        ("ip6tables", &["-t", "nat", "-X"]),
        ("ip6tables", &["-t", "mangle", "-X"]),
        ("ip6tables", &["-P", "INPUT", "ACCEPT"]),
        ("ip6tables", &["-P", "FORWARD", "ACCEPT"]),
        ("ip6tables", &["-P", "OUTPUT", "ACCEPT"]),
    ];

    for (bin, args) in flush_commands {
        if let Err(err) = runner.run(bin, args).await {
            tracing::debug!(%err, ?args, "flush command failed, continuing");
        }
    }
}

/// §4.B `apply(policy)`: programs the ruleset of §4.C step 5. Rules are
/// added sequentially; on the first failure the Driver immediately
/// attempts `restore(snapshot)` and returns failure.
pub async fn apply(runner: &dyn CommandRunner, policy: &KillSwitchPolicy, snapshot: &FirewallSnapshot) -> Result<(), Error> {
    for rule in policy.ipv4_rules() {
        let args: Vec<&str> = rule.args.iter().map(String::as_str).collect();
        if let Err(err) = runner.run("iptables", &args).await {
            tracing::error!(%err, ?args, "iptables rule application failed, rolling back");
            restore(runner, snapshot).await;
            return Err(Error::Apply(format!("{args:?}: {err}")));
        }
    }

    for chain in ["INPUT", "FORWARD", "OUTPUT"] {
        if let Err(err) = runner.run("iptables", &["-P", chain, "DROP"]).await {
            tracing::error!(%err, %chain, "failed to set default DROP policy, rolling back");
            restore(runner, snapshot).await;
            return Err(Error::Apply(format!("-P {chain} DROP: {err}")));
        }
    }

    apply_ipv6(runner).await;
    Ok(())
}

/// §4.C step 5 IPv6 half: disables IPv6 at the kernel level, then drops
/// all policies and flushes ip6tables. A sysctl write failure is a
/// warning, not fatal, provided the ip6tables DROP policies succeed.
async fn apply_ipv6(runner: &dyn CommandRunner) {
    for setting in IPV6_SYSCTLS {
        if let Err(err) = tokio::fs::write(setting, b"1").await {
            tracing::warn!(%err, %setting, "could not disable IPv6 via sysctl");
        }
    }

    let block6: &[&[&str]] = &[&["-P", "INPUT", "DROP"], &["-P", "FORWARD", "DROP"], &["-P", "OUTPUT", "DROP"], &["-F"], &["-X"]];
    for args in block6 {
        if let Err(err) = runner.run("ip6tables", args).await {
            tracing::warn!(%err, ?args, "ip6tables command failed during apply");
        }
    }
}

/// §4.B `restore(snapshot)`: feeds the blob to `iptables-restore -T
/// <table>` / `ip6tables-restore -T <table>` per table. If the memory
/// copy fails, falls back to the on-disk crash-recovery file; if that
/// also fails, invokes `emergency_open()`.
pub async fn restore(runner: &dyn CommandRunner, snapshot: &FirewallSnapshot) {
    if restore_from(runner, snapshot).await {
        return;
    }

    tracing::warn!("in-memory firewall restore failed, trying crash-recovery file");
    match FirewallSnapshot::read_backup_file().await {
        Ok(from_disk) if restore_from(runner, &from_disk).await => {}
        _ => {
            tracing::error!("firewall restore failed from memory and disk, forcing emergency open");
            emergency_open(runner).await;
        }
    }
}

async fn restore_from(runner: &dyn CommandRunner, snapshot: &FirewallSnapshot) -> bool {
    let mut any_succeeded = false;
    for table in TABLES {
        if let Some(rules) = snapshot.iptables.get(&table) {
            if runner.restore_table("iptables-restore", table_flag(table), rules).await {
                any_succeeded = true;
            }
        }
        if let Some(rules) = snapshot.ip6tables.get(&table) {
            if runner.restore_table("ip6tables-restore", table_flag(table), rules).await {
                any_succeeded = true;
            }
        }
    }
    any_succeeded
}

fn table_flag(table: Table) -> &'static str {
    match table {
        Table::Filter => "filter",
        Table::Nat => "nat",
        Table::Mangle => "mangle",
    }
}

/// §4.B `emergency_open()`: last-resort recovery. Never blocks on
/// error, swallows failures, logs critically — mirrors the original's
/// `_emergency_recovery`.
pub async fn emergency_open(runner: &dyn CommandRunner) {
    tracing::error!("performing emergency firewall recovery: opening all traffic");

    let emergency_cmds: &[(&str, &[&str])] = &[
        ("iptables", &["-P", "INPUT", "ACCEPT"]),
        ("iptables", &["-P", "FORWARD", "ACCEPT"]),
        ("iptables", &["-P", "OUTPUT", "ACCEPT"]),
        ("iptables", &["-F"]),
        ("iptables", &["-X"]),
        ("iptables", &["-t", "nat", "-F"]),
        ("iptables", &["-t", "nat", "-X"]),
        ("iptables", &["-t", "mangle", "-F"]),
        ("iptables", &["-t", "mangle", "-X"]),
        ("ip6tables", &["-P", "INPUT", "ACCEPT"]),
        ("ip6tables", &["-P", "FORWARD", "ACCEPT"]),
        ("ip6tables", &["-P", "OUTPUT", "ACCEPT"]),
        ("ip6tables", &["-F"]),
        ("ip6tables", &["-X"]),
    ];

    for (bin, args) in emergency_cmds {
        if let Err(err) = runner.run(bin, args).await {
            tracing::debug!(%err, ?args, "emergency recovery command failed, continuing");
        }
    }

    for setting in IPV6_SYSCTLS {
        if let Err(err) = tokio::fs::write(setting, b"0").await {
            tracing::debug!(%err, %setting, "could not re-enable IPv6 via sysctl");
        }
    }

    tracing::warn!("emergency firewall recovery completed");
}

/// Pure parse of `iptables -L -n` output, split out from [`verify`] so
/// it can be unit tested without a live firewall.
fn verify_output(output: &str, primary_interface: &str) -> bool {
    let lower = output.to_lowercase();
    if lower.matches("policy drop").count() < 3 {
        tracing::error!("default DROP policy not found on all three chains");
        return false;
    }

    let iface_pattern = primary_interface.trim_end_matches('+');
    if !iface_pattern.is_empty() && !lower.contains(&iface_pattern.to_lowercase()) {
        tracing::error!(%primary_interface, "VPN interface rules not found in any ACCEPT rule");
        return false;
    }

    true
}

/// §4.B `verify()`: parses `iptables -L -n`; true iff all three default
/// IPv4 policies read DROP and the primary tunnel interface pattern
/// appears in at least one ACCEPT rule.
pub async fn verify(runner: &dyn CommandRunner, primary_interface: &str) -> bool {
    match runner.run_output("iptables", &["-L", "-n"]).await {
        Ok(out) => verify_output(&out, primary_interface),
        Err(err) => {
            tracing::error!(%err, "rule verification failed to run iptables -L -n");
            false
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn verify_requires_three_drop_policies() {
        let two_drops = "Chain INPUT (policy DROP)\nChain FORWARD (policy DROP)\nChain OUTPUT (policy ACCEPT)\n";
        assert!(!verify_output(two_drops, "tun+"));
        let three_drops = "Chain INPUT (policy DROP)\nChain FORWARD (policy DROP)\nChain OUTPUT (policy DROP)\nACCEPT all -- 0.0.0.0/0 0.0.0.0/0 tun0\n";
        assert!(verify_output(three_drops, "tun+"));
    }

    #[test]
    fn fails_without_interface_rule() {
        let three_drops = "Chain INPUT (policy DROP)\nChain FORWARD (policy DROP)\nChain OUTPUT (policy DROP)\n";
        assert!(!verify_output(three_drops, "tun+"));
    }

    /// Records every invocation. Can be told to fail either the Nth
    /// `run()` call (1-indexed, matching spec.md §8 S3's "inject failure
    /// on the 7th apply command") or the first call matching a predicate
    /// — the latter is what callers further up the stack (e.g. the
    /// Manager-level `enable()` test) use, since their call count also
    /// includes the preceding snapshot/flush calls. `restore_table`
    /// always records its stdin payload per `(bin, table_flag)` so a
    /// round-trip test can assert the exact ruleset text a table was
    /// restored with.
    #[derive(Default)]
    pub(crate) struct FakeRunner {
        calls: StdMutex<Vec<(String, Vec<String>)>>,
        restores: StdMutex<HashMap<(String, String), String>>,
        fail_run_at: Option<usize>,
        fail_when: Option<fn(&str, &[&str]) -> bool>,
    }

    impl FakeRunner {
        pub(crate) fn new() -> Self {
            FakeRunner::default()
        }

        pub(crate) fn failing_at(call_number: usize) -> Self {
            FakeRunner { fail_run_at: Some(call_number), ..Default::default() }
        }

        pub(crate) fn failing_when(predicate: fn(&str, &[&str]) -> bool) -> Self {
            FakeRunner { fail_when: Some(predicate), ..Default::default() }
        }

        pub(crate) fn run_calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().expect("fake runner mutex poisoned").clone()
        }

        pub(crate) fn restored_rules(&self, bin: &str, table_flag: &str) -> Option<String> {
            self.restores.lock().expect("fake runner mutex poisoned").get(&(bin.to_string(), table_flag.to_string())).cloned()
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, bin: &str, args: &[&str]) -> Result<(), shell::Error> {
            let mut calls = self.calls.lock().expect("fake runner mutex poisoned");
            calls.push((bin.to_string(), args.iter().map(|s| s.to_string()).collect()));
            let call_number = calls.len();
            drop(calls);

            if self.fail_run_at == Some(call_number) || self.fail_when.is_some_and(|pred| pred(bin, args)) {
                return Err(shell::Error::NonZeroExit(Some(1), "fake runner injected failure".into()));
            }
            Ok(())
        }

        async fn run_output(&self, bin: &str, args: &[&str]) -> Result<String, shell::Error> {
            self.run(bin, args).await?;
            // `iptables -L -n` needs a plausible listing so callers
            // exercising `verify()` against this fake see a pass; every
            // other output-producing call (iptables-save) is content-
            // agnostic for the tests that use this fake.
            if bin == "iptables" && args.first().copied() == Some("-L") && args.get(1).copied() == Some("-n") {
                return Ok("Chain INPUT (policy DROP)\nChain FORWARD (policy DROP)\nChain OUTPUT (policy DROP)\nACCEPT all -- 0.0.0.0/0 0.0.0.0/0 tun0\n".to_string());
            }
            Ok(String::new())
        }

        async fn restore_table(&self, bin: &str, table_flag: &str, rules: &str) -> bool {
            self.restores.lock().expect("fake runner mutex poisoned").insert((bin.to_string(), table_flag.to_string()), rules.to_string());
            true
        }
    }

    fn sample_policy() -> KillSwitchPolicy {
        let mut policy = KillSwitchPolicy { primary_interface: "tun0".into(), ..Default::default() };
        policy.add_vpn_server("198.51.100.10".parse().unwrap(), crate::server::Protocol::Udp, 1194);
        policy
    }

    fn sample_snapshot() -> FirewallSnapshot {
        let mut snap = FirewallSnapshot { timestamp: 1.0, ..Default::default() };
        snap.iptables.insert(Table::Filter, "*filter\n:INPUT ACCEPT\nCOMMIT\n".into());
        snap.iptables.insert(Table::Nat, "*nat\nCOMMIT\n".into());
        snap.iptables.insert(Table::Mangle, "*mangle\nCOMMIT\n".into());
        snap.ip6tables.insert(Table::Filter, "*filter\n:INPUT ACCEPT\nCOMMIT\n".into());
        snap
    }

    /// Invariant 2 / S3: a failure partway through `apply()` rolls back
    /// to the entry snapshot instead of leaving a half-applied ruleset.
    #[tokio::test]
    async fn apply_failure_rolls_back_to_the_entry_snapshot() {
        let policy = sample_policy();
        let snapshot = sample_snapshot();
        let rule_count = policy.ipv4_rules().len();
        // fail on the first of the three trailing `-P <chain> DROP` calls.
        let runner = FakeRunner::failing_at(rule_count + 1);

        let result = apply(&runner, &policy, &snapshot).await;

        assert!(result.is_err());
        assert_eq!(runner.restored_rules("iptables-restore", "filter").as_deref(), snapshot.iptables.get(&Table::Filter).map(String::as_str));
        assert_eq!(runner.restored_rules("iptables-restore", "nat").as_deref(), snapshot.iptables.get(&Table::Nat).map(String::as_str));
        assert_eq!(runner.restored_rules("ip6tables-restore", "filter").as_deref(), snapshot.ip6tables.get(&Table::Filter).map(String::as_str));
    }

    /// Invariant 6: snapshot → flush → apply → restore ends with every
    /// table fed back exactly the text the snapshot carried for it.
    #[tokio::test]
    async fn round_trip_restores_every_captured_table_unchanged() {
        let policy = sample_policy();
        let snapshot = sample_snapshot();
        let runner = FakeRunner::new();

        flush(&runner).await;
        apply(&runner, &policy, &snapshot).await.expect("fake runner never fails here");
        restore(&runner, &snapshot).await;

        for (table, flag) in [(Table::Filter, "filter"), (Table::Nat, "nat"), (Table::Mangle, "mangle")] {
            if let Some(expected) = snapshot.iptables.get(&table) {
                assert_eq!(runner.restored_rules("iptables-restore", flag).as_deref(), Some(expected.as_str()));
            }
        }
        assert_eq!(runner.restored_rules("ip6tables-restore", "filter").as_deref(), snapshot.ip6tables.get(&Table::Filter).map(String::as_str));
    }

    #[tokio::test]
    async fn apply_success_sets_default_drop_on_all_three_chains() {
        let policy = sample_policy();
        let snapshot = sample_snapshot();
        let runner = FakeRunner::new();

        apply(&runner, &policy, &snapshot).await.expect("fake runner never fails here");

        let drop_calls: Vec<_> = runner
            .run_calls()
            .into_iter()
            .filter(|(bin, args)| bin == "iptables" && args.first().map(String::as_str) == Some("-P") && args.last().map(String::as_str) == Some("DROP"))
            .collect();
        assert_eq!(drop_calls.len(), 3);
    }
}
