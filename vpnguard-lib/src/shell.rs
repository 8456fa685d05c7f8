//! Subprocess execution with a hard timeout.
//!
//! spec.md §4.B / §5: "Every subprocess invocation has a hard 5-10s timeout;
//! a timeout is equivalent to failure." Every call into `iptables`, `ip`,
//! `openvpn`, `wg`/`wg-quick` in this crate goes through here so that
//! property holds uniformly instead of being reimplemented per call site.

use std::io;
use std::process::Output;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::error::Elapsed;

pub const ROUTINE_TIMEOUT: Duration = Duration::from_secs(5);
pub const DESTRUCTIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const TUNNEL_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("command timed out")]
    Timeout,
    #[error("command exited with failure status {0:?}: {1}")]
    NonZeroExit(Option<i32>, String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

impl From<Elapsed> for Error {
    fn from(_: Elapsed) -> Self {
        Error::Timeout
    }
}

/// Run `cmd` to completion, bounded by `timeout`. Returns the raw output
/// regardless of exit status; callers that only care about success should
/// use [`run_checked`].
pub async fn output(cmd: &mut Command, timeout: Duration) -> Result<Output, Error> {
    tokio::time::timeout(timeout, cmd.output()).await?.map_err(Error::from)
}

/// Run `cmd`, trim and return stdout on success; log and fail on a nonzero
/// exit or timeout.
pub async fn run_checked(cmd: &mut Command, timeout: Duration) -> Result<String, Error> {
    let out = output(cmd, timeout).await?;
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if out.status.success() {
        if !out.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            tracing::debug!(cmd = ?cmd.as_std(), %stderr, "non-empty stderr on successful command");
        }
        Ok(stdout)
    } else {
        let stderr = String::from_utf8_lossy(&out.stderr).to_string();
        tracing::error!(cmd = ?cmd.as_std(), status = ?out.status.code(), %stderr, "command failed");
        Err(Error::NonZeroExit(out.status.code(), stderr))
    }
}

/// Spawn `cmd`, write `input` to its stdin, then wait for exit — used for
/// `iptables-restore`/`ip6tables-restore`, which read the ruleset on stdin.
pub async fn feed_stdin(cmd: &mut Command, input: &[u8], timeout: Duration) -> Result<Output, Error> {
    let fut = async {
        let mut child = cmd
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).await?;
            // drop closes the pipe so the child sees EOF
        }
        child.wait_with_output().await
    };
    tokio::time::timeout(timeout, fut).await?.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_checked_succeeds_on_zero_exit() {
        let mut cmd = Command::new("true");
        let res = run_checked(&mut cmd, ROUTINE_TIMEOUT).await;
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn run_checked_fails_on_nonzero_exit() {
        let mut cmd = Command::new("false");
        let res = run_checked(&mut cmd, ROUTINE_TIMEOUT).await;
        assert!(matches!(res, Err(Error::NonZeroExit(_, _))));
    }

    #[tokio::test]
    async fn run_checked_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("2");
        let res = run_checked(&mut cmd, Duration::from_millis(50)).await;
        assert!(matches!(res, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn feed_stdin_roundtrips_through_cat() {
        let mut cmd = Command::new("cat");
        let out = feed_stdin(&mut cmd, b"hello", ROUTINE_TIMEOUT).await.unwrap();
        assert_eq!(out.stdout, b"hello");
    }
}
