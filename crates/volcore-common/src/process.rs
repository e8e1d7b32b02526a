//! Shared external-process invocation.
//!
//! The Persistent-Name Layer, the Restore Mount Manager, and the NBD
//! verification path all shell out to system tools (`dmsetup`, `blockdev`,
//! `qemu-nbd`, `mount`, `umount`, `blkid`). This is an async generalization
//! of the `Command::new(...).output()` pattern used for `smartctl` in the
//! storage layer, with a timeout and a uniform error type so callers don't
//! each re-derive "what does failure mean here".

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::ExternalCommandError;

/// Run `program` with `args`, waiting up to `timeout_dur` for it to exit.
/// Returns stdout as a `String` on success (status 0).
pub async fn run(
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
) -> Result<String, ExternalCommandError> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    let output = timeout(timeout_dur, cmd.output())
        .await
        .map_err(|_| ExternalCommandError::Timeout {
            program: program.to_string(),
            elapsed: timeout_dur,
        })?
        .map_err(|source| ExternalCommandError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ExternalCommandError::NonZeroExit {
            program: program.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Like [`run`], but success is judged only by exit status — stdout/stderr
/// are discarded. Used for commands like `dmsetup resume` whose output
/// carries no information on success.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
) -> Result<(), ExternalCommandError> {
    run(program, args, timeout_dur).await.map(|_| ())
}

/// Whether `program` is callable on this host, determined the same way
/// `SmartMonitor::is_available` checks for `smartctl`: by invoking its
/// version flag and checking the exit status.
pub async fn is_available(program: &str, version_flag: &str) -> bool {
    Command::new(program)
        .arg(version_flag)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout() {
        let out = run("echo", &["hello"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn run_reports_non_zero_exit() {
        let err = run("false", &[], Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ExternalCommandError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn run_reports_missing_program() {
        let err = run("volcore-definitely-not-a-real-binary", &[], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ExternalCommandError::Spawn { .. }));
    }
}
