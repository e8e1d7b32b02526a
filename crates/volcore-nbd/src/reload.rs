//! Reload coalescing.
//!
//! A single background task reads from an mpsc channel and debounces
//! bursts of fragment mutations into one `kill -HUP` against the running
//! `nbd-server` process, since no signal crate sits in the dependency set
//! and driving this through `tokio::process::Command` matches how every
//! other external tool here is invoked.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use volcore_common::process;

const RELOAD_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ReloadCoalescer {
    tx: mpsc::Sender<()>,
    _task: JoinHandle<()>,
}

impl ReloadCoalescer {
    /// `pidfile` holds the running `nbd-server`'s PID. `debounce_window`
    /// is how long to wait after the first queued request before firing,
    /// absorbing any further requests that arrive in the meantime.
    #[must_use]
    pub fn start(pidfile: PathBuf, debounce_window: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(64);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(debounce_window).await;
                while rx.try_recv().is_ok() {}
                if let Err(e) = Self::send_hup(&pidfile).await {
                    tracing::warn!(error = %e, "nbd reload failed");
                }
            }
        });
        Self { tx, _task: task }
    }

    /// Queue a reload. Non-blocking; if the channel is saturated the
    /// request is dropped since a reload is already pending.
    pub fn request_reload(&self) {
        let _ = self.tx.try_send(());
    }

    async fn send_hup(pidfile: &PathBuf) -> Result<(), volcore_common::ExternalCommandError> {
        let pid = tokio::fs::read_to_string(pidfile)
            .await
            .map_err(|e| volcore_common::ExternalCommandError::Spawn {
                program: "kill".to_string(),
                source: e,
            })?;
        let pid = pid.trim();
        process::run_checked("kill", &["-HUP", pid], RELOAD_TIMEOUT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_reload_does_not_block_when_saturated() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("nbd.pid");
        tokio::fs::write(&pidfile, "999999").await.unwrap();
        let coalescer = ReloadCoalescer::start(pidfile, Duration::from_millis(10));
        for _ in 0..100 {
            coalescer.request_reload();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
