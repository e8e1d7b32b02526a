//! Error taxonomy shared across the volume orchestration core.
//!
//! Every component-level error type (cloud client, repository, nbd, core,
//! restore) is a flat `thiserror` enum of its own; `CoreError` is the
//! cross-component taxonomy that the Volume Operations Service and State
//! Recovery reason about when deciding whether a failure is retryable.

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("device correlation failed: {0}")]
    Correlation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("external command failed: {0}")]
    External(#[from] ExternalCommandError),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl CoreError {
    /// Whether State Recovery / the Volume Operations Service should retry
    /// this failure rather than surface it as a terminal Operation error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transient(_) | CoreError::Timeout(_) | CoreError::External(_)
        )
    }
}

/// Failure of an invoked external program (`dmsetup`, `qemu-nbd`, `mount`,
/// `blkid`, ...). Carries enough of the process outcome to log and to
/// distinguish "not installed" from "ran and failed".
#[derive(Debug, Error)]
pub enum ExternalCommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    NonZeroExit {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("{program} timed out after {elapsed:?}")]
    Timeout {
        program: String,
        elapsed: std::time::Duration,
    },

    #[error("failed to parse {program} output: {reason}")]
    Parse { program: String, reason: String },
}
