use thiserror::Error;

#[derive(Debug, Error)]
pub enum NbdError {
    #[error("fragment write failed: {0}")]
    Fragment(#[source] std::io::Error),

    #[error("reload failed: {0}")]
    Reload(#[source] volcore_common::ExternalCommandError),

    #[error("negotiation verification failed after retries: {0}")]
    VerificationFailed(String),
}

impl From<NbdError> for volcore_common::CoreError {
    fn from(e: NbdError) -> Self {
        match e {
            NbdError::Fragment(io) => volcore_common::CoreError::Transient(io.to_string()),
            NbdError::Reload(cmd) => volcore_common::CoreError::External(cmd),
            NbdError::VerificationFailed(msg) => volcore_common::CoreError::Transient(msg),
        }
    }
}

pub type NbdResult<T> = Result<T, NbdError>;
