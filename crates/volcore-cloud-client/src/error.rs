use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("cloud authentication failed: {0}")]
    Authentication(String),

    #[error("cloud resource not found: {0}")]
    NotFound(String),

    #[error("cloud precondition failed: {0}")]
    Precondition(String),

    #[error("transient cloud failure: {0}")]
    Transient(String),

    #[error("cloud call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl CloudError {
    /// Mirrors `volcore_common::CoreError::is_retryable` at the cloud-call
    /// boundary: only failures that might succeed on a fresh attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Transient(_) | CloudError::Timeout(_))
    }
}

impl From<CloudError> for volcore_common::CoreError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::Authentication(msg) => volcore_common::CoreError::Unrecoverable(msg),
            CloudError::NotFound(msg) => volcore_common::CoreError::NotFound(msg),
            CloudError::Precondition(msg) => volcore_common::CoreError::Precondition(msg),
            CloudError::Transient(msg) => volcore_common::CoreError::Transient(msg),
            CloudError::Timeout(d) => volcore_common::CoreError::Timeout(d),
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;
