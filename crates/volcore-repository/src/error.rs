use thiserror::Error;

/// Distinguishes a failure the caller should retry (I/O, lock contention)
/// from one it must not (a uniqueness violation), per §4.3's failure
/// model.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("repository I/O failure: {0}")]
    Retryable(String),

    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("serialization failure: {0}")]
    Serialization(String),
}

impl From<redb::Error> for RepositoryError {
    fn from(e: redb::Error) -> Self {
        RepositoryError::Retryable(e.to_string())
    }
}

impl From<redb::DatabaseError> for RepositoryError {
    fn from(e: redb::DatabaseError) -> Self {
        RepositoryError::Retryable(e.to_string())
    }
}

impl From<redb::TransactionError> for RepositoryError {
    fn from(e: redb::TransactionError) -> Self {
        RepositoryError::Retryable(e.to_string())
    }
}

impl From<redb::TableError> for RepositoryError {
    fn from(e: redb::TableError) -> Self {
        RepositoryError::Retryable(e.to_string())
    }
}

impl From<redb::StorageError> for RepositoryError {
    fn from(e: redb::StorageError) -> Self {
        RepositoryError::Retryable(e.to_string())
    }
}

impl From<redb::CommitError> for RepositoryError {
    fn from(e: redb::CommitError) -> Self {
        RepositoryError::Retryable(e.to_string())
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(e: serde_json::Error) -> Self {
        RepositoryError::Serialization(e.to_string())
    }
}

impl From<RepositoryError> for volcore_common::CoreError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::Retryable(msg) => volcore_common::CoreError::Transient(msg),
            RepositoryError::Constraint(msg) => volcore_common::CoreError::Conflict(msg),
            RepositoryError::Serialization(msg) => volcore_common::CoreError::Unrecoverable(msg),
        }
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;
