use thiserror::Error;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("backup disk {0} not found")]
    DiskNotFound(u64),

    #[error("backup disk {0} is not ready for restore (must be completed with a qcow2 image)")]
    DiskNotReady(u64),

    #[error("no free nbd device in the restore pool")]
    PoolExhausted,

    #[error("mount path escapes the configured mount root: {0}")]
    Containment(String),

    #[error("device node {0} did not appear before the deadline")]
    DeviceNotReady(String),

    #[error("external command failed: {0}")]
    External(#[from] volcore_common::ExternalCommandError),

    #[error("repository failure: {0}")]
    Repository(#[from] volcore_repository::RepositoryError),
}

impl From<RestoreError> for volcore_common::CoreError {
    fn from(e: RestoreError) -> Self {
        match e {
            RestoreError::DiskNotFound(id) => volcore_common::CoreError::NotFound(format!("backup disk {id}")),
            RestoreError::DiskNotReady(id) => {
                volcore_common::CoreError::Precondition(format!("backup disk {id} not ready"))
            }
            RestoreError::PoolExhausted => volcore_common::CoreError::Resource("restore nbd pool exhausted".into()),
            RestoreError::Containment(msg) => volcore_common::CoreError::Unrecoverable(msg),
            RestoreError::DeviceNotReady(dev) => {
                volcore_common::CoreError::Transient(format!("device node {dev} did not appear before the deadline"))
            }
            RestoreError::External(e) => volcore_common::CoreError::External(e),
            RestoreError::Repository(e) => e.into(),
        }
    }
}

pub type RestoreResult<T> = Result<T, RestoreError>;
