//! Typed persistence for Operations, Device Mappings, NBD Exports, Backup
//! Contexts, Backup Disks, Restore Mounts, and Volume Snapshot Records.

pub mod error;
pub mod redb_store;
pub mod traits;

pub use error::{RepoResult, RepositoryError};
pub use redb_store::RedbRepository;
pub use traits::Repository;
