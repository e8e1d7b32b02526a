//! File-Level Restore Mount Manager — mounts a single backup disk's qcow2
//! image read-only via NBD so an operator can browse its files without a
//! full volume restore.

pub mod error;
pub mod manager;
pub mod mount_root;
pub mod pool;
pub mod probe;

pub use error::{RestoreError, RestoreResult};
pub use manager::{RestoreMountManager, RestoreMountManagerConfig};
pub use mount_root::MountRoot;
