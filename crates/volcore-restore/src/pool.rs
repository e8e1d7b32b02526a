//! NBD device pool for restore mounts.
//!
//! `/dev/nbd0`..`/dev/nbd7` are reserved exclusively for restore; slots 8+
//! belong to other subsystems and are never touched here. Allocation
//! consults the Repository rather than probing the kernel, since "in use"
//! means "has a Restore Mount row", not "the device node exists".

use volcore_repository::Repository;

use crate::error::{RestoreError, RestoreResult};

pub const POOL_SIZE: u32 = 8;

#[must_use]
pub fn pool_devices() -> Vec<String> {
    (0..POOL_SIZE).map(|n| format!("/dev/nbd{n}")).collect()
}

pub fn allocate(repo: &dyn Repository) -> RestoreResult<String> {
    let allocated = repo.allocated_nbd_devices()?;
    pool_devices()
        .into_iter()
        .find(|dev| !allocated.contains(dev))
        .ok_or(RestoreError::PoolExhausted)
}
