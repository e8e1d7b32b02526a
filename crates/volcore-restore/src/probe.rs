//! Filesystem-type probing for a just-connected NBD device.
//!
//! `qemu-nbd` exposes whatever partitions the qcow2 image contains as
//! `/dev/nbdNpM` nodes; which filesystem lives on the partition we're about
//! to mount is discovered with `blkid`, not assumed.

use std::time::Duration;

use volcore_common::process;

use crate::error::RestoreResult;

const BLKID_TIMEOUT: Duration = Duration::from_secs(5);

/// Returns `None` when `blkid` can't classify the device (e.g. an empty or
/// unformatted partition) rather than treating that as an error — the mount
/// itself will fail with a clearer message if the type genuinely matters.
pub async fn filesystem_type(device: &str) -> RestoreResult<Option<String>> {
    match process::run("blkid", &["-o", "value", "-s", "TYPE", device], BLKID_TIMEOUT).await {
        Ok(out) => {
            let fs = out.trim();
            Ok(if fs.is_empty() { None } else { Some(fs.to_string()) })
        }
        Err(volcore_common::ExternalCommandError::NonZeroExit { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
