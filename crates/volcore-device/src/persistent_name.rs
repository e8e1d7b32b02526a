//! Persistent-Name Layer
//!
//! Creates/updates/removes device-mapper linear targets so each
//! `(vm_name, disk-slot)` pair has a stable `/dev/mapper/<name>` regardless
//! of kernel enumeration order.

use std::time::Duration;

use volcore_common::process;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// `<clean(vm_name)><slot>`, e.g. `pgtest` + slot `0` -> `pgtest0`.
#[must_use]
pub fn derive_name(vm_name: &str, slot: u32) -> String {
    let clean: String = vm_name.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("{clean}{slot}")
}

/// `disk-2000 -> slot 0`, per the `vmware_disk_key = 2000 + disk_index` rule.
#[must_use]
pub fn slot_from_disk_key(disk_key: u32) -> u32 {
    disk_key.saturating_sub(2000)
}

pub struct PersistentNameLayer;

impl Default for PersistentNameLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistentNameLayer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn sector_count(&self, backing_device: &str) -> Result<u64, volcore_common::ExternalCommandError> {
        let out = process::run("blockdev", &["--getsz", backing_device], COMMAND_TIMEOUT).await?;
        out.trim()
            .parse()
            .map_err(|_| volcore_common::ExternalCommandError::Parse {
                program: "blockdev".to_string(),
                reason: format!("non-numeric sector count: {out:?}"),
            })
    }

    async fn target_exists(&self, name: &str) -> bool {
        process::run("dmsetup", &["info", "-c", "--noheadings", "-o", "name", name], COMMAND_TIMEOUT)
            .await
            .is_ok()
    }

    /// Create the `/dev/mapper/<name>` alias over `backing_device`. Returns
    /// success without re-creating if the target already exists.
    pub async fn create(&self, name: &str, backing_device: &str) -> Result<String, volcore_common::ExternalCommandError> {
        if self.target_exists(name).await {
            tracing::debug!(name, "persistent-name target already exists, treating as success");
            return Ok(format!("/dev/mapper/{name}"));
        }

        let sectors = self.sector_count(backing_device).await?;
        let table = format!("0 {sectors} linear {backing_device} 0");
        process::run_checked("dmsetup", &["create", name, "--table", &table], COMMAND_TIMEOUT).await?;
        Ok(format!("/dev/mapper/{name}"))
    }

    /// Rebuild `name`'s target on top of `new_backing_device` (on
    /// re-correlation) via `reload` + `resume`.
    pub async fn update(&self, name: &str, new_backing_device: &str) -> Result<String, volcore_common::ExternalCommandError> {
        let sectors = self.sector_count(new_backing_device).await?;
        let table = format!("0 {sectors} linear {new_backing_device} 0");
        process::run_checked("dmsetup", &["reload", name, "--table", &table], COMMAND_TIMEOUT).await?;
        process::run_checked("dmsetup", &["resume", name], COMMAND_TIMEOUT).await?;
        Ok(format!("/dev/mapper/{name}"))
    }

    /// Remove `name`'s target. Failures are logged and swallowed — the
    /// volume may already be gone.
    pub async fn remove(&self, name: &str) {
        if let Err(e) = process::run_checked("dmsetup", &["remove", name], COMMAND_TIMEOUT).await {
            tracing::warn!(name, error = %e, "failed to remove persistent-name target, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_clean_alphanumeric_name_with_slot_suffix() {
        assert_eq!(derive_name("pg-test", 0), "pgtest0");
        assert_eq!(derive_name("VM_01!!", 2), "VM012");
    }

    #[test]
    fn slot_from_disk_key_subtracts_base() {
        assert_eq!(slot_from_disk_key(2000), 0);
        assert_eq!(slot_from_disk_key(2003), 3);
    }
}
