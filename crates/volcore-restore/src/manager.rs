//! File-Level Restore Mount Manager.
//!
//! Connects a completed backup disk's qcow2 image to an NBD device, mounts
//! its first partition read-only under the configured mount root, and
//! reaps the mount once it has sat idle past its TTL. Every step that
//! touches the host (qemu-nbd, mkdir, mount, umount) is undone on failure
//! so a half-finished mount never lingers in the Repository.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use volcore_common::{process, BackupDiskStatus, RestoreMount, RestoreMountStatus};
use volcore_repository::Repository;

use crate::error::{RestoreError, RestoreResult};
use crate::mount_root::MountRoot;
use crate::{pool, probe};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEVICE_POLL_ATTEMPTS: u32 = 20;

pub struct RestoreMountManagerConfig {
    pub mount_root: MountRoot,
    pub idle_ttl: Duration,
}

pub struct RestoreMountManager {
    repo: Arc<dyn Repository>,
    config: RestoreMountManagerConfig,
    /// Serializes allocate→connect→persist so two concurrent `mount()`
    /// calls for different backup disks can't race onto the same pool
    /// slot before either has a Repository row to claim it.
    pool_lock: Mutex<()>,
}

impl RestoreMountManager {
    #[must_use]
    pub fn new(repo: Arc<dyn Repository>, config: RestoreMountManagerConfig) -> Self {
        Self { repo, config, pool_lock: Mutex::new(()) }
    }

    /// Mount the given backup disk, or return the existing mount if one is
    /// already live for it — mounting is idempotent from a caller's view.
    pub async fn mount(&self, backup_disk_id: u64) -> RestoreResult<RestoreMount> {
        if let Some(mut existing) = self.repo.get_restore_mount_by_backup_disk(backup_disk_id)? {
            existing.last_accessed_at = volcore_common::ids::now();
            existing.expires_at = Some(existing.last_accessed_at + self.config.idle_ttl.as_secs());
            self.repo.update_restore_mount(&existing)?;
            return Ok(existing);
        }

        let disk = self
            .repo
            .get_backup_disk(backup_disk_id)?
            .ok_or(RestoreError::DiskNotFound(backup_disk_id))?;
        if disk.status != BackupDiskStatus::Completed {
            return Err(RestoreError::DiskNotReady(backup_disk_id));
        }
        let qcow2_path = disk.qcow2_path.ok_or(RestoreError::DiskNotReady(backup_disk_id))?;

        let mount_id = volcore_common::ids::new_entity_id();

        let _guard = self.pool_lock.lock().await;
        let device = pool::allocate(self.repo.as_ref())?;
        if let Err(e) = self.connect(&device, &qcow2_path).await {
            return Err(e);
        }

        let result = self.finish_mount(&mount_id, backup_disk_id, &device).await;
        if let Err(e) = &result {
            warn!(backup_disk_id, device, error = %e, "restore mount failed, rolling back");
            let _ = self.disconnect(&device).await;
        }
        result
    }

    async fn connect(&self, device: &str, qcow2_path: &str) -> RestoreResult<()> {
        process::run(
            "qemu-nbd",
            &["--read-only", "--connect", device, qcow2_path],
            CONNECT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn disconnect(&self, device: &str) -> RestoreResult<()> {
        process::run("qemu-nbd", &["--disconnect", device], CONNECT_TIMEOUT).await?;
        Ok(())
    }

    async fn wait_for_node(&self, path: &str) -> RestoreResult<()> {
        for _ in 0..DEVICE_POLL_ATTEMPTS {
            if Path::new(path).exists() {
                return Ok(());
            }
            sleep(DEVICE_POLL_INTERVAL).await;
        }
        Err(RestoreError::DeviceNotReady(path.to_string()))
    }

    async fn finish_mount(&self, mount_id: &str, backup_disk_id: u64, device: &str) -> RestoreResult<RestoreMount> {
        self.wait_for_node(device).await?;

        let partition = format!("{device}p1");
        let source = if Path::new(&partition).exists() { partition } else { device.to_string() };

        let filesystem_type = probe::filesystem_type(&source).await?;
        let mount_path = self.config.mount_root.mount_path(mount_id)?;
        tokio::fs::create_dir_all(&mount_path)
            .await
            .map_err(|source| volcore_common::ExternalCommandError::Spawn { program: "mkdir".into(), source })?;

        let mount_path_str = mount_path.to_string_lossy().into_owned();
        if let Err(e) = process::run("mount", &["-o", "ro", &source, &mount_path_str], CONNECT_TIMEOUT).await {
            let _ = tokio::fs::remove_dir(&mount_path).await;
            return Err(e.into());
        }

        let now = volcore_common::ids::now();
        let mount = RestoreMount {
            id: mount_id.to_string(),
            backup_disk_id,
            mount_path: mount_path_str,
            nbd_device: device.to_string(),
            filesystem_type,
            mount_mode: "read-only".to_string(),
            status: RestoreMountStatus::Mounted,
            partition_metadata: None,
            created_at: now,
            last_accessed_at: now,
            expires_at: Some(now + self.config.idle_ttl.as_secs()),
            unmounted_at: None,
        };
        self.repo.create_restore_mount(&mount)?;
        info!(backup_disk_id, device, path = %mount.mount_path, "restore mount ready");
        Ok(mount)
    }

    /// Tear down a mount. Every sub-step (umount, directory removal,
    /// qemu-nbd disconnect) runs regardless of whether an earlier one
    /// failed, so a partial failure never leaves the others undone.
    pub async fn unmount(&self, mount_id: &str) -> RestoreResult<()> {
        let Some(mount) = self.repo.get_restore_mount(mount_id)? else {
            return Ok(());
        };
        self.teardown(&mount, false).await;
        self.repo.delete_restore_mount(mount_id)?;
        Ok(())
    }

    async fn teardown(&self, mount: &RestoreMount, force: bool) {
        let umount_args: Vec<&str> = if force { vec!["-l", &mount.mount_path] } else { vec![&mount.mount_path] };
        if let Err(e) = process::run("umount", &umount_args, CONNECT_TIMEOUT).await {
            warn!(mount_id = %mount.id, error = %e, "umount failed");
        }
        if let Err(e) = tokio::fs::remove_dir(&mount.mount_path).await {
            warn!(mount_id = %mount.id, error = %e, "removing mount directory failed");
        }
        if let Err(e) = self.disconnect(&mount.nbd_device).await {
            warn!(mount_id = %mount.id, error = %e, "qemu-nbd disconnect failed");
        }
    }

    /// Unmount every mount whose TTL has elapsed. Run on a timer by the
    /// caller at `reaper_interval`.
    pub async fn reap_expired(&self) -> RestoreResult<usize> {
        let now = volcore_common::ids::now();
        let expired = self.repo.list_expired_restore_mounts(now)?;
        let mut reaped = 0;
        for mount in expired {
            self.teardown(&mount, false).await;
            if Path::new(&mount.mount_path).exists() {
                warn!(mount_id = %mount.id, "graceful umount left mount path behind, forcing");
                self.teardown(&mount, true).await;
            }
            self.repo.delete_restore_mount(&mount.id)?;
            reaped += 1;
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use parking_lot::Mutex;
    use volcore_repository::RepoResult;

    #[derive(Default)]
    struct FakeRepo {
        mounts: Mutex<HashMap<String, RestoreMount>>,
    }

    macro_rules! unimplemented_repo_methods {
        ($($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {
            $(fn $name(&self, $($arg: $ty),*) -> $ret { unimplemented!() })*
        };
    }

    impl Repository for FakeRepo {
        unimplemented_repo_methods! {
            create_operation(_op: &volcore_common::Operation) -> RepoResult<()>;
            get_operation(_id: &str) -> RepoResult<Option<volcore_common::Operation>>;
            update_operation(_op: &volcore_common::Operation) -> RepoResult<()>;
            list_operations_for_volume(_volume_id: &str) -> RepoResult<Vec<volcore_common::Operation>>;
            list_operations_for_vm(_vm_id: &str) -> RepoResult<Vec<volcore_common::Operation>>;
            list_stale_executing_operations(_older_than: u64) -> RepoResult<Vec<volcore_common::Operation>>;
            create_mapping(_mapping: &volcore_common::DeviceMapping) -> RepoResult<()>;
            get_mapping(_volume_uuid: &str) -> RepoResult<Option<volcore_common::DeviceMapping>>;
            get_mapping_by_device(_device_path: &str) -> RepoResult<Option<volcore_common::DeviceMapping>>;
            update_mapping(_mapping: &volcore_common::DeviceMapping) -> RepoResult<()>;
            delete_mapping(_volume_uuid: &str) -> RepoResult<()>;
            list_mappings_for_vm(_vm_id: &str) -> RepoResult<Vec<volcore_common::DeviceMapping>>;
            list_all_mappings() -> RepoResult<Vec<volcore_common::DeviceMapping>>;
            create_export(_export: &volcore_common::NbdExport) -> RepoResult<()>;
            get_export(_id: &str) -> RepoResult<Option<volcore_common::NbdExport>>;
            get_export_for_volume(_volume_id: &str) -> RepoResult<Option<volcore_common::NbdExport>>;
            update_export(_export: &volcore_common::NbdExport) -> RepoResult<()>;
            delete_export(_id: &str) -> RepoResult<()>;
            create_backup_context(_ctx: &volcore_common::BackupContext) -> RepoResult<()>;
            get_backup_context(_context_id: &str) -> RepoResult<Option<volcore_common::BackupContext>>;
            get_backup_context_by_vm(_vm_name: &str, _repository_id: &str) -> RepoResult<Option<volcore_common::BackupContext>>;
            update_backup_context(_ctx: &volcore_common::BackupContext) -> RepoResult<()>;
            delete_backup_context(_context_id: &str) -> RepoResult<()>;
            create_backup_disk(_disk: &volcore_common::BackupDisk) -> RepoResult<()>;
            get_backup_disk(_id: u64) -> RepoResult<Option<volcore_common::BackupDisk>>;
            get_backup_disk_by_job(_backup_job_id: &str, _disk_index: u32) -> RepoResult<Option<volcore_common::BackupDisk>>;
            update_backup_disk(_disk: &volcore_common::BackupDisk) -> RepoResult<()>;
            list_backup_disks_for_context(_context_id: &str) -> RepoResult<Vec<volcore_common::BackupDisk>>;
            delete_backup_disk(_id: u64) -> RepoResult<()>;
            delete_backup_disks_for_job(_backup_job_id: &str) -> RepoResult<()>;
            update_restore_mount(_mount: &RestoreMount) -> RepoResult<()>;
            list_restore_mounts() -> RepoResult<Vec<RestoreMount>>;
            count_active_restore_mounts() -> RepoResult<usize>;
            allocated_nbd_devices() -> RepoResult<Vec<String>>;
            create_snapshot_record(_record: &volcore_common::VolumeSnapshotRecord) -> RepoResult<()>;
            get_snapshot_record(_volume_id: &str) -> RepoResult<Option<volcore_common::VolumeSnapshotRecord>>;
            delete_snapshot_record(_snapshot_id: &str) -> RepoResult<()>;
        }

        fn create_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()> {
            self.mounts.lock().insert(mount.id.clone(), mount.clone());
            Ok(())
        }

        fn get_restore_mount(&self, id: &str) -> RepoResult<Option<RestoreMount>> {
            Ok(self.mounts.lock().get(id).cloned())
        }

        fn get_restore_mount_by_backup_disk(&self, backup_disk_id: u64) -> RepoResult<Option<RestoreMount>> {
            Ok(self.mounts.lock().values().find(|m| m.backup_disk_id == backup_disk_id).cloned())
        }

        fn delete_restore_mount(&self, id: &str) -> RepoResult<()> {
            self.mounts.lock().remove(id);
            Ok(())
        }

        fn list_expired_restore_mounts(&self, now: u64) -> RepoResult<Vec<RestoreMount>> {
            Ok(self
                .mounts
                .lock()
                .values()
                .filter(|m| m.expires_at.is_some_and(|e| e <= now))
                .cloned()
                .collect())
        }
    }

    fn sample_mount(id: &str, expires_at: Option<u64>) -> RestoreMount {
        RestoreMount {
            id: id.to_string(),
            backup_disk_id: 1,
            mount_path: "/tmp/volcore-restore-test-nonexistent".into(),
            nbd_device: "/dev/nbd0".into(),
            filesystem_type: Some("ext4".into()),
            mount_mode: "read-only".into(),
            status: RestoreMountStatus::Mounted,
            partition_metadata: None,
            created_at: 0,
            last_accessed_at: 0,
            expires_at,
            unmounted_at: None,
        }
    }

    fn manager(repo: Arc<FakeRepo>) -> RestoreMountManager {
        RestoreMountManager::new(
            repo,
            RestoreMountManagerConfig {
                mount_root: MountRoot::new("/tmp/volcore-restore-test"),
                idle_ttl: Duration::from_secs(3600),
            },
        )
    }

    #[tokio::test]
    async fn reap_expired_removes_stale_rows_even_when_teardown_commands_fail() {
        let repo = Arc::new(FakeRepo::default());
        repo.create_restore_mount(&sample_mount("expired", Some(0))).unwrap();
        repo.create_restore_mount(&sample_mount("still-fresh", Some(u64::MAX))).unwrap();

        let reaped = manager(repo.clone()).reap_expired().await.unwrap();

        assert_eq!(reaped, 1);
        assert!(repo.get_restore_mount("expired").unwrap().is_none());
        assert!(repo.get_restore_mount("still-fresh").unwrap().is_some());
    }

    #[tokio::test]
    async fn unmount_deletes_the_row_regardless_of_teardown_failures() {
        let repo = Arc::new(FakeRepo::default());
        repo.create_restore_mount(&sample_mount("m1", None)).unwrap();

        manager(repo.clone()).unmount("m1").await.unwrap();

        assert!(repo.get_restore_mount("m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn mount_reuses_an_existing_row_and_bumps_its_expiry() {
        let repo = Arc::new(FakeRepo::default());
        let mut existing = sample_mount("existing", Some(1));
        existing.backup_disk_id = 9;
        existing.last_accessed_at = 1;
        repo.create_restore_mount(&existing).unwrap();

        let result = manager(repo).mount(9).await.unwrap();

        assert_eq!(result.id, "existing");
        assert!(result.last_accessed_at >= existing.last_accessed_at);
    }
}
