//! The `Repository` interface `volcore-core`/`volcore-restore` depend on,
//! so the concurrency and correlation logic above this layer is testable
//! against an in-memory or tempfile-backed implementation rather than a
//! concrete `redb::Database`.

use volcore_common::{BackupContext, BackupDisk, DeviceMapping, NbdExport, Operation, RestoreMount, VolumeSnapshotRecord};

use crate::error::RepoResult;

pub trait Repository: Send + Sync {
    // ── Operations ───────────────────────────────────────────────────────
    fn create_operation(&self, op: &Operation) -> RepoResult<()>;
    fn get_operation(&self, id: &str) -> RepoResult<Option<Operation>>;
    fn update_operation(&self, op: &Operation) -> RepoResult<()>;
    fn list_operations_for_volume(&self, volume_id: &str) -> RepoResult<Vec<Operation>>;
    fn list_operations_for_vm(&self, vm_id: &str) -> RepoResult<Vec<Operation>>;
    fn list_stale_executing_operations(&self, older_than: u64) -> RepoResult<Vec<Operation>>;

    // ── Device Mappings ──────────────────────────────────────────────────
    fn create_mapping(&self, mapping: &DeviceMapping) -> RepoResult<()>;
    fn get_mapping(&self, volume_uuid: &str) -> RepoResult<Option<DeviceMapping>>;
    fn get_mapping_by_device(&self, device_path: &str) -> RepoResult<Option<DeviceMapping>>;
    fn update_mapping(&self, mapping: &DeviceMapping) -> RepoResult<()>;
    fn delete_mapping(&self, volume_uuid: &str) -> RepoResult<()>;
    fn list_mappings_for_vm(&self, vm_id: &str) -> RepoResult<Vec<DeviceMapping>>;
    fn list_all_mappings(&self) -> RepoResult<Vec<DeviceMapping>>;

    // ── NBD Exports ──────────────────────────────────────────────────────
    fn create_export(&self, export: &NbdExport) -> RepoResult<()>;
    fn get_export(&self, id: &str) -> RepoResult<Option<NbdExport>>;
    fn get_export_for_volume(&self, volume_id: &str) -> RepoResult<Option<NbdExport>>;
    fn update_export(&self, export: &NbdExport) -> RepoResult<()>;
    fn delete_export(&self, id: &str) -> RepoResult<()>;

    // ── Backup Contexts ──────────────────────────────────────────────────
    fn create_backup_context(&self, ctx: &BackupContext) -> RepoResult<()>;
    fn get_backup_context(&self, context_id: &str) -> RepoResult<Option<BackupContext>>;
    fn get_backup_context_by_vm(&self, vm_name: &str, repository_id: &str) -> RepoResult<Option<BackupContext>>;
    fn update_backup_context(&self, ctx: &BackupContext) -> RepoResult<()>;
    /// Cascades: deletes every backup disk (and, transitively, restore
    /// mount) owned by this context.
    fn delete_backup_context(&self, context_id: &str) -> RepoResult<()>;

    // ── Backup Disks ─────────────────────────────────────────────────────
    fn create_backup_disk(&self, disk: &BackupDisk) -> RepoResult<()>;
    fn get_backup_disk(&self, id: u64) -> RepoResult<Option<BackupDisk>>;
    fn get_backup_disk_by_job(&self, backup_job_id: &str, disk_index: u32) -> RepoResult<Option<BackupDisk>>;
    fn update_backup_disk(&self, disk: &BackupDisk) -> RepoResult<()>;
    fn list_backup_disks_for_context(&self, context_id: &str) -> RepoResult<Vec<BackupDisk>>;
    /// Cascades: deletes the restore mount for this disk, if any.
    fn delete_backup_disk(&self, id: u64) -> RepoResult<()>;
    /// Cascades: deletes every backup disk sharing `backup_job_id` (and,
    /// transitively, their restore mounts).
    fn delete_backup_disks_for_job(&self, backup_job_id: &str) -> RepoResult<()>;

    // ── Restore Mounts ───────────────────────────────────────────────────
    fn create_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()>;
    fn get_restore_mount(&self, id: &str) -> RepoResult<Option<RestoreMount>>;
    fn get_restore_mount_by_backup_disk(&self, backup_disk_id: u64) -> RepoResult<Option<RestoreMount>>;
    fn update_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()>;
    fn delete_restore_mount(&self, id: &str) -> RepoResult<()>;
    fn list_restore_mounts(&self) -> RepoResult<Vec<RestoreMount>>;
    fn list_expired_restore_mounts(&self, now: u64) -> RepoResult<Vec<RestoreMount>>;
    fn count_active_restore_mounts(&self) -> RepoResult<usize>;
    fn allocated_nbd_devices(&self) -> RepoResult<Vec<String>>;

    // ── Volume Snapshot Records ──────────────────────────────────────────
    fn create_snapshot_record(&self, record: &VolumeSnapshotRecord) -> RepoResult<()>;
    fn get_snapshot_record(&self, volume_id: &str) -> RepoResult<Option<VolumeSnapshotRecord>>;
    fn delete_snapshot_record(&self, snapshot_id: &str) -> RepoResult<()>;
}
