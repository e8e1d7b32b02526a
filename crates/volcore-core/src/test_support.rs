//! In-memory `Repository` test double shared by this crate's own tests.
//! Not exported; `volcore-repository`'s own suite exercises the real
//! `RedbRepository` against the same trait.

#![cfg(test)]

use std::collections::HashMap;

use parking_lot::Mutex;
use volcore_common::{BackupContext, BackupDisk, DeviceMapping, NbdExport, Operation, RestoreMount, VolumeSnapshotRecord};
use volcore_repository::{RepoResult, Repository, RepositoryError};

#[derive(Default)]
pub struct InMemoryRepository {
    operations: Mutex<HashMap<String, Operation>>,
    mappings: Mutex<HashMap<String, DeviceMapping>>,
    exports: Mutex<HashMap<String, NbdExport>>,
    backup_contexts: Mutex<HashMap<String, BackupContext>>,
    backup_disks: Mutex<HashMap<u64, BackupDisk>>,
    restore_mounts: Mutex<HashMap<String, RestoreMount>>,
    snapshots: Mutex<HashMap<String, VolumeSnapshotRecord>>,
}

impl Repository for InMemoryRepository {
    fn create_operation(&self, op: &Operation) -> RepoResult<()> {
        self.operations.lock().insert(op.id.clone(), op.clone());
        Ok(())
    }
    fn get_operation(&self, id: &str) -> RepoResult<Option<Operation>> {
        Ok(self.operations.lock().get(id).cloned())
    }
    fn update_operation(&self, op: &Operation) -> RepoResult<()> {
        self.operations.lock().insert(op.id.clone(), op.clone());
        Ok(())
    }
    fn list_operations_for_volume(&self, volume_id: &str) -> RepoResult<Vec<Operation>> {
        Ok(self
            .operations
            .lock()
            .values()
            .filter(|o| o.volume_id.as_deref() == Some(volume_id))
            .cloned()
            .collect())
    }
    fn list_operations_for_vm(&self, vm_id: &str) -> RepoResult<Vec<Operation>> {
        Ok(self
            .operations
            .lock()
            .values()
            .filter(|o| o.vm_id.as_deref() == Some(vm_id))
            .cloned()
            .collect())
    }
    fn list_stale_executing_operations(&self, older_than: u64) -> RepoResult<Vec<Operation>> {
        Ok(self
            .operations
            .lock()
            .values()
            .filter(|o| o.status == volcore_common::OperationStatus::Executing && o.updated_at < older_than)
            .cloned()
            .collect())
    }

    fn create_mapping(&self, mapping: &DeviceMapping) -> RepoResult<()> {
        let mut guard = self.mappings.lock();
        if guard.contains_key(&mapping.volume_uuid) {
            return Err(RepositoryError::Constraint(format!("mapping for {} already exists", mapping.volume_uuid)));
        }
        guard.insert(mapping.volume_uuid.clone(), mapping.clone());
        Ok(())
    }
    fn get_mapping(&self, volume_uuid: &str) -> RepoResult<Option<DeviceMapping>> {
        Ok(self.mappings.lock().get(volume_uuid).cloned())
    }
    fn get_mapping_by_device(&self, device_path: &str) -> RepoResult<Option<DeviceMapping>> {
        Ok(self.mappings.lock().values().find(|m| m.device_path == device_path).cloned())
    }
    fn update_mapping(&self, mapping: &DeviceMapping) -> RepoResult<()> {
        self.mappings.lock().insert(mapping.volume_uuid.clone(), mapping.clone());
        Ok(())
    }
    fn delete_mapping(&self, volume_uuid: &str) -> RepoResult<()> {
        self.mappings.lock().remove(volume_uuid);
        Ok(())
    }
    fn list_mappings_for_vm(&self, vm_id: &str) -> RepoResult<Vec<DeviceMapping>> {
        Ok(self.mappings.lock().values().filter(|m| m.vm_id == vm_id).cloned().collect())
    }
    fn list_all_mappings(&self) -> RepoResult<Vec<DeviceMapping>> {
        Ok(self.mappings.lock().values().cloned().collect())
    }

    fn create_export(&self, export: &NbdExport) -> RepoResult<()> {
        self.exports.lock().insert(export.id.clone(), export.clone());
        Ok(())
    }
    fn get_export(&self, id: &str) -> RepoResult<Option<NbdExport>> {
        Ok(self.exports.lock().get(id).cloned())
    }
    fn get_export_for_volume(&self, volume_id: &str) -> RepoResult<Option<NbdExport>> {
        Ok(self.exports.lock().values().find(|e| e.volume_id == volume_id).cloned())
    }
    fn update_export(&self, export: &NbdExport) -> RepoResult<()> {
        self.exports.lock().insert(export.id.clone(), export.clone());
        Ok(())
    }
    fn delete_export(&self, id: &str) -> RepoResult<()> {
        self.exports.lock().remove(id);
        Ok(())
    }

    fn create_backup_context(&self, ctx: &BackupContext) -> RepoResult<()> {
        self.backup_contexts.lock().insert(ctx.context_id.clone(), ctx.clone());
        Ok(())
    }
    fn get_backup_context(&self, context_id: &str) -> RepoResult<Option<BackupContext>> {
        Ok(self.backup_contexts.lock().get(context_id).cloned())
    }
    fn get_backup_context_by_vm(&self, vm_name: &str, repository_id: &str) -> RepoResult<Option<BackupContext>> {
        Ok(self
            .backup_contexts
            .lock()
            .values()
            .find(|c| c.vm_name == vm_name && c.repository_id == repository_id)
            .cloned())
    }
    fn update_backup_context(&self, ctx: &BackupContext) -> RepoResult<()> {
        self.backup_contexts.lock().insert(ctx.context_id.clone(), ctx.clone());
        Ok(())
    }
    fn delete_backup_context(&self, context_id: &str) -> RepoResult<()> {
        self.backup_contexts.lock().remove(context_id);
        let disk_ids: Vec<u64> = self
            .backup_disks
            .lock()
            .values()
            .filter(|d| d.vm_backup_context_id == context_id)
            .map(|d| d.id)
            .collect();
        for id in disk_ids {
            self.delete_backup_disk(id)?;
        }
        Ok(())
    }

    fn create_backup_disk(&self, disk: &BackupDisk) -> RepoResult<()> {
        self.backup_disks.lock().insert(disk.id, disk.clone());
        Ok(())
    }
    fn get_backup_disk(&self, id: u64) -> RepoResult<Option<BackupDisk>> {
        Ok(self.backup_disks.lock().get(&id).cloned())
    }
    fn get_backup_disk_by_job(&self, backup_job_id: &str, disk_index: u32) -> RepoResult<Option<BackupDisk>> {
        Ok(self
            .backup_disks
            .lock()
            .values()
            .find(|d| d.backup_job_id == backup_job_id && d.disk_index == disk_index)
            .cloned())
    }
    fn update_backup_disk(&self, disk: &BackupDisk) -> RepoResult<()> {
        self.backup_disks.lock().insert(disk.id, disk.clone());
        Ok(())
    }
    fn list_backup_disks_for_context(&self, context_id: &str) -> RepoResult<Vec<BackupDisk>> {
        Ok(self
            .backup_disks
            .lock()
            .values()
            .filter(|d| d.vm_backup_context_id == context_id)
            .cloned()
            .collect())
    }
    fn delete_backup_disk(&self, id: u64) -> RepoResult<()> {
        self.backup_disks.lock().remove(&id);
        let mount_id = self
            .restore_mounts
            .lock()
            .values()
            .find(|m| m.backup_disk_id == id)
            .map(|m| m.id.clone());
        if let Some(mount_id) = mount_id {
            self.delete_restore_mount(&mount_id)?;
        }
        Ok(())
    }
    fn delete_backup_disks_for_job(&self, backup_job_id: &str) -> RepoResult<()> {
        let ids: Vec<u64> = self
            .backup_disks
            .lock()
            .values()
            .filter(|d| d.backup_job_id == backup_job_id)
            .map(|d| d.id)
            .collect();
        for id in ids {
            self.delete_backup_disk(id)?;
        }
        Ok(())
    }

    fn create_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()> {
        self.restore_mounts.lock().insert(mount.id.clone(), mount.clone());
        Ok(())
    }
    fn get_restore_mount(&self, id: &str) -> RepoResult<Option<RestoreMount>> {
        Ok(self.restore_mounts.lock().get(id).cloned())
    }
    fn get_restore_mount_by_backup_disk(&self, backup_disk_id: u64) -> RepoResult<Option<RestoreMount>> {
        Ok(self
            .restore_mounts
            .lock()
            .values()
            .find(|m| m.backup_disk_id == backup_disk_id)
            .cloned())
    }
    fn update_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()> {
        self.restore_mounts.lock().insert(mount.id.clone(), mount.clone());
        Ok(())
    }
    fn delete_restore_mount(&self, id: &str) -> RepoResult<()> {
        self.restore_mounts.lock().remove(id);
        Ok(())
    }
    fn list_restore_mounts(&self) -> RepoResult<Vec<RestoreMount>> {
        Ok(self.restore_mounts.lock().values().cloned().collect())
    }
    fn list_expired_restore_mounts(&self, now: u64) -> RepoResult<Vec<RestoreMount>> {
        Ok(self
            .restore_mounts
            .lock()
            .values()
            .filter(|m| m.expires_at.is_some_and(|e| e < now))
            .cloned()
            .collect())
    }
    fn count_active_restore_mounts(&self) -> RepoResult<usize> {
        Ok(self
            .restore_mounts
            .lock()
            .values()
            .filter(|m| m.status == volcore_common::RestoreMountStatus::Mounted)
            .count())
    }
    fn allocated_nbd_devices(&self) -> RepoResult<Vec<String>> {
        Ok(self.restore_mounts.lock().values().map(|m| m.nbd_device.clone()).collect())
    }

    fn create_snapshot_record(&self, record: &VolumeSnapshotRecord) -> RepoResult<()> {
        self.snapshots.lock().insert(record.volume_id.clone(), record.clone());
        Ok(())
    }
    fn get_snapshot_record(&self, volume_id: &str) -> RepoResult<Option<VolumeSnapshotRecord>> {
        Ok(self.snapshots.lock().get(volume_id).cloned())
    }
    fn delete_snapshot_record(&self, snapshot_id: &str) -> RepoResult<()> {
        self.snapshots.lock().retain(|_, v| v.snapshot_id != snapshot_id);
        Ok(())
    }
}
