//! `redb`-backed `Repository` implementation.
//!
//! Table-per-entity, JSON-encoded rows, and a secondary-index table for
//! every uniqueness constraint that isn't already the primary key —
//! mirrors `bin/objectio-block-gateway/src/store.rs`'s `VOLUMES`/
//! `SNAPSHOTS`/`CHUNKS` layout, generalized to the seven entities here.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use volcore_common::{BackupContext, BackupDisk, DeviceMapping, NbdExport, Operation, RestoreMount, VolumeSnapshotRecord};

use crate::error::{RepoResult, RepositoryError};
use crate::traits::Repository;

const OPERATIONS: TableDefinition<&str, &str> = TableDefinition::new("operations");
const MAPPINGS: TableDefinition<&str, &str> = TableDefinition::new("mappings");
const MAPPINGS_BY_DEVICE: TableDefinition<&str, &str> = TableDefinition::new("mappings_by_device");
const EXPORTS: TableDefinition<&str, &str> = TableDefinition::new("exports");
const EXPORTS_BY_NAME: TableDefinition<&str, &str> = TableDefinition::new("exports_by_name");
const EXPORTS_BY_VOLUME: TableDefinition<&str, &str> = TableDefinition::new("exports_by_volume");
const BACKUP_CONTEXTS: TableDefinition<&str, &str> = TableDefinition::new("backup_contexts");
const BACKUP_CONTEXTS_BY_VM: TableDefinition<&str, &str> = TableDefinition::new("backup_contexts_by_vm");
const BACKUP_DISKS: TableDefinition<&str, &str> = TableDefinition::new("backup_disks");
const BACKUP_DISKS_BY_JOB: TableDefinition<&str, &str> = TableDefinition::new("backup_disks_by_job");
const RESTORE_MOUNTS: TableDefinition<&str, &str> = TableDefinition::new("restore_mounts");
const RESTORE_MOUNTS_BY_DISK: TableDefinition<&str, &str> = TableDefinition::new("restore_mounts_by_disk");
const RESTORE_MOUNTS_BY_DEVICE: TableDefinition<&str, &str> = TableDefinition::new("restore_mounts_by_device");
const SNAPSHOT_RECORDS: TableDefinition<&str, &str> = TableDefinition::new("snapshot_records");

pub struct RedbRepository {
    db: Arc<Database>,
}

impl RedbRepository {
    pub fn open(path: impl AsRef<Path>) -> RepoResult<Self> {
        let db = Database::create(path)?;
        let wtx = db.begin_write()?;
        wtx.open_table(OPERATIONS)?;
        wtx.open_table(MAPPINGS)?;
        wtx.open_table(MAPPINGS_BY_DEVICE)?;
        wtx.open_table(EXPORTS)?;
        wtx.open_table(EXPORTS_BY_NAME)?;
        wtx.open_table(EXPORTS_BY_VOLUME)?;
        wtx.open_table(BACKUP_CONTEXTS)?;
        wtx.open_table(BACKUP_CONTEXTS_BY_VM)?;
        wtx.open_table(BACKUP_DISKS)?;
        wtx.open_table(BACKUP_DISKS_BY_JOB)?;
        wtx.open_table(RESTORE_MOUNTS)?;
        wtx.open_table(RESTORE_MOUNTS_BY_DISK)?;
        wtx.open_table(RESTORE_MOUNTS_BY_DEVICE)?;
        wtx.open_table(SNAPSHOT_RECORDS)?;
        wtx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, table: TableDefinition<&str, &str>, key: &str) -> RepoResult<Option<T>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(table)?;
        match table.get(key)? {
            Some(v) => Ok(Some(serde_json::from_str(v.value())?)),
            None => Ok(None),
        }
    }

    fn scan_all<T: serde::de::DeserializeOwned>(&self, table: TableDefinition<&str, &str>) -> RepoResult<Vec<T>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(table)?;
        let mut out = Vec::new();
        for entry in table.iter()? {
            let (_, v) = entry?;
            out.push(serde_json::from_str(v.value())?);
        }
        Ok(out)
    }
}

fn backup_disk_key(id: u64) -> String {
    format!("{id:016x}")
}

fn vm_repo_key(vm_name: &str, repository_id: &str) -> String {
    format!("{vm_name}\x00{repository_id}")
}

fn job_disk_key(backup_job_id: &str, disk_index: u32) -> String {
    format!("{backup_job_id}\x00{disk_index:08x}")
}

impl Repository for RedbRepository {
    fn create_operation(&self, op: &Operation) -> RepoResult<()> {
        let json = serde_json::to_string(op)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(OPERATIONS)?.insert(op.id.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn get_operation(&self, id: &str) -> RepoResult<Option<Operation>> {
        self.get_json(OPERATIONS, id)
    }

    fn update_operation(&self, op: &Operation) -> RepoResult<()> {
        self.create_operation(op)
    }

    fn list_operations_for_volume(&self, volume_id: &str) -> RepoResult<Vec<Operation>> {
        let all: Vec<Operation> = self.scan_all(OPERATIONS)?;
        Ok(all.into_iter().filter(|o| o.volume_id.as_deref() == Some(volume_id)).collect())
    }

    fn list_operations_for_vm(&self, vm_id: &str) -> RepoResult<Vec<Operation>> {
        let all: Vec<Operation> = self.scan_all(OPERATIONS)?;
        Ok(all.into_iter().filter(|o| o.vm_id.as_deref() == Some(vm_id)).collect())
    }

    fn list_stale_executing_operations(&self, older_than: u64) -> RepoResult<Vec<Operation>> {
        let all: Vec<Operation> = self.scan_all(OPERATIONS)?;
        Ok(all
            .into_iter()
            .filter(|o| o.status == volcore_common::OperationStatus::Executing && o.updated_at < older_than)
            .collect())
    }

    fn create_mapping(&self, mapping: &DeviceMapping) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let table = wtx.open_table(MAPPINGS)?;
            if table.get(mapping.volume_uuid.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "mapping already exists for volume_uuid {}",
                    mapping.volume_uuid
                )));
            }
        }
        {
            let device_index = wtx.open_table(MAPPINGS_BY_DEVICE)?;
            if !mapping.device_path.is_empty() && device_index.get(mapping.device_path.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "mapping already exists for device_path {}",
                    mapping.device_path
                )));
            }
        }
        let json = serde_json::to_string(mapping)?;
        wtx.open_table(MAPPINGS)?.insert(mapping.volume_uuid.as_str(), json.as_str())?;
        if !mapping.device_path.is_empty() {
            wtx.open_table(MAPPINGS_BY_DEVICE)?
                .insert(mapping.device_path.as_str(), mapping.volume_uuid.as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn get_mapping(&self, volume_uuid: &str) -> RepoResult<Option<DeviceMapping>> {
        self.get_json(MAPPINGS, volume_uuid)
    }

    fn get_mapping_by_device(&self, device_path: &str) -> RepoResult<Option<DeviceMapping>> {
        let Some(volume_uuid) = self.get_json::<String>(MAPPINGS_BY_DEVICE, device_path)? else {
            return Ok(None);
        };
        self.get_mapping(&volume_uuid)
    }

    fn update_mapping(&self, mapping: &DeviceMapping) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        let previous: Option<DeviceMapping> = {
            let table = wtx.open_table(MAPPINGS)?;
            table
                .get(mapping.volume_uuid.as_str())?
                .map(|v| serde_json::from_str(v.value()))
                .transpose()?
        };
        if let Some(prev) = &previous {
            if prev.device_path != mapping.device_path && !prev.device_path.is_empty() {
                wtx.open_table(MAPPINGS_BY_DEVICE)?.remove(prev.device_path.as_str())?;
            }
        }
        let json = serde_json::to_string(mapping)?;
        wtx.open_table(MAPPINGS)?.insert(mapping.volume_uuid.as_str(), json.as_str())?;
        if !mapping.device_path.is_empty() {
            wtx.open_table(MAPPINGS_BY_DEVICE)?
                .insert(mapping.device_path.as_str(), mapping.volume_uuid.as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn delete_mapping(&self, volume_uuid: &str) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        let existing: Option<DeviceMapping> = {
            let table = wtx.open_table(MAPPINGS)?;
            table
                .get(volume_uuid)?
                .map(|v| serde_json::from_str(v.value()))
                .transpose()?
        };
        wtx.open_table(MAPPINGS)?.remove(volume_uuid)?;
        if let Some(existing) = existing {
            if !existing.device_path.is_empty() {
                wtx.open_table(MAPPINGS_BY_DEVICE)?.remove(existing.device_path.as_str())?;
            }
        }
        wtx.commit()?;
        Ok(())
    }

    fn list_mappings_for_vm(&self, vm_id: &str) -> RepoResult<Vec<DeviceMapping>> {
        let all: Vec<DeviceMapping> = self.scan_all(MAPPINGS)?;
        Ok(all.into_iter().filter(|m| m.vm_id == vm_id).collect())
    }

    fn list_all_mappings(&self) -> RepoResult<Vec<DeviceMapping>> {
        self.scan_all(MAPPINGS)
    }

    fn create_export(&self, export: &NbdExport) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let name_index = wtx.open_table(EXPORTS_BY_NAME)?;
            if name_index.get(export.export_name.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "export name {} already in use",
                    export.export_name
                )));
            }
        }
        let json = serde_json::to_string(export)?;
        wtx.open_table(EXPORTS)?.insert(export.id.as_str(), json.as_str())?;
        wtx.open_table(EXPORTS_BY_NAME)?.insert(export.export_name.as_str(), export.id.as_str())?;
        wtx.open_table(EXPORTS_BY_VOLUME)?.insert(export.volume_id.as_str(), export.id.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn get_export(&self, id: &str) -> RepoResult<Option<NbdExport>> {
        self.get_json(EXPORTS, id)
    }

    fn get_export_for_volume(&self, volume_id: &str) -> RepoResult<Option<NbdExport>> {
        let Some(id) = self.get_json::<String>(EXPORTS_BY_VOLUME, volume_id)? else {
            return Ok(None);
        };
        self.get_export(&id)
    }

    fn update_export(&self, export: &NbdExport) -> RepoResult<()> {
        let json = serde_json::to_string(export)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(EXPORTS)?.insert(export.id.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn delete_export(&self, id: &str) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        let existing: Option<NbdExport> = {
            let table = wtx.open_table(EXPORTS)?;
            table.get(id)?.map(|v| serde_json::from_str(v.value())).transpose()?
        };
        wtx.open_table(EXPORTS)?.remove(id)?;
        if let Some(existing) = existing {
            wtx.open_table(EXPORTS_BY_NAME)?.remove(existing.export_name.as_str())?;
            wtx.open_table(EXPORTS_BY_VOLUME)?.remove(existing.volume_id.as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn create_backup_context(&self, ctx: &BackupContext) -> RepoResult<()> {
        let key = vm_repo_key(&ctx.vm_name, &ctx.repository_id);
        let wtx = self.db.begin_write()?;
        {
            let index = wtx.open_table(BACKUP_CONTEXTS_BY_VM)?;
            if index.get(key.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "backup context already exists for ({}, {})",
                    ctx.vm_name, ctx.repository_id
                )));
            }
        }
        let json = serde_json::to_string(ctx)?;
        wtx.open_table(BACKUP_CONTEXTS)?.insert(ctx.context_id.as_str(), json.as_str())?;
        wtx.open_table(BACKUP_CONTEXTS_BY_VM)?.insert(key.as_str(), ctx.context_id.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn get_backup_context(&self, context_id: &str) -> RepoResult<Option<BackupContext>> {
        self.get_json(BACKUP_CONTEXTS, context_id)
    }

    fn get_backup_context_by_vm(&self, vm_name: &str, repository_id: &str) -> RepoResult<Option<BackupContext>> {
        let key = vm_repo_key(vm_name, repository_id);
        let Some(context_id) = self.get_json::<String>(BACKUP_CONTEXTS_BY_VM, &key)? else {
            return Ok(None);
        };
        self.get_backup_context(&context_id)
    }

    fn update_backup_context(&self, ctx: &BackupContext) -> RepoResult<()> {
        let json = serde_json::to_string(ctx)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(BACKUP_CONTEXTS)?.insert(ctx.context_id.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn delete_backup_context(&self, context_id: &str) -> RepoResult<()> {
        let disks = self.list_backup_disks_for_context(context_id)?;
        for disk in &disks {
            self.delete_backup_disk(disk.id)?;
        }
        let wtx = self.db.begin_write()?;
        let existing: Option<BackupContext> = {
            let table = wtx.open_table(BACKUP_CONTEXTS)?;
            table.get(context_id)?.map(|v| serde_json::from_str(v.value())).transpose()?
        };
        wtx.open_table(BACKUP_CONTEXTS)?.remove(context_id)?;
        if let Some(existing) = existing {
            let key = vm_repo_key(&existing.vm_name, &existing.repository_id);
            wtx.open_table(BACKUP_CONTEXTS_BY_VM)?.remove(key.as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn create_backup_disk(&self, disk: &BackupDisk) -> RepoResult<()> {
        let job_key = job_disk_key(&disk.backup_job_id, disk.disk_index);
        let wtx = self.db.begin_write()?;
        {
            let index = wtx.open_table(BACKUP_DISKS_BY_JOB)?;
            if index.get(job_key.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "backup disk already exists for ({}, {})",
                    disk.backup_job_id, disk.disk_index
                )));
            }
        }
        let key = backup_disk_key(disk.id);
        let json = serde_json::to_string(disk)?;
        wtx.open_table(BACKUP_DISKS)?.insert(key.as_str(), json.as_str())?;
        wtx.open_table(BACKUP_DISKS_BY_JOB)?.insert(job_key.as_str(), key.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn get_backup_disk(&self, id: u64) -> RepoResult<Option<BackupDisk>> {
        self.get_json(BACKUP_DISKS, &backup_disk_key(id))
    }

    fn get_backup_disk_by_job(&self, backup_job_id: &str, disk_index: u32) -> RepoResult<Option<BackupDisk>> {
        let job_key = job_disk_key(backup_job_id, disk_index);
        let Some(key) = self.get_json::<String>(BACKUP_DISKS_BY_JOB, &job_key)? else {
            return Ok(None);
        };
        self.get_json(BACKUP_DISKS, &key)
    }

    fn update_backup_disk(&self, disk: &BackupDisk) -> RepoResult<()> {
        let key = backup_disk_key(disk.id);
        let json = serde_json::to_string(disk)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(BACKUP_DISKS)?.insert(key.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn list_backup_disks_for_context(&self, context_id: &str) -> RepoResult<Vec<BackupDisk>> {
        let all: Vec<BackupDisk> = self.scan_all(BACKUP_DISKS)?;
        Ok(all.into_iter().filter(|d| d.vm_backup_context_id == context_id).collect())
    }

    fn delete_backup_disk(&self, id: u64) -> RepoResult<()> {
        if let Some(mount) = self.get_restore_mount_by_backup_disk(id)? {
            self.delete_restore_mount(&mount.id)?;
        }
        let key = backup_disk_key(id);
        let wtx = self.db.begin_write()?;
        let existing: Option<BackupDisk> = {
            let table = wtx.open_table(BACKUP_DISKS)?;
            table.get(key.as_str())?.map(|v| serde_json::from_str(v.value())).transpose()?
        };
        wtx.open_table(BACKUP_DISKS)?.remove(key.as_str())?;
        if let Some(existing) = existing {
            let job_key = job_disk_key(&existing.backup_job_id, existing.disk_index);
            wtx.open_table(BACKUP_DISKS_BY_JOB)?.remove(job_key.as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn delete_backup_disks_for_job(&self, backup_job_id: &str) -> RepoResult<()> {
        let all: Vec<BackupDisk> = self.scan_all(BACKUP_DISKS)?;
        for disk in all.into_iter().filter(|d| d.backup_job_id == backup_job_id) {
            self.delete_backup_disk(disk.id)?;
        }
        Ok(())
    }

    fn create_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let device_index = wtx.open_table(RESTORE_MOUNTS_BY_DEVICE)?;
            if device_index.get(mount.nbd_device.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "nbd device {} already allocated",
                    mount.nbd_device
                )));
            }
        }
        {
            let disk_index = wtx.open_table(RESTORE_MOUNTS_BY_DISK)?;
            let disk_key = mount.backup_disk_id.to_string();
            if disk_index.get(disk_key.as_str())?.is_some() {
                return Err(RepositoryError::Constraint(format!(
                    "restore mount already exists for backup disk {}",
                    mount.backup_disk_id
                )));
            }
        }
        let json = serde_json::to_string(mount)?;
        wtx.open_table(RESTORE_MOUNTS)?.insert(mount.id.as_str(), json.as_str())?;
        wtx.open_table(RESTORE_MOUNTS_BY_DEVICE)?.insert(mount.nbd_device.as_str(), mount.id.as_str())?;
        wtx.open_table(RESTORE_MOUNTS_BY_DISK)?.insert(mount.backup_disk_id.to_string().as_str(), mount.id.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn get_restore_mount(&self, id: &str) -> RepoResult<Option<RestoreMount>> {
        self.get_json(RESTORE_MOUNTS, id)
    }

    fn get_restore_mount_by_backup_disk(&self, backup_disk_id: u64) -> RepoResult<Option<RestoreMount>> {
        let disk_key = backup_disk_id.to_string();
        let Some(id) = self.get_json::<String>(RESTORE_MOUNTS_BY_DISK, &disk_key)? else {
            return Ok(None);
        };
        self.get_restore_mount(&id)
    }

    fn update_restore_mount(&self, mount: &RestoreMount) -> RepoResult<()> {
        let json = serde_json::to_string(mount)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(RESTORE_MOUNTS)?.insert(mount.id.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn delete_restore_mount(&self, id: &str) -> RepoResult<()> {
        let wtx = self.db.begin_write()?;
        let existing: Option<RestoreMount> = {
            let table = wtx.open_table(RESTORE_MOUNTS)?;
            table.get(id)?.map(|v| serde_json::from_str(v.value())).transpose()?
        };
        wtx.open_table(RESTORE_MOUNTS)?.remove(id)?;
        if let Some(existing) = existing {
            wtx.open_table(RESTORE_MOUNTS_BY_DEVICE)?.remove(existing.nbd_device.as_str())?;
            wtx.open_table(RESTORE_MOUNTS_BY_DISK)?.remove(existing.backup_disk_id.to_string().as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    fn list_restore_mounts(&self) -> RepoResult<Vec<RestoreMount>> {
        self.scan_all(RESTORE_MOUNTS)
    }

    fn list_expired_restore_mounts(&self, now: u64) -> RepoResult<Vec<RestoreMount>> {
        let all: Vec<RestoreMount> = self.scan_all(RESTORE_MOUNTS)?;
        Ok(all.into_iter().filter(|m| m.expires_at.is_some_and(|exp| exp < now)).collect())
    }

    fn count_active_restore_mounts(&self) -> RepoResult<usize> {
        let all: Vec<RestoreMount> = self.scan_all(RESTORE_MOUNTS)?;
        Ok(all
            .into_iter()
            .filter(|m| !matches!(m.status, volcore_common::RestoreMountStatus::Unmounted))
            .count())
    }

    fn allocated_nbd_devices(&self) -> RepoResult<Vec<String>> {
        let all: Vec<RestoreMount> = self.scan_all(RESTORE_MOUNTS)?;
        Ok(all
            .into_iter()
            .filter(|m| !matches!(m.status, volcore_common::RestoreMountStatus::Unmounted))
            .map(|m| m.nbd_device)
            .collect())
    }

    fn create_snapshot_record(&self, record: &VolumeSnapshotRecord) -> RepoResult<()> {
        let json = serde_json::to_string(record)?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(SNAPSHOT_RECORDS)?.insert(record.volume_id.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    fn get_snapshot_record(&self, volume_id: &str) -> RepoResult<Option<VolumeSnapshotRecord>> {
        self.get_json(SNAPSHOT_RECORDS, volume_id)
    }

    fn delete_snapshot_record(&self, snapshot_id: &str) -> RepoResult<()> {
        let all: Vec<VolumeSnapshotRecord> = self.scan_all(SNAPSHOT_RECORDS)?;
        let wtx = self.db.begin_write()?;
        let mut table = wtx.open_table(SNAPSHOT_RECORDS)?;
        for record in all.into_iter().filter(|r| r.snapshot_id == snapshot_id) {
            table.remove(record.volume_id.as_str())?;
        }
        drop(table);
        wtx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volcore_common::{CloudStackState, LinuxState, OperationMode};

    fn sample_mapping(volume_uuid: &str, device_path: &str) -> DeviceMapping {
        DeviceMapping {
            volume_uuid: volume_uuid.to_string(),
            volume_id_numeric: None,
            vm_id: "vm-1".to_string(),
            device_path: device_path.to_string(),
            cloudstack_state: CloudStackState::Attached,
            linux_state: LinuxState::Detected,
            operation_mode: OperationMode::Controller,
            cloudstack_device_id: Some(0),
            requires_device_correlation: false,
            size: 1024,
            persistent_name: None,
            last_sync: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn create_mapping_rejects_duplicate_volume_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("state.redb")).unwrap();
        repo.create_mapping(&sample_mapping("v1", "/dev/vdb")).unwrap();
        let err = repo.create_mapping(&sample_mapping("v1", "/dev/vdc")).unwrap_err();
        assert!(matches!(err, RepositoryError::Constraint(_)));
    }

    #[test]
    fn create_mapping_rejects_duplicate_device_path() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("state.redb")).unwrap();
        repo.create_mapping(&sample_mapping("v1", "/dev/vdb")).unwrap();
        let err = repo.create_mapping(&sample_mapping("v2", "/dev/vdb")).unwrap_err();
        assert!(matches!(err, RepositoryError::Constraint(_)));
    }

    #[test]
    fn get_mapping_by_device_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("state.redb")).unwrap();
        repo.create_mapping(&sample_mapping("v1", "/dev/vdb")).unwrap();
        let found = repo.get_mapping_by_device("/dev/vdb").unwrap().unwrap();
        assert_eq!(found.volume_uuid, "v1");
    }

    #[test]
    fn update_mapping_moves_device_index() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("state.redb")).unwrap();
        repo.create_mapping(&sample_mapping("v1", "/dev/vdb")).unwrap();
        let updated = sample_mapping("v1", "/dev/mapper/alias0");
        repo.update_mapping(&updated).unwrap();
        assert!(repo.get_mapping_by_device("/dev/vdb").unwrap().is_none());
        assert!(repo.get_mapping_by_device("/dev/mapper/alias0").unwrap().is_some());
    }

    #[test]
    fn deleting_backup_context_cascades_disks_and_mounts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("state.redb")).unwrap();
        let ctx = BackupContext {
            context_id: "ctx-1".into(),
            vm_name: "vm-a".into(),
            vmware_vm_id: "vmw-1".into(),
            vm_path: "/dc/vm-a".into(),
            vcenter_host: "vc1".into(),
            datacenter: "dc1".into(),
            repository_id: "repo-1".into(),
            total_backups: 0,
            successful_backups: 0,
            failed_backups: 0,
            last_backup_id: None,
            last_backup_type: None,
            last_backup_at: None,
        };
        repo.create_backup_context(&ctx).unwrap();

        let disk = BackupDisk {
            id: 1,
            vm_backup_context_id: "ctx-1".into(),
            backup_job_id: "job-1".into(),
            disk_index: 0,
            vmware_disk_key: 2000,
            size_gb: 10,
            disk_change_id: None,
            qcow2_path: Some("/tmp/x.qcow2".into()),
            bytes_transferred: 0,
            status: volcore_common::BackupDiskStatus::Completed,
            created_at: 0,
            completed_at: None,
        };
        repo.create_backup_disk(&disk).unwrap();

        let mount = RestoreMount {
            id: "mount-1".into(),
            backup_disk_id: 1,
            mount_path: "/mnt/x".into(),
            nbd_device: "/dev/nbd0".into(),
            filesystem_type: Some("ext4".into()),
            mount_mode: "read-only".into(),
            status: volcore_common::RestoreMountStatus::Mounted,
            partition_metadata: None,
            created_at: 0,
            last_accessed_at: 0,
            expires_at: Some(1),
            unmounted_at: None,
        };
        repo.create_restore_mount(&mount).unwrap();

        repo.delete_backup_context("ctx-1").unwrap();

        assert!(repo.get_backup_context("ctx-1").unwrap().is_none());
        assert!(repo.get_backup_disk(1).unwrap().is_none());
        assert!(repo.get_restore_mount("mount-1").unwrap().is_none());
    }
}
