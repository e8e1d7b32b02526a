//! Entities from the data model: Volume Operation, Device Mapping, NBD
//! Export, Backup Context, Backup Disk, Restore Mount, and Volume Snapshot
//! Record.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Unix seconds, UTC.
pub type Timestamp = u64;

// ── Volume Operation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Attach,
    AttachRoot,
    Detach,
    Delete,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    /// `pending -> executing -> {completed|failed|cancelled}`. Terminal
    /// states never transition again.
    #[must_use]
    pub fn can_advance_to(self, next: OperationStatus) -> bool {
        use OperationStatus::{Cancelled, Completed, Executing, Failed, Pending};
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Cancelled
        )
    }
}

/// Whether a backup context's "no prior ChangeID" case is a first backup
/// (`Initial`) or genuinely indeterminate (`Unknown`). Collapsed to a
/// single "no prior ChangeID" notion at the backup-context level, but kept
/// distinct on the Operation per spec design note 9(a).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeIdStatus {
    Initial,
    Unknown,
}

/// One cloud-side mutation request, keyed to `OperationType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperationRequest {
    Create {
        size_bytes: u64,
        pool: String,
    },
    Attach {
        volume_id: String,
        vm_id: String,
        want_export: bool,
        want_persistent_name: bool,
    },
    AttachRoot {
        volume_id: String,
        vm_id: String,
    },
    Detach {
        volume_id: String,
    },
    Delete {
        volume_id: String,
    },
    Cleanup {
        vm_id: String,
    },
}

/// Result payload of a completed Operation. Only the fields a given
/// `OperationType` actually produces are populated; `raw` carries whatever
/// the cloud client returned that doesn't map to a named field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationResponse {
    pub volume_id: Option<String>,
    pub cloudstack_device_id: Option<u32>,
    pub device_path: Option<String>,
    pub export_name: Option<String>,
    pub persistent_name: Option<String>,
    pub change_id_status: Option<ChangeIdStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub volume_id: Option<String>,
    pub vm_id: Option<String>,
    pub request: OperationRequest,
    pub response: Option<OperationResponse>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl Operation {
    #[must_use]
    pub fn new(id: String, op_type: OperationType, request: OperationRequest, now: Timestamp) -> Self {
        let (volume_id, vm_id) = match &request {
            OperationRequest::Create { .. } => (None, None),
            OperationRequest::Attach { volume_id, vm_id, .. } => {
                (Some(volume_id.clone()), Some(vm_id.clone()))
            }
            OperationRequest::AttachRoot { volume_id, vm_id } => {
                (Some(volume_id.clone()), Some(vm_id.clone()))
            }
            OperationRequest::Detach { volume_id } | OperationRequest::Delete { volume_id } => {
                (Some(volume_id.clone()), None)
            }
            OperationRequest::Cleanup { vm_id } => (None, Some(vm_id.clone())),
        };
        Self {
            id,
            op_type,
            status: OperationStatus::Pending,
            volume_id,
            vm_id,
            request,
            response: None,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move the operation to `next`, rejecting non-monotonic transitions.
    pub fn advance(&mut self, next: OperationStatus, now: Timestamp) -> Result<(), String> {
        if !self.status.can_advance_to(next) {
            return Err(format!(
                "illegal operation status transition {:?} -> {:?}",
                self.status, next
            ));
        }
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

// ── Device Mapping ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudStackState {
    Attached,
    Detaching,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinuxState {
    Detected,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationMode {
    Controller,
    Failover,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub volume_uuid: String,
    pub volume_id_numeric: Option<u64>,
    pub vm_id: String,
    pub device_path: String,
    pub cloudstack_state: CloudStackState,
    pub linux_state: LinuxState,
    pub operation_mode: OperationMode,
    pub cloudstack_device_id: Option<u32>,
    pub requires_device_correlation: bool,
    pub size: u64,
    pub persistent_name: Option<String>,
    pub last_sync: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DeviceMapping {
    /// `device_path` is non-empty iff `cloudstack_state = attached`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.device_path.is_empty() != (self.cloudstack_state == CloudStackState::Attached)
            || (self.device_path.is_empty() && self.cloudstack_state != CloudStackState::Attached)
    }
}

// ── NBD Export ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NbdExportStatus {
    Pending,
    Active,
    Failed,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdExport {
    pub id: String,
    pub job_id: Option<String>,
    pub vm_context_id: Option<String>,
    pub volume_id: String,
    pub vm_disk_id: Option<String>,
    pub export_name: String,
    pub port: u16,
    pub device_path: String,
    pub config_path: String,
    pub status: NbdExportStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub metadata: HashMap<String, String>,
}

// ── Backup Context / Backup Disk ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupContext {
    pub context_id: String,
    pub vm_name: String,
    pub vmware_vm_id: String,
    pub vm_path: String,
    pub vcenter_host: String,
    pub datacenter: String,
    pub repository_id: String,
    pub total_backups: u64,
    pub successful_backups: u64,
    pub failed_backups: u64,
    pub last_backup_id: Option<String>,
    pub last_backup_type: Option<BackupType>,
    pub last_backup_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupDiskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupDisk {
    pub id: u64,
    pub vm_backup_context_id: String,
    pub backup_job_id: String,
    pub disk_index: u32,
    pub vmware_disk_key: u32,
    pub size_gb: u64,
    pub disk_change_id: Option<String>,
    pub qcow2_path: Option<String>,
    pub bytes_transferred: u64,
    pub status: BackupDiskStatus,
    pub created_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl BackupDisk {
    /// VMware disk keys start at 2000 and increment per disk index.
    #[must_use]
    pub fn vmware_disk_key_for(disk_index: u32) -> u32 {
        2000 + disk_index
    }
}

// ── Restore Mount ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMountStatus {
    Mounting,
    Mounted,
    Unmounting,
    Failed,
    Unmounted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreMount {
    pub id: String,
    pub backup_disk_id: u64,
    pub mount_path: String,
    pub nbd_device: String,
    pub filesystem_type: Option<String>,
    pub mount_mode: String,
    pub status: RestoreMountStatus,
    pub partition_metadata: Option<String>,
    pub created_at: Timestamp,
    pub last_accessed_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub unmounted_at: Option<Timestamp>,
}

// ── Volume Snapshot Record ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSnapshotRecord {
    pub volume_id: String,
    pub snapshot_id: String,
    pub status: String,
    pub created_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        assert!(OperationStatus::Pending.can_advance_to(OperationStatus::Executing));
        assert!(OperationStatus::Executing.can_advance_to(OperationStatus::Completed));
        assert!(!OperationStatus::Completed.can_advance_to(OperationStatus::Executing));
        assert!(!OperationStatus::Failed.can_advance_to(OperationStatus::Completed));
    }

    #[test]
    fn operation_advance_rejects_regression() {
        let mut op = Operation::new(
            "op-1".into(),
            OperationType::Attach,
            OperationRequest::Attach {
                volume_id: "v-1".into(),
                vm_id: "vm-1".into(),
                want_export: false,
                want_persistent_name: false,
            },
            0,
        );
        op.advance(OperationStatus::Executing, 1).unwrap();
        op.advance(OperationStatus::Completed, 2).unwrap();
        assert!(op.advance(OperationStatus::Executing, 3).is_err());
        assert_eq!(op.completed_at, Some(2));
    }

    #[test]
    fn device_mapping_consistency_invariant() {
        let attached = DeviceMapping {
            volume_uuid: "u1".into(),
            volume_id_numeric: None,
            vm_id: "vm-1".into(),
            device_path: "/dev/vdb".into(),
            cloudstack_state: CloudStackState::Attached,
            linux_state: LinuxState::Detected,
            operation_mode: OperationMode::Controller,
            cloudstack_device_id: Some(1),
            requires_device_correlation: false,
            size: 10,
            persistent_name: None,
            last_sync: 0,
            created_at: 0,
            updated_at: 0,
        };
        assert!(!attached.device_path.is_empty());

        let detached = DeviceMapping {
            device_path: String::new(),
            cloudstack_state: CloudStackState::Detached,
            ..attached
        };
        assert!(detached.device_path.is_empty());
    }
}
