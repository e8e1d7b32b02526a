//! Volume Operations Service — the serialization core.
//!
//! Every caller-visible volume mutation funnels through here: open an
//! Operation, talk to the cloud client, correlate/persist the device
//! mapping, optionally wire up an NBD export and a persistent-name alias,
//! close the Operation. Mutations against the same volume or VM are
//! serialized via `VolumeLocks`; mutations against disjoint volumes run
//! concurrently.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use volcore_cloud_client::CloudClient;
use volcore_common::{
    ids, CloudStackState, CoreError, CoreResult, DeviceMapping, LinuxState, NbdExport, NbdExportStatus, Operation,
    OperationMode, OperationRequest, OperationResponse, OperationStatus, OperationType, VolumeSnapshotRecord,
};
use volcore_device::{persistent_name, DeviceEventKind, DeviceMonitor, DeviceSnapshot, PersistentNameLayer};
use volcore_nbd::{FragmentWriter, ReloadCoalescer};
use volcore_repository::Repository;

use crate::correlator::{self, CorrelationCandidate, CorrelationConfig, CorrelationError, CorrelationExpectation};
use crate::locks::VolumeLocks;
use crate::recovery::StateRecovery;

pub struct VolumeOperationsServiceConfig {
    pub attach_timeout: Duration,
    pub detach_timeout: Duration,
    /// Port the single, shared `nbd-server` process listens on. Every
    /// export is served off this one port; exports are distinguished by
    /// name, not port, per §4.5's data model.
    pub nbd_base_port: u16,
    pub correlation: CorrelationConfig,
}

impl Default for VolumeOperationsServiceConfig {
    fn default() -> Self {
        Self {
            attach_timeout: Duration::from_secs(30),
            detach_timeout: Duration::from_secs(30),
            nbd_base_port: 10809,
            correlation: CorrelationConfig::default(),
        }
    }
}

pub struct VolumeOperationsService {
    cloud: Arc<dyn CloudClient>,
    devices: Arc<DeviceMonitor>,
    names: PersistentNameLayer,
    fragments: FragmentWriter,
    reload: Arc<ReloadCoalescer>,
    repo: Arc<dyn Repository>,
    locks: VolumeLocks,
    recovery: Arc<StateRecovery>,
    config: VolumeOperationsServiceConfig,
}

impl VolumeOperationsService {
    #[must_use]
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        devices: Arc<DeviceMonitor>,
        names: PersistentNameLayer,
        fragments: FragmentWriter,
        reload: Arc<ReloadCoalescer>,
        repo: Arc<dyn Repository>,
        recovery: Arc<StateRecovery>,
        config: VolumeOperationsServiceConfig,
    ) -> Self {
        Self {
            cloud,
            devices,
            names,
            fragments,
            reload,
            repo,
            locks: VolumeLocks::new(),
            recovery,
            config,
        }
    }

    fn open_operation(&self, op_type: OperationType, request: OperationRequest) -> CoreResult<Operation> {
        let now = ids::now();
        let op = Operation::new(ids::new_operation_id(), op_type, request, now);
        self.repo.create_operation(&op)?;
        Ok(op)
    }

    fn advance(&self, op: &mut Operation, next: OperationStatus) -> CoreResult<()> {
        let now = ids::now();
        op.advance(next, now).map_err(CoreError::Unrecoverable)?;
        self.repo.update_operation(op)?;
        Ok(())
    }

    fn fail(&self, mut op: Operation, reason: String) -> CoreResult<Operation> {
        op.error = Some(reason);
        self.advance(&mut op, OperationStatus::Failed)?;
        Ok(op)
    }

    async fn remove_export(&self, export_name: &str) {
        if let Err(e) = self.fragments.remove(export_name).await {
            tracing::warn!(export_name, error = %e, "failed to remove nbd fragment during rollback");
        }
        self.reload.request_reload();
    }

    /// Best-effort rollback after a failure past the point the cloud
    /// volume was actually attached: undo whatever of {export,
    /// persistent-name} was created, detach in the cloud, then fail the
    /// Operation. Rollback errors are appended to the failure reason, never
    /// replacing it.
    async fn rollback_and_fail(
        &self,
        mut op: Operation,
        volume_id: &str,
        export_name: Option<&str>,
        persistent_name: Option<&str>,
        reason: String,
    ) -> CoreResult<Operation> {
        let mut rollback_errors = Vec::new();

        if let Some(name) = export_name {
            self.remove_export(name).await;
            if let Ok(Some(export)) = self.repo.get_export_for_volume(volume_id) {
                if let Err(e) = self.repo.delete_export(&export.id) {
                    rollback_errors.push(e.to_string());
                }
            }
        }
        if let Some(name) = persistent_name {
            self.names.remove(name).await;
        }
        if let Err(e) = self.cloud.detach_volume(volume_id).await {
            rollback_errors.push(format!("cloud detach during rollback: {e}"));
        }

        let message = if rollback_errors.is_empty() {
            reason
        } else {
            format!("{reason} (rollback errors: {})", rollback_errors.join("; "))
        };
        op.error = Some(message);
        self.advance(&mut op, OperationStatus::Failed)?;
        Ok(op)
    }

    async fn correlate_with_deadline(
        &self,
        baseline: &DeviceSnapshot,
        excluded: &HashSet<String>,
        expectation: &CorrelationExpectation,
        deadline: Duration,
    ) -> CoreResult<String> {
        let baseline_paths: HashSet<String> = baseline.devices.iter().map(|d| d.path.clone()).collect();
        let mut candidates: Vec<CorrelationCandidate> = Vec::new();
        let deadline_at = tokio::time::Instant::now() + deadline;

        loop {
            let remaining = deadline_at.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.devices.wait_for_device(remaining).await {
                Some(event) if event.kind == DeviceEventKind::Added && !baseline_paths.contains(&event.info.path) => {
                    candidates.push(CorrelationCandidate {
                        info: event.info,
                        added_at: event.observed_at,
                    });
                    match correlator::correlate(&candidates, excluded, expectation, &self.config.correlation) {
                        Ok(device) => return Ok(device.path),
                        Err(CorrelationError::AmbiguousTie) => {
                            return Err(CoreError::Correlation(
                                "device correlation tied between multiple candidates".into(),
                            ));
                        }
                        Err(_) => continue,
                    }
                }
                _ => continue,
            }
        }

        match correlator::correlate(&candidates, excluded, expectation, &self.config.correlation) {
            Ok(device) => Ok(device.path),
            Err(e) => Err(CoreError::Correlation(e.to_string())),
        }
    }

    async fn create_export_for(&self, volume_id: &str, device_path: &str) -> CoreResult<String> {
        let port = self.config.nbd_base_port;
        let export_name = format!("export-{volume_id}");
        self.fragments.write(&export_name, device_path, port).await?;
        self.reload.request_reload();
        volcore_nbd::verify::verify(port, &export_name).await?;

        let now = ids::now();
        let export = NbdExport {
            id: ids::new_entity_id(),
            job_id: None,
            vm_context_id: None,
            volume_id: volume_id.to_string(),
            vm_disk_id: None,
            export_name: export_name.clone(),
            port,
            device_path: device_path.to_string(),
            config_path: self.fragments.config_path(&export_name).to_string_lossy().to_string(),
            status: NbdExportStatus::Active,
            created_at: now,
            updated_at: now,
            metadata: Default::default(),
        };
        self.repo.create_export(&export)?;
        Ok(export_name)
    }

    // ── Mutations ────────────────────────────────────────────────────────

    pub async fn create_volume(&self, size_bytes: u64, pool: &str) -> CoreResult<Operation> {
        let mut op = self.open_operation(
            OperationType::Create,
            OperationRequest::Create {
                size_bytes,
                pool: pool.to_string(),
            },
        )?;
        self.advance(&mut op, OperationStatus::Executing)?;

        let volume_id = match self
            .cloud
            .create_volume(volcore_cloud_client::VolumeSpec {
                size_bytes,
                pool: pool.to_string(),
            })
            .await
        {
            Ok(id) => id,
            Err(e) => return self.fail(op, format!("cloud create_volume failed: {e}")),
        };

        op.response = Some(OperationResponse {
            volume_id: Some(volume_id),
            ..Default::default()
        });
        self.advance(&mut op, OperationStatus::Completed)?;
        Ok(op)
    }

    pub async fn attach_volume(
        &self,
        volume_id: &str,
        vm_id: &str,
        want_export: bool,
        want_persistent_name: bool,
    ) -> CoreResult<Operation> {
        let _guard = self.locks.acquire(Some(volume_id), Some(vm_id)).await;
        self.attach_volume_inner(volume_id, vm_id, want_export, want_persistent_name, OperationMode::Controller, None)
            .await
    }

    /// Only permitted when the target VM is powered off. The cloud provider
    /// itself enforces this precondition on the attach-as-root call (this
    /// abstraction has no separate power-state query endpoint); a
    /// `CloudError::Precondition` from the provider surfaces as a failed
    /// Operation rather than a generic transient error.
    pub async fn attach_volume_as_root(&self, volume_id: &str, vm_id: &str) -> CoreResult<Operation> {
        let _guard = self.locks.acquire(Some(volume_id), Some(vm_id)).await;
        self.attach_volume_inner(volume_id, vm_id, false, false, OperationMode::Failover, Some(0))
            .await
    }

    async fn attach_volume_inner(
        &self,
        volume_id: &str,
        vm_id: &str,
        want_export: bool,
        want_persistent_name: bool,
        mode: OperationMode,
        forced_ordinal: Option<u32>,
    ) -> CoreResult<Operation> {
        let op_type = if forced_ordinal.is_some() {
            OperationType::AttachRoot
        } else {
            OperationType::Attach
        };
        let request = if forced_ordinal.is_some() {
            OperationRequest::AttachRoot {
                volume_id: volume_id.to_string(),
                vm_id: vm_id.to_string(),
            }
        } else {
            OperationRequest::Attach {
                volume_id: volume_id.to_string(),
                vm_id: vm_id.to_string(),
                want_export,
                want_persistent_name,
            }
        };

        let mut op = self.open_operation(op_type, request)?;
        self.advance(&mut op, OperationStatus::Executing)?;

        let baseline = self.devices.snapshot();

        let cloudstack_device_id = if let Some(ordinal) = forced_ordinal {
            if let Err(e) = self.cloud.attach_volume_as_root(volume_id, vm_id).await {
                return self.fail(op, format!("cloud attach_volume_as_root failed: {e}"));
            }
            ordinal
        } else {
            match self.cloud.attach_volume(volume_id, vm_id).await {
                Ok(id) => id,
                Err(e) => return self.fail(op, format!("cloud attach_volume failed: {e}")),
            }
        };

        let expected_size = match self.cloud.get_volume(volume_id).await {
            Ok(v) => v.size_bytes,
            Err(e) => {
                return self
                    .rollback_and_fail(op, volume_id, None, None, format!("failed to read attached volume size: {e}"))
                    .await
            }
        };

        let excluded: HashSet<String> = self
            .repo
            .list_all_mappings()?
            .into_iter()
            .map(|m| m.device_path)
            .collect();
        let expectation = CorrelationExpectation {
            expected_size_bytes: expected_size,
            cloudstack_device_id: Some(cloudstack_device_id),
        };

        let device_path = match self
            .correlate_with_deadline(&baseline, &excluded, &expectation, self.config.attach_timeout)
            .await
        {
            Ok(path) => path,
            Err(e) => return self.rollback_and_fail(op, volume_id, None, None, e.to_string()).await,
        };

        let now = ids::now();
        let mut mapping = DeviceMapping {
            volume_uuid: volume_id.to_string(),
            volume_id_numeric: None,
            vm_id: vm_id.to_string(),
            device_path: device_path.clone(),
            cloudstack_state: CloudStackState::Attached,
            linux_state: LinuxState::Detected,
            operation_mode: mode,
            cloudstack_device_id: Some(cloudstack_device_id),
            requires_device_correlation: false,
            size: expected_size,
            persistent_name: None,
            last_sync: now,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.repo.create_mapping(&mapping) {
            return self
                .rollback_and_fail(op, volume_id, None, None, format!("failed to persist device mapping: {e}"))
                .await;
        }

        let mut export_name = None;
        if want_export {
            match self.create_export_for(volume_id, &device_path).await {
                Ok(name) => export_name = Some(name),
                Err(e) => {
                    return self
                        .rollback_and_fail(op, volume_id, None, None, format!("nbd export setup failed: {e}"))
                        .await
                }
            }
        }

        let mut alias_name = None;
        if want_persistent_name {
            let name = persistent_name::derive_name(vm_id, cloudstack_device_id);
            match self.names.create(&name, &device_path).await {
                Ok(alias_path) => {
                    mapping.persistent_name = Some(name.clone());
                    mapping.device_path = alias_path;
                    mapping.updated_at = ids::now();
                    if let Err(e) = self.repo.update_mapping(&mapping) {
                        return self
                            .rollback_and_fail(
                                op,
                                volume_id,
                                export_name.as_deref(),
                                Some(&name),
                                format!("failed to persist persistent-name alias: {e}"),
                            )
                            .await;
                    }
                    alias_name = Some(name);
                }
                Err(e) => {
                    return self
                        .rollback_and_fail(
                            op,
                            volume_id,
                            export_name.as_deref(),
                            None,
                            format!("persistent-name creation failed: {e}"),
                        )
                        .await
                }
            }
        }

        op.response = Some(OperationResponse {
            volume_id: Some(volume_id.to_string()),
            cloudstack_device_id: Some(cloudstack_device_id),
            device_path: Some(mapping.device_path.clone()),
            export_name,
            persistent_name: alias_name,
            change_id_status: None,
            raw: None,
        });
        self.advance(&mut op, OperationStatus::Completed)?;
        Ok(op)
    }

    pub async fn detach_volume(&self, volume_id: &str) -> CoreResult<Operation> {
        let mapping = self.get_mapping_with_recovery(volume_id).await?;
        let _guard = self.locks.acquire(Some(volume_id), Some(&mapping.vm_id)).await;

        let mut op = self.open_operation(
            OperationType::Detach,
            OperationRequest::Detach {
                volume_id: volume_id.to_string(),
            },
        )?;
        self.advance(&mut op, OperationStatus::Executing)?;

        if let Ok(Some(export)) = self.repo.get_export_for_volume(volume_id) {
            self.remove_export(&export.export_name).await;
            if let Err(e) = self.repo.delete_export(&export.id) {
                tracing::warn!(volume_id, error = %e, "failed to delete export row during detach");
            }
        }
        if let Some(name) = &mapping.persistent_name {
            self.names.remove(name).await;
        }

        if let Err(e) = self.cloud.detach_volume(volume_id).await {
            return self.fail(op, format!("cloud detach_volume failed: {e}"));
        }

        match tokio::time::timeout(self.config.detach_timeout, self.wait_for_removal(&mapping.device_path)).await {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                tracing::warn!(
                    volume_id,
                    device_path = %mapping.device_path,
                    "device removal not observed before detach timeout, proceeding on cloud job status"
                );
            }
        }

        self.repo.delete_mapping(volume_id)?;
        self.advance(&mut op, OperationStatus::Completed)?;
        Ok(op)
    }

    async fn wait_for_removal(&self, device_path: &str) -> bool {
        loop {
            if self.devices.get_device_by_path(device_path).is_none() {
                return true;
            }
            let Some(event) = self.devices.wait_for_device(Duration::from_secs(30)).await else {
                continue;
            };
            if event.kind == DeviceEventKind::Removed && event.info.path == device_path {
                return true;
            }
        }
    }

    pub async fn delete_volume(&self, volume_id: &str) -> CoreResult<Operation> {
        let mut op = self.open_operation(
            OperationType::Delete,
            OperationRequest::Delete {
                volume_id: volume_id.to_string(),
            },
        )?;
        self.advance(&mut op, OperationStatus::Executing)?;

        if let Ok(Some(mapping)) = self.repo.get_mapping(volume_id) {
            if mapping.cloudstack_state == CloudStackState::Attached {
                return self.fail(op, format!("volume {volume_id} must be detached before delete"));
            }
            self.repo.delete_mapping(volume_id)?;
        }

        if let Err(e) = self.cloud.delete_volume(volume_id).await {
            return self.fail(op, format!("cloud delete_volume failed: {e}"));
        }

        op.response = Some(OperationResponse {
            volume_id: Some(volume_id.to_string()),
            ..Default::default()
        });
        self.advance(&mut op, OperationStatus::Completed)?;
        Ok(op)
    }

    /// Composite, idempotent: every step proceeds through failure,
    /// accumulating error text rather than stopping early.
    pub async fn cleanup_test_failover(&self, vm_id: &str, data_volume_ids: &[String]) -> CoreResult<Operation> {
        let _guard = self.locks.acquire(None, Some(vm_id)).await;
        let mut op = self.open_operation(
            OperationType::Cleanup,
            OperationRequest::Cleanup { vm_id: vm_id.to_string() },
        )?;
        self.advance(&mut op, OperationStatus::Executing)?;

        let mut errors = Vec::new();

        if let Err(e) = self.cloud.power_off_vm(vm_id).await {
            errors.push(format!("power_off_vm: {e}"));
        }
        if let Err(e) = self.cloud.delete_vm(vm_id).await {
            errors.push(format!("delete_vm: {e}"));
        }

        for volume_id in data_volume_ids {
            if let Ok(Some(record)) = self.repo.get_snapshot_record(volume_id) {
                if let Err(e) = self.cloud.revert_snapshot(volume_id, &record.snapshot_id).await {
                    errors.push(format!("revert_snapshot({volume_id}): {e}"));
                }
                if let Err(e) = self.cloud.delete_snapshot(&record.snapshot_id).await {
                    errors.push(format!("delete_snapshot({volume_id}): {e}"));
                }
                if let Err(e) = self.repo.delete_snapshot_record(&record.snapshot_id) {
                    errors.push(format!("delete_snapshot_record({volume_id}): {e}"));
                }
            }

            match self.detach_volume(volume_id).await {
                Ok(detach_op) if detach_op.status == OperationStatus::Failed => {
                    errors.push(format!(
                        "detach({volume_id}): {}",
                        detach_op.error.unwrap_or_default()
                    ));
                }
                Err(e) => errors.push(format!("detach({volume_id}): {e}")),
                Ok(_) => {}
            }

            match self.delete_volume(volume_id).await {
                Ok(delete_op) if delete_op.status == OperationStatus::Failed => {
                    errors.push(format!(
                        "delete({volume_id}): {}",
                        delete_op.error.unwrap_or_default()
                    ));
                }
                Err(e) => errors.push(format!("delete({volume_id}): {e}")),
                Ok(_) => {}
            }
        }

        if errors.is_empty() {
            self.advance(&mut op, OperationStatus::Completed)?;
        } else {
            op.error = Some(errors.join("; "));
            self.advance(&mut op, OperationStatus::Failed)?;
        }
        Ok(op)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn get_volume_status(&self, volume_id: &str) -> CoreResult<Option<DeviceMapping>> {
        Ok(self.repo.get_mapping(volume_id)?)
    }

    pub fn get_device_mapping(&self, volume_id: &str) -> CoreResult<Option<DeviceMapping>> {
        Ok(self.repo.get_mapping(volume_id)?)
    }

    pub fn get_volume_for_device(&self, device_path: &str) -> CoreResult<Option<DeviceMapping>> {
        Ok(self.repo.get_mapping_by_device(device_path)?)
    }

    pub fn list_volumes_for_vm(&self, vm_id: &str) -> CoreResult<Vec<DeviceMapping>> {
        Ok(self.repo.list_mappings_for_vm(vm_id)?)
    }

    pub fn get_operation(&self, id: &str) -> CoreResult<Option<Operation>> {
        Ok(self.repo.get_operation(id)?)
    }

    pub fn list_operations(&self, volume_id: &str) -> CoreResult<Vec<Operation>> {
        Ok(self.repo.list_operations_for_volume(volume_id)?)
    }

    /// Block until `id` reaches a terminal status or `deadline` elapses.
    pub async fn wait_for_operation(&self, id: &str, deadline: Duration) -> CoreResult<Operation> {
        let deadline_at = tokio::time::Instant::now() + deadline;
        loop {
            let op = self
                .repo
                .get_operation(id)?
                .ok_or_else(|| CoreError::NotFound(format!("operation {id}")))?;
            if op.status.is_terminal() {
                return Ok(op);
            }
            if tokio::time::Instant::now() >= deadline_at {
                return Err(CoreError::Timeout(deadline));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Every read/write dereferencing a mapping retries exactly once
    /// through State Recovery on "mapping not found" per §4.6.
    async fn get_mapping_with_recovery(&self, volume_id: &str) -> CoreResult<DeviceMapping> {
        if let Some(mapping) = self.repo.get_mapping(volume_id)? {
            return Ok(mapping);
        }
        self.recovery.recover_single_volume(volume_id).await
    }

    // ── NBD CRUD passthroughs ────────────────────────────────────────────

    pub fn get_export(&self, id: &str) -> CoreResult<Option<NbdExport>> {
        Ok(self.repo.get_export(id)?)
    }

    pub fn get_export_for_volume(&self, volume_id: &str) -> CoreResult<Option<NbdExport>> {
        Ok(self.repo.get_export_for_volume(volume_id)?)
    }

    pub fn delete_export_row(&self, id: &str) -> CoreResult<()> {
        Ok(self.repo.delete_export(id)?)
    }

    pub fn record_snapshot(&self, volume_id: &str, snapshot_id: &str) -> CoreResult<()> {
        Ok(self.repo.create_snapshot_record(&VolumeSnapshotRecord {
            volume_id: volume_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            status: "pending".to_string(),
            created_at: ids::now(),
        })?)
    }
}
