//! State Recovery.
//!
//! On-demand, single-volume healing for the "mapping not found" retry path
//! in the Volume Operations Service, plus a periodic full-system
//! reconciliation tick. Health bit and aggregate counters survive across
//! ticks without a lock, following `SmartMonitor`'s `check_count`/
//! `check_errors` atomics.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use volcore_cloud_client::CloudClient;
use volcore_common::{CloudStackState, CoreError, CoreResult, DeviceMapping, LinuxState, OperationMode};
use volcore_device::DeviceMonitor;
use volcore_repository::Repository;

use crate::correlator::{self, CorrelationCandidate, CorrelationConfig, CorrelationExpectation};

const STALE_OPERATION_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default)]
pub struct RecoveryResult {
    pub volumes_recovered: u64,
    pub volumes_orphaned: u64,
    pub mappings_created: u64,
    pub mappings_fixed: u64,
    pub duration: Duration,
    pub errors: Vec<String>,
}

#[derive(Default)]
pub struct RecoveryCounters {
    runs: AtomicU64,
    errors: AtomicU64,
    last_run_at: AtomicU64,
}

impl RecoveryCounters {
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn last_run_at(&self) -> u64 {
        self.last_run_at.load(Ordering::Relaxed)
    }
}

pub struct StateRecovery {
    cloud: Arc<dyn CloudClient>,
    devices: Arc<DeviceMonitor>,
    repo: Arc<dyn Repository>,
    correlation: CorrelationConfig,
    counters: RecoveryCounters,
    healthy: AtomicBool,
}

impl StateRecovery {
    #[must_use]
    pub fn new(
        cloud: Arc<dyn CloudClient>,
        devices: Arc<DeviceMonitor>,
        repo: Arc<dyn Repository>,
        correlation: CorrelationConfig,
    ) -> Self {
        Self {
            cloud,
            devices,
            repo,
            correlation,
            counters: RecoveryCounters::default(),
            healthy: AtomicBool::new(true),
        }
    }

    #[must_use]
    pub fn counters(&self) -> &RecoveryCounters {
        &self.counters
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Given `volume_id`, rebuild a Device Mapping from the cloud's and the
    /// kernel's current state, without a baseline (no Operation exists to
    /// diff against).
    pub async fn recover_single_volume(&self, volume_id: &str) -> CoreResult<DeviceMapping> {
        let cloud_volume = self
            .cloud
            .get_volume(volume_id)
            .await
            .map_err(|e| CoreError::Unrecoverable(format!("no such cloud volume {volume_id}: {e}")))?;

        let Some(vm_id) = cloud_volume.attached_vm_id.clone() else {
            return Err(CoreError::Unrecoverable(format!("volume {volume_id} is not attached to any vm")));
        };

        let excluded: HashSet<String> = self
            .repo
            .list_all_mappings()?
            .into_iter()
            .filter(|m| m.volume_uuid != volume_id)
            .map(|m| m.device_path)
            .collect();

        let candidates: Vec<CorrelationCandidate> = self
            .devices
            .get_devices()
            .into_iter()
            .map(|info| CorrelationCandidate {
                info,
                added_at: volcore_common::ids::now(),
            })
            .collect();

        let expectation = CorrelationExpectation {
            expected_size_bytes: cloud_volume.size_bytes,
            cloudstack_device_id: cloud_volume.cloudstack_device_id,
        };

        let device = correlator::correlate(&candidates, &excluded, &expectation, &self.correlation)
            .map_err(|e| CoreError::Unrecoverable(format!("no correlatable device for {volume_id}: {e}")))?;

        if let Some(existing) = self.repo.get_mapping_by_device(&device.path)? {
            if existing.volume_uuid != volume_id {
                return Err(CoreError::Unrecoverable(format!(
                    "device {} already mapped to a different volume ({})",
                    device.path, existing.volume_uuid
                )));
            }
        }

        let now = volcore_common::ids::now();
        let mapping = DeviceMapping {
            volume_uuid: volume_id.to_string(),
            volume_id_numeric: None,
            vm_id,
            device_path: device.path,
            cloudstack_state: CloudStackState::Attached,
            linux_state: LinuxState::Detected,
            operation_mode: OperationMode::Controller,
            cloudstack_device_id: cloud_volume.cloudstack_device_id,
            requires_device_correlation: false,
            size: cloud_volume.size_bytes,
            persistent_name: None,
            last_sync: now,
            created_at: now,
            updated_at: now,
        };
        self.repo.create_mapping(&mapping)?;
        Ok(mapping)
    }

    /// Full-system reconciliation: recover missing mappings, verify
    /// existing ones, and flag stale Operations. Intended to be driven by
    /// a `tokio::time::interval` in the daemon (default every 5 minutes).
    pub async fn run_periodic(&self) -> RecoveryResult {
        let started = Instant::now();
        let mut result = RecoveryResult::default();

        let mappings = match self.repo.list_all_mappings() {
            Ok(m) => m,
            Err(e) => {
                result.errors.push(format!("failed to list mappings: {e}"));
                self.finish(started, &mut result);
                return result;
            }
        };
        let vm_ids: std::collections::HashSet<String> = mappings.iter().map(|m| m.vm_id.clone()).collect();

        for vm_id in vm_ids {
            let cloud_volumes = match self.cloud.list_volumes(&vm_id).await {
                Ok(v) => v,
                Err(e) => {
                    result.errors.push(format!("list_volumes({vm_id}): {e}"));
                    continue;
                }
            };

            for cloud_volume in cloud_volumes {
                match self.repo.get_mapping(&cloud_volume.volume_id) {
                    Ok(Some(mapping)) => {
                        if let Some(device) = self.devices.get_device_by_path(&mapping.device_path) {
                            let drift = device.size.abs_diff(cloud_volume.size_bytes);
                            if drift > self.correlation.size_tolerance_bytes {
                                tracing::warn!(
                                    volume_id = %cloud_volume.volume_id,
                                    device_path = %mapping.device_path,
                                    device_size = device.size,
                                    cloud_size = cloud_volume.size_bytes,
                                    drift_bytes = drift,
                                    "size drift beyond tolerance detected, not auto-fixing"
                                );
                            }
                            continue;
                        }
                        match self.recover_single_volume(&cloud_volume.volume_id).await {
                            Ok(_) => result.mappings_fixed += 1,
                            Err(e) => result.errors.push(format!("verify({}): {e}", cloud_volume.volume_id)),
                        }
                    }
                    Ok(None) => match self.recover_single_volume(&cloud_volume.volume_id).await {
                        Ok(_) => {
                            result.volumes_recovered += 1;
                            result.mappings_created += 1;
                        }
                        Err(e) => {
                            result.volumes_orphaned += 1;
                            result.errors.push(format!("recover({}): {e}", cloud_volume.volume_id));
                        }
                    },
                    Err(e) => result.errors.push(format!("get_mapping({}): {e}", cloud_volume.volume_id)),
                }
            }
        }

        let stale_cutoff = volcore_common::ids::now().saturating_sub(STALE_OPERATION_AGE.as_secs());
        match self.repo.list_stale_executing_operations(stale_cutoff) {
            Ok(stale) if !stale.is_empty() => {
                tracing::warn!(count = stale.len(), "stale executing operations detected during recovery tick");
                for op in stale {
                    if let Some(volume_id) = &op.volume_id {
                        if let Err(e) = self.recover_single_volume(volume_id).await {
                            result.errors.push(format!("stale-op recovery({volume_id}): {e}"));
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => result.errors.push(format!("list_stale_executing_operations: {e}")),
        }

        self.finish(started, &mut result);
        result
    }

    fn finish(&self, started: Instant, result: &mut RecoveryResult) {
        result.duration = started.elapsed();
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        self.counters.last_run_at.store(volcore_common::ids::now(), Ordering::Relaxed);
        if result.errors.is_empty() {
            self.healthy.store(true, Ordering::Relaxed);
        } else {
            self.counters.errors.fetch_add(result.errors.len() as u64, Ordering::Relaxed);
            self.healthy.store(false, Ordering::Relaxed);
        }
    }
}
