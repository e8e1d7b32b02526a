//! The `CloudClient` abstraction point.
//!
//! One async trait, `#[async_trait]`-erased so it can be held as
//! `Arc<dyn CloudClient>` across the Volume Operations Service, the
//! pattern used for `ExternalPolicyEvaluator` in the auth layer: a thin
//! trait object boundary in front of a concrete HTTP (or, in tests, mock)
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CloudResult;
use crate::health::HealthSample;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub size_bytes: u64,
    pub pool: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudVolume {
    pub volume_id: String,
    pub size_bytes: u64,
    pub attached_vm_id: Option<String>,
    pub cloudstack_device_id: Option<u32>,
}

/// Provider job lifecycle as observed by the poller in `http.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[async_trait]
pub trait CloudClient: Send + Sync {
    async fn create_volume(&self, spec: VolumeSpec) -> CloudResult<String>;

    /// Returns the provider-assigned device ordinal (`cloudstack_device_id`).
    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> CloudResult<u32>;

    async fn attach_volume_as_root(&self, volume_id: &str, vm_id: &str) -> CloudResult<()>;

    async fn detach_volume(&self, volume_id: &str) -> CloudResult<()>;

    async fn delete_volume(&self, volume_id: &str) -> CloudResult<()>;

    async fn get_volume(&self, volume_id: &str) -> CloudResult<CloudVolume>;

    async fn list_volumes(&self, vm_id: &str) -> CloudResult<Vec<CloudVolume>>;

    async fn power_off_vm(&self, vm_id: &str) -> CloudResult<()>;

    async fn delete_vm(&self, vm_id: &str) -> CloudResult<()>;

    async fn create_snapshot(&self, volume_id: &str) -> CloudResult<String>;

    async fn revert_snapshot(&self, volume_id: &str, snapshot_id: &str) -> CloudResult<()>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> CloudResult<()>;

    /// Most recent response-time samples, newest first.
    fn last_health(&self, n: usize) -> Vec<HealthSample>;
}
