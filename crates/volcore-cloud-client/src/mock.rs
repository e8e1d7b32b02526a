//! In-memory `CloudClient` used by `volcore-core`'s own tests. Exported
//! behind `test-support` so production binaries never link it in.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::client::{CloudClient, CloudVolume, VolumeSpec};
use crate::error::{CloudError, CloudResult};
use crate::health::HealthSample;

struct MockState {
    volumes: HashMap<String, CloudVolume>,
    snapshots: HashMap<String, String>,
    next_id: u64,
}

pub struct MockCloudClient {
    state: Mutex<MockState>,
}

impl Default for MockCloudClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloudClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                volumes: HashMap::new(),
                snapshots: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn alloc_id(state: &mut MockState, prefix: &str) -> String {
        let id = format!("{prefix}-{}", state.next_id);
        state.next_id += 1;
        id
    }

    /// Test hook: seed a volume directly without going through `create_volume`.
    pub fn seed_volume(&self, volume: CloudVolume) {
        self.state.lock().volumes.insert(volume.volume_id.clone(), volume);
    }
}

#[async_trait]
impl CloudClient for MockCloudClient {
    async fn create_volume(&self, spec: VolumeSpec) -> CloudResult<String> {
        let mut state = self.state.lock();
        let id = Self::alloc_id(&mut state, "vol");
        state.volumes.insert(
            id.clone(),
            CloudVolume {
                volume_id: id.clone(),
                size_bytes: spec.size_bytes,
                attached_vm_id: None,
                cloudstack_device_id: None,
            },
        );
        Ok(id)
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> CloudResult<u32> {
        let mut state = self.state.lock();
        let ordinal = state
            .volumes
            .values()
            .filter(|v| v.attached_vm_id.as_deref() == Some(vm_id))
            .count() as u32;
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        volume.attached_vm_id = Some(vm_id.to_string());
        volume.cloudstack_device_id = Some(ordinal);
        Ok(ordinal)
    }

    async fn attach_volume_as_root(&self, volume_id: &str, vm_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        volume.attached_vm_id = Some(vm_id.to_string());
        volume.cloudstack_device_id = Some(0);
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))?;
        volume.attached_vm_id = None;
        volume.cloudstack_device_id = None;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        if state.volumes.remove(volume_id).is_none() {
            return Err(CloudError::NotFound(volume_id.to_string()));
        }
        Ok(())
    }

    async fn get_volume(&self, volume_id: &str) -> CloudResult<CloudVolume> {
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| CloudError::NotFound(volume_id.to_string()))
    }

    async fn list_volumes(&self, vm_id: &str) -> CloudResult<Vec<CloudVolume>> {
        Ok(self
            .state
            .lock()
            .volumes
            .values()
            .filter(|v| v.attached_vm_id.as_deref() == Some(vm_id))
            .cloned()
            .collect())
    }

    async fn power_off_vm(&self, _vm_id: &str) -> CloudResult<()> {
        Ok(())
    }

    async fn delete_vm(&self, vm_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        for volume in state.volumes.values_mut() {
            if volume.attached_vm_id.as_deref() == Some(vm_id) {
                volume.attached_vm_id = None;
                volume.cloudstack_device_id = None;
            }
        }
        Ok(())
    }

    async fn create_snapshot(&self, volume_id: &str) -> CloudResult<String> {
        let mut state = self.state.lock();
        if !state.volumes.contains_key(volume_id) {
            return Err(CloudError::NotFound(volume_id.to_string()));
        }
        let id = Self::alloc_id(&mut state, "snap");
        state.snapshots.insert(id.clone(), volume_id.to_string());
        Ok(id)
    }

    async fn revert_snapshot(&self, volume_id: &str, snapshot_id: &str) -> CloudResult<()> {
        let state = self.state.lock();
        match state.snapshots.get(snapshot_id) {
            Some(v) if v == volume_id => Ok(()),
            Some(_) => Err(CloudError::Precondition("snapshot belongs to a different volume".into())),
            None => Err(CloudError::NotFound(snapshot_id.to_string())),
        }
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> CloudResult<()> {
        let mut state = self.state.lock();
        if state.snapshots.remove(snapshot_id).is_none() {
            return Err(CloudError::NotFound(snapshot_id.to_string()));
        }
        Ok(())
    }

    fn last_health(&self, _n: usize) -> Vec<HealthSample> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn attach_assigns_increasing_ordinals() {
        let client = MockCloudClient::new();
        let v1 = client.create_volume(VolumeSpec { size_bytes: 10, pool: "p".into() }).await.unwrap();
        let v2 = client.create_volume(VolumeSpec { size_bytes: 10, pool: "p".into() }).await.unwrap();
        let o1 = client.attach_volume(&v1, "vm-1").await.unwrap();
        let o2 = client.attach_volume(&v2, "vm-1").await.unwrap();
        assert_eq!(o1, 0);
        assert_eq!(o2, 1);
    }

    #[tokio::test]
    async fn detach_then_get_reflects_state() {
        let client = MockCloudClient::new();
        let v1 = client.create_volume(VolumeSpec { size_bytes: 10, pool: "p".into() }).await.unwrap();
        client.attach_volume(&v1, "vm-1").await.unwrap();
        client.detach_volume(&v1).await.unwrap();
        let volume = client.get_volume(&v1).await.unwrap();
        assert!(volume.attached_vm_id.is_none());
    }

    #[tokio::test]
    async fn revert_snapshot_rejects_mismatched_volume() {
        let client = MockCloudClient::new();
        let v1 = client.create_volume(VolumeSpec { size_bytes: 10, pool: "p".into() }).await.unwrap();
        let v2 = client.create_volume(VolumeSpec { size_bytes: 10, pool: "p".into() }).await.unwrap();
        let snap = client.create_snapshot(&v1).await.unwrap();
        let err = client.revert_snapshot(&v2, &snap).await.unwrap_err();
        assert!(matches!(err, CloudError::Precondition(_)));
    }
}
