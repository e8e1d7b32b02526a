//! Keyed per-resource async locking.
//!
//! Mutations targeting the same `volume_id` or `vm_id` must be serialized;
//! mutations against disjoint volumes may proceed in parallel. Each
//! mutation acquires the volume lock before the VM lock, a fixed order
//! that rules out deadlock cycles between the two registries.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct KeyedLockRegistry {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyedLockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

/// Holds whichever of the volume/VM locks a mutation acquired, in
/// acquisition order (volume first). Dropped together at the end of the
/// mutation's scope.
#[allow(dead_code)]
pub struct MutationGuard {
    volume: Option<OwnedMutexGuard<()>>,
    vm: Option<OwnedMutexGuard<()>>,
}

pub struct VolumeLocks {
    volumes: KeyedLockRegistry,
    vms: KeyedLockRegistry,
}

impl Default for VolumeLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeLocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            volumes: KeyedLockRegistry::new(),
            vms: KeyedLockRegistry::new(),
        }
    }

    /// Acquire the locks relevant to this mutation: volume lock first,
    /// then VM lock, never the reverse.
    pub async fn acquire(&self, volume_id: Option<&str>, vm_id: Option<&str>) -> MutationGuard {
        let volume = match volume_id {
            Some(id) => Some(self.volumes.lock(id).await),
            None => None,
        };
        let vm = match vm_id {
            Some(id) => Some(self.vms.lock(id).await),
            None => None,
        };
        MutationGuard { volume, vm }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_volume_mutations_are_serialized() {
        let locks = Arc::new(VolumeLocks::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let locks = locks.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(Some("v1"), None).await;
                let before = counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                assert_eq!(counter.load(Ordering::SeqCst), before + 1);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }

    #[tokio::test]
    async fn disjoint_volumes_do_not_block_each_other() {
        let locks = Arc::new(VolumeLocks::new());
        let g1 = locks.acquire(Some("v1"), None).await;
        let fut = locks.acquire(Some("v2"), None);
        let result = tokio::time::timeout(Duration::from_millis(100), fut).await;
        assert!(result.is_ok());
        drop(g1);
    }
}
