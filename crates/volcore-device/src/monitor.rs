//! Single-host block-device observer.
//!
//! Watches virtio block devices only (`/dev/vd?`), diffing successive
//! snapshots to emit `added`/`removed`/`changed` events. Polling the
//! snapshot at the same cadence as the coalescing window ("ad-hoc
//! polling" per the design note) means the diff itself does the
//! coalescing: several changes to the same path between two polls collapse
//! into the one event the diff produces, with no separate debounce buffer
//! needed.
//!
//! Event delivery uses a `tokio::sync::broadcast` channel: slow or absent
//! consumers never block the poller, and a receiver that falls behind
//! observes `RecvError::Lagged(n)` rather than the poller stalling —
//! the drop-oldest-with-a-logged-counter behaviour required here falls
//! directly out of that channel's own semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub size: u64,
    pub controller: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEventKind {
    Added,
    Removed,
    Changed,
}

#[derive(Debug, Clone)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub info: DeviceInfo,
    pub observed_at: u64,
}

/// Abstracts where device snapshots come from, so the monitor's diff/
/// coalesce/broadcast logic is testable without a real kernel.
#[async_trait]
pub trait UeventSource: Send + Sync {
    async fn snapshot(&self) -> Vec<DeviceInfo>;
}

/// Real source: polls `/proc/partitions` for `vd*` entries and stats
/// `/sys/block/<dev>/size` (512-byte sectors) for the kernel-authoritative
/// byte size.
pub struct ProcPartitionsSource {
    proc_partitions_path: String,
    sys_block_dir: String,
}

impl Default for ProcPartitionsSource {
    fn default() -> Self {
        Self {
            proc_partitions_path: "/proc/partitions".into(),
            sys_block_dir: "/sys/block".into(),
        }
    }
}

impl ProcPartitionsSource {
    /// For tests that want to point at fixture files instead of the real
    /// `/proc` and `/sys`.
    #[must_use]
    pub fn with_paths(proc_partitions_path: String, sys_block_dir: String) -> Self {
        Self {
            proc_partitions_path,
            sys_block_dir,
        }
    }

    fn parse_partitions(contents: &str) -> Vec<String> {
        contents
            .lines()
            .skip(1)
            .filter_map(|line| {
                let name = line.split_whitespace().last()?;
                // whole-disk virtio devices only: vda, vdb, ... (not vda1)
                if name.starts_with("vd") && name.chars().skip(2).all(|c| c.is_ascii_alphabetic()) {
                    Some(name.to_string())
                } else {
                    None
                }
            })
            .collect()
    }

    async fn read_size_bytes(&self, dev: &str) -> Option<u64> {
        let path = format!("{}/{dev}/size", self.sys_block_dir);
        let contents = tokio::fs::read_to_string(path).await.ok()?;
        let sectors: u64 = contents.trim().parse().ok()?;
        Some(sectors * 512)
    }
}

#[async_trait]
impl UeventSource for ProcPartitionsSource {
    async fn snapshot(&self) -> Vec<DeviceInfo> {
        let Ok(contents) = tokio::fs::read_to_string(&self.proc_partitions_path).await else {
            return Vec::new();
        };
        let mut devices = Vec::new();
        for dev in Self::parse_partitions(&contents) {
            if let Some(size) = self.read_size_bytes(&dev).await {
                devices.push(DeviceInfo {
                    path: format!("/dev/{dev}"),
                    size,
                    controller: "virtio".to_string(),
                });
            }
        }
        devices
    }
}

/// Test source: snapshots are whatever the test last pushed via `set`.
#[derive(Default)]
pub struct FakeUeventSource {
    devices: RwLock<Vec<DeviceInfo>>,
}

impl FakeUeventSource {
    pub fn set(&self, devices: Vec<DeviceInfo>) {
        *self.devices.write() = devices;
    }
}

#[async_trait]
impl UeventSource for FakeUeventSource {
    async fn snapshot(&self) -> Vec<DeviceInfo> {
        self.devices.read().clone()
    }
}

/// An immutable baseline the Device Correlator diffs against, per the
/// attach algorithm's "snapshot the current virtio device set before
/// calling the provider" step.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub devices: Vec<DeviceInfo>,
    pub taken_at: u64,
}

pub struct DeviceMonitor {
    source: Arc<dyn UeventSource>,
    current: RwLock<HashMap<String, DeviceInfo>>,
    events_tx: broadcast::Sender<DeviceEvent>,
    poll_interval: Duration,
    running: AtomicBool,
    dropped_events: AtomicU64,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    #[must_use]
    pub fn new(source: Arc<dyn UeventSource>, poll_interval: Duration, queue_capacity: usize) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(queue_capacity.max(1));
        Arc::new(Self {
            source,
            current: RwLock::new(HashMap::new()),
            events_tx,
            poll_interval,
            running: AtomicBool::new(false),
            dropped_events: AtomicU64::new(0),
            task: RwLock::new(None),
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            devices: self.current.read().values().cloned().collect(),
            taken_at: volcore_common::ids::now(),
        }
    }

    #[must_use]
    pub fn get_devices(&self) -> Vec<DeviceInfo> {
        self.current.read().values().cloned().collect()
    }

    #[must_use]
    pub fn get_device_by_path(&self, path: &str) -> Option<DeviceInfo> {
        self.current.read().get(path).cloned()
    }

    #[must_use]
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll_interval);
            while this.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                this.poll_once().await;
            }
        });
        *self.task.write() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.write().take() {
            handle.abort();
        }
    }

    async fn poll_once(&self) {
        let observed = self.source.snapshot().await;
        let observed_map: HashMap<String, DeviceInfo> =
            observed.into_iter().map(|d| (d.path.clone(), d)).collect();
        let now = volcore_common::ids::now();

        let mut events = Vec::new();
        {
            let current = self.current.read();
            for (path, info) in &observed_map {
                match current.get(path) {
                    None => events.push(DeviceEvent {
                        kind: DeviceEventKind::Added,
                        info: info.clone(),
                        observed_at: now,
                    }),
                    Some(prev) if prev.size != info.size => events.push(DeviceEvent {
                        kind: DeviceEventKind::Changed,
                        info: info.clone(),
                        observed_at: now,
                    }),
                    Some(_) => {}
                }
            }
            for (path, info) in current.iter() {
                if !observed_map.contains_key(path) {
                    events.push(DeviceEvent {
                        kind: DeviceEventKind::Removed,
                        info: info.clone(),
                        observed_at: now,
                    });
                }
            }
        }

        *self.current.write() = observed_map;

        for event in events {
            if self.events_tx.send(event).is_err() {
                // no subscribers; nothing dropped, nothing to deliver
            }
        }
    }

    /// A single receive with a deadline, per `WaitForDevice(timeout)`.
    pub async fn wait_for_device(&self, timeout: Duration) -> Option<DeviceEvent> {
        let mut rx = self.events_tx.subscribe();
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(event)) => Some(event),
            Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                self.dropped_events.fetch_add(n, Ordering::Relaxed);
                tracing::warn!(dropped = n, "device monitor subscriber lagged, events dropped");
                None
            }
            Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => None,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detects_added_and_removed_devices() {
        let source = Arc::new(FakeUeventSource::default());
        let monitor = DeviceMonitor::new(source.clone(), Duration::from_millis(20), 16);
        monitor.start();

        source.set(vec![DeviceInfo {
            path: "/dev/vdb".into(),
            size: 1024,
            controller: "virtio".into(),
        }]);

        let event = monitor.wait_for_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(event.kind, DeviceEventKind::Added);
        assert_eq!(event.info.path, "/dev/vdb");

        source.set(vec![]);
        let event = monitor.wait_for_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(event.kind, DeviceEventKind::Removed);

        monitor.stop();
    }

    #[tokio::test]
    async fn get_devices_reflects_latest_poll() {
        let source = Arc::new(FakeUeventSource::default());
        let monitor = DeviceMonitor::new(source.clone(), Duration::from_millis(20), 16);
        monitor.start();
        source.set(vec![DeviceInfo {
            path: "/dev/vdc".into(),
            size: 2048,
            controller: "virtio".into(),
        }]);
        monitor.wait_for_device(Duration::from_secs(2)).await;
        assert_eq!(monitor.get_device_by_path("/dev/vdc").unwrap().size, 2048);
        monitor.stop();
    }

    #[test]
    fn parse_partitions_filters_to_virtio_whole_disks() {
        let sample = "major minor  #blocks  name\n\
                        253        0   10485760 vda\n\
                        253        1    1048576 vda1\n\
                        253       16   10485760 vdb\n\
                          8        0   10485760 sda\n";
        let devices = ProcPartitionsSource::parse_partitions(sample);
        assert_eq!(devices, vec!["vda".to_string(), "vdb".to_string()]);
    }
}
