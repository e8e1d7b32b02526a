//! Device Monitor and Persistent-Name Layer.

pub mod monitor;
pub mod persistent_name;

pub use monitor::{
    DeviceEvent, DeviceEventKind, DeviceInfo, DeviceMonitor, DeviceSnapshot, FakeUeventSource,
    UeventSource,
};
pub use persistent_name::PersistentNameLayer;
