//! Agent configuration.
//!
//! Loaded the way `objectio-osd` loads its config: a TOML file deserialized
//! with `toml::from_str`, then overridden field-by-field by whatever was
//! passed on the command line. There is no `config::Config::builder` layer
//! here — just a struct and `toml`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub cloud: CloudConfig,
    pub repository: RepositoryConfig,
    pub nbd: NbdConfig,
    pub device: DeviceConfig,
    pub restore: RestoreConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            cloud: CloudConfig::default(),
            repository: RepositoryConfig::default(),
            nbd: NbdConfig::default(),
            device: DeviceConfig::default(),
            restore: RestoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Parse a TOML config file. Missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub vm_id: String,
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            vm_id: String::new(),
            data_dir: "/var/lib/volcore".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub endpoint: String,
    pub api_key: String,
    #[serde(with = "duration_secs")]
    pub attach_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub detach_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub job_poll_interval: Duration,
    #[serde(with = "duration_secs")]
    pub job_poll_timeout: Duration,
    pub max_retries: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            attach_timeout: Duration::from_secs(30),
            detach_timeout: Duration::from_secs(30),
            job_poll_interval: Duration::from_secs(2),
            job_poll_timeout: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub path: String,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            path: "/var/lib/volcore/state.redb".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NbdConfig {
    pub export_config_dir: String,
    pub base_port: u16,
    pub max_exports: u32,
}

impl Default for NbdConfig {
    fn default() -> Self {
        Self {
            export_config_dir: "/etc/nbd-server/conf.d".into(),
            base_port: 10809,
            max_exports: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Size tolerance for correlating a cloud volume to a just-appeared
    /// Linux block device, in bytes. Default 3 GiB accounts for alignment
    /// and filesystem overhead differences between the source and the
    /// cloud volume.
    pub size_tolerance_bytes: u64,
    #[serde(with = "duration_secs")]
    pub uevent_coalesce_window: Duration,
    pub uevent_queue_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            size_tolerance_bytes: 3 * 1024 * 1024 * 1024,
            uevent_coalesce_window: Duration::from_millis(200),
            uevent_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub mount_root: String,
    pub nbd_device_pool: Vec<String>,
    #[serde(with = "duration_secs")]
    pub idle_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub reaper_interval: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            mount_root: "/var/lib/volcore/restore".into(),
            nbd_device_pool: (0..8).map(|n| format!("/dev/nbd{n}")).collect(),
            idle_ttl: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(900),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

/// State Recovery's periodic reconciliation tick interval. Not part of
/// `Config` proper since the teacher keeps ticker intervals as `const`s
/// next to the component that owns them (see `SmartMonitor`); exposed here
/// so `volcore-core` doesn't need its own copy.
pub const RECOVERY_TICK_INTERVAL: Duration = Duration::from_secs(300);

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.cloud.attach_timeout, Duration::from_secs(30));
        assert_eq!(cfg.cloud.detach_timeout, Duration::from_secs(30));
        assert_eq!(cfg.device.size_tolerance_bytes, 3 * 1024 * 1024 * 1024);
        assert_eq!(cfg.restore.nbd_device_pool.len(), 8);
        assert_eq!(cfg.restore.idle_ttl, Duration::from_secs(3600));
        assert_eq!(cfg.restore.reaper_interval, Duration::from_secs(900));
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml = r#"
            [node]
            vm_id = "vm-1"
        "#;
        let cfg = Config::from_toml_str(toml).unwrap();
        assert_eq!(cfg.node.vm_id, "vm-1");
        assert_eq!(cfg.nbd.base_port, 10809);
    }
}
