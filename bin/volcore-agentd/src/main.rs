//! Volume orchestration agent daemon.
//!
//! Wires the Cloud Client Abstraction, Device Monitor, Repository, NBD
//! Export Manager, and File-Level Restore Mount Manager into the Volume
//! Operations Service and State Recovery, then sits idle: every volume
//! mutation reaches this process over whatever RPC the controller already
//! uses to talk to the agent fleet, not a surface defined here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use volcore_cloud_client::{CloudClient, HttpCloudClient, HttpCloudClientConfig};
use volcore_common::config::{Config, RECOVERY_TICK_INTERVAL};
use volcore_core::{CorrelationConfig, StateRecovery, VolumeOperationsService, VolumeOperationsServiceConfig};
use volcore_device::monitor::ProcPartitionsSource;
use volcore_device::{DeviceMonitor, PersistentNameLayer};
use volcore_nbd::{FragmentWriter, ReloadCoalescer};
use volcore_repository::{RedbRepository, Repository};
use volcore_restore::{MountRoot, RestoreMountManager, RestoreMountManagerConfig};

#[derive(Parser, Debug)]
#[command(name = "volcore-agentd")]
#[command(about = "Volume orchestration agent for a migrated VM")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/volcore/agent.toml")]
    config: String,

    /// Id of the VM this agent runs inside
    #[arg(long)]
    vm_id: Option<String>,

    /// Cloud control-plane endpoint
    #[arg(long)]
    cloud_endpoint: Option<String>,

    /// Data directory for the repository and NBD fragments
    #[arg(long)]
    data_dir: Option<String>,

    /// Log level, overrides the config file's `[logging] filter`
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: Config = if Path::new(&args.config).exists() {
        let raw = std::fs::read_to_string(&args.config)?;
        Config::from_toml_str(&raw).unwrap_or_else(|e| {
            eprintln!("warning: failed to parse {}: {e}", args.config);
            Config::default()
        })
    } else {
        Config::default()
    };

    if let Some(vm_id) = args.vm_id {
        config.node.vm_id = vm_id;
    }
    if let Some(endpoint) = args.cloud_endpoint {
        config.cloud.endpoint = endpoint;
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        config.logging.filter = level;
    }

    let fmt_layer: Box<dyn tracing_subscriber::Layer<tracing_subscriber::Registry> + Send + Sync> = if config.logging.json {
        Box::new(tracing_subscriber::fmt::layer().json())
    } else {
        Box::new(tracing_subscriber::fmt::layer())
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| config.logging.filter.clone().into()))
        .init();

    info!(vm_id = %config.node.vm_id, "starting volcore-agentd");

    let data_dir = PathBuf::from(&config.node.data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let repo: Arc<dyn Repository> = Arc::new(RedbRepository::open(&config.repository.path)?);

    let cloud: Arc<dyn CloudClient> = Arc::new(HttpCloudClient::new(HttpCloudClientConfig {
        endpoint: config.cloud.endpoint.clone(),
        api_key: config.cloud.api_key.clone(),
        job_poll_interval: config.cloud.job_poll_interval,
        job_poll_timeout: config.cloud.job_poll_timeout,
    })?);

    let devices = DeviceMonitor::new(
        Arc::new(ProcPartitionsSource::default()),
        config.device.uevent_coalesce_window,
        config.device.uevent_queue_capacity,
    );
    devices.start();

    let names = PersistentNameLayer::new();
    let fragments = FragmentWriter::new(&config.nbd.export_config_dir);
    let reload = Arc::new(ReloadCoalescer::start(
        PathBuf::from("/run/nbd-server.pid"),
        Duration::from_millis(300),
    ));

    let correlation = CorrelationConfig {
        size_tolerance_bytes: config.device.size_tolerance_bytes,
    };
    let recovery = Arc::new(StateRecovery::new(
        cloud.clone(),
        devices.clone(),
        repo.clone(),
        correlation.clone(),
    ));

    let volume_ops = Arc::new(VolumeOperationsService::new(
        cloud.clone(),
        devices.clone(),
        names,
        fragments,
        reload,
        repo.clone(),
        recovery.clone(),
        VolumeOperationsServiceConfig {
            attach_timeout: config.cloud.attach_timeout,
            detach_timeout: config.cloud.detach_timeout,
            nbd_base_port: config.nbd.base_port,
            correlation,
        },
    ));

    let restore = Arc::new(RestoreMountManager::new(
        repo.clone(),
        RestoreMountManagerConfig {
            mount_root: MountRoot::new(config.restore.mount_root.clone()),
            idle_ttl: config.restore.idle_ttl,
        },
    ));

    let recovery_task = {
        let recovery = recovery.clone();
        tokio::spawn(async move {
            let mut ticker = interval(RECOVERY_TICK_INTERVAL);
            loop {
                ticker.tick().await;
                let result = recovery.run_periodic().await;
                if result.errors.is_empty() {
                    info!(
                        recovered = result.volumes_recovered,
                        fixed = result.mappings_fixed,
                        orphaned = result.volumes_orphaned,
                        elapsed_ms = result.duration.as_millis(),
                        "state recovery tick complete"
                    );
                } else {
                    warn!(errors = ?result.errors, "state recovery tick completed with errors");
                }
            }
        })
    };

    let reaper_task = {
        let restore = restore.clone();
        let reaper_interval = config.restore.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = interval(reaper_interval);
            loop {
                ticker.tick().await;
                match restore.reap_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "reaped expired restore mounts"),
                    Err(e) => error!(error = %e, "restore mount reaper failed"),
                }
            }
        })
    };

    // `volume_ops` and `restore` are handed off to whatever RPC surface
    // dispatches controller requests into this process; neither is driven
    // from here. Keep the Arcs alive for the lifetime of the process.
    let _volume_ops = volume_ops;
    let _restore = restore;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    recovery_task.abort();
    reaper_task.abort();
    devices.stop();

    info!("volcore-agentd shut down gracefully");
    Ok(())
}
