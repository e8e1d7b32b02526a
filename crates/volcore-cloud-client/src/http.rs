//! `reqwest`-backed `CloudClient`.
//!
//! Grounded on `OpenFgaEvaluator`'s shape: a `reqwest::Client` built once
//! with a timeout, one error-classification closure
//! (`is_timeout()` -> `CloudError::Timeout`, anything else ->
//! `CloudError::Transient`) reused on every call, and JSON request/response
//! bodies. Every mutating call here additionally polls a job resource
//! until it reaches a terminal `JobStatus`, per §4.1 ("each call is
//! synchronous to the caller: it issues the provider's async request,
//! polls the job until terminal").

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::client::{CloudClient, CloudVolume, JobStatus, PowerState, VolumeSpec};
use crate::error::{CloudError, CloudResult};
use crate::health::{HealthSample, HealthTracker};
use crate::retry::with_retry;

pub struct HttpCloudClientConfig {
    pub endpoint: String,
    pub api_key: String,
    pub job_poll_interval: Duration,
    pub job_poll_timeout: Duration,
}

pub struct HttpCloudClient {
    http: reqwest::Client,
    config: HttpCloudClientConfig,
    health: HealthTracker,
}

#[derive(Debug, Serialize)]
struct CreateVolumeBody {
    size_bytes: u64,
    pool: String,
}

#[derive(Debug, Deserialize)]
struct JobAccepted {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    status: JobStatus,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CloudVolumeBody {
    volume_id: String,
    size_bytes: u64,
    attached_vm_id: Option<String>,
    cloudstack_device_id: Option<u32>,
}

impl From<CloudVolumeBody> for CloudVolume {
    fn from(b: CloudVolumeBody) -> Self {
        CloudVolume {
            volume_id: b.volume_id,
            size_bytes: b.size_bytes,
            attached_vm_id: b.attached_vm_id,
            cloudstack_device_id: b.cloudstack_device_id,
        }
    }
}

impl HttpCloudClient {
    pub fn new(config: HttpCloudClientConfig) -> CloudResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CloudError::Transient(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            config,
            health: HealthTracker::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn classify(e: &reqwest::Error) -> CloudError {
        if e.is_timeout() {
            CloudError::Timeout(Duration::from_secs(30))
        } else {
            CloudError::Transient(e.to_string())
        }
    }

    async fn timed<T, F>(&self, f: impl FnOnce() -> F) -> CloudResult<T>
    where
        F: std::future::Future<Output = CloudResult<T>>,
    {
        let started = Instant::now();
        let result = f().await;
        self.health
            .record(started.elapsed(), volcore_common::ids::now());
        result
    }

    async fn post_job<B: Serialize>(&self, path: &str, body: &B) -> CloudResult<JobAccepted> {
        let resp = self
            .http
            .post(self.url(path))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::classify(&e))?;

        Self::check_status(&resp)?;
        resp.json::<JobAccepted>()
            .await
            .map_err(|e| CloudError::Transient(format!("invalid job-accepted body: {e}")))
    }

    fn check_status(resp: &reqwest::Response) -> CloudResult<()> {
        match resp.status() {
            s if s.is_success() => Ok(()),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                Err(CloudError::Authentication(resp.status().to_string()))
            }
            reqwest::StatusCode::NOT_FOUND => {
                Err(CloudError::NotFound(resp.status().to_string()))
            }
            reqwest::StatusCode::PRECONDITION_FAILED | reqwest::StatusCode::CONFLICT => {
                Err(CloudError::Precondition(resp.status().to_string()))
            }
            s if s.is_server_error() => Err(CloudError::Transient(s.to_string())),
            s => Err(CloudError::Transient(format!("unexpected status {s}"))),
        }
    }

    /// Poll `/jobs/{job_id}` until terminal or `job_poll_timeout` elapses.
    async fn poll_job(&self, job_id: &str) -> CloudResult<serde_json::Value> {
        let deadline = Instant::now() + self.config.job_poll_timeout;
        loop {
            let resp = self
                .http
                .get(self.url(&format!("/jobs/{job_id}")))
                .bearer_auth(&self.config.api_key)
                .send()
                .await
                .map_err(|e| Self::classify(&e))?;
            Self::check_status(&resp)?;
            let envelope: JobEnvelope = resp
                .json()
                .await
                .map_err(|e| CloudError::Transient(format!("invalid job body: {e}")))?;

            match envelope.status {
                JobStatus::Succeeded => return Ok(envelope.result.unwrap_or(serde_json::Value::Null)),
                JobStatus::Failed => {
                    return Err(CloudError::Precondition(
                        envelope.error.unwrap_or_else(|| "job failed".to_string()),
                    ))
                }
                JobStatus::Pending | JobStatus::Running => {
                    if Instant::now() >= deadline {
                        return Err(CloudError::Timeout(self.config.job_poll_timeout));
                    }
                    tokio::time::sleep(self.config.job_poll_interval).await;
                }
            }
        }
    }
}

#[async_trait]
impl CloudClient for HttpCloudClient {
    async fn create_volume(&self, spec: VolumeSpec) -> CloudResult<String> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(
                        "/volumes",
                        &CreateVolumeBody {
                            size_bytes: spec.size_bytes,
                            pool: spec.pool.clone(),
                        },
                    )
                    .await?;
                let result = self.poll_job(&accepted.job_id).await?;
                result
                    .get("volume_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| CloudError::Transient("create_volume job result missing volume_id".into()))
            })
        })
        .await
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &str) -> CloudResult<u32> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(
                        &format!("/volumes/{volume_id}/attach"),
                        &serde_json::json!({ "vm_id": vm_id }),
                    )
                    .await?;
                let result = self.poll_job(&accepted.job_id).await?;
                result
                    .get("cloudstack_device_id")
                    .and_then(serde_json::Value::as_u64)
                    .map(|n| n as u32)
                    .ok_or_else(|| CloudError::Transient("attach job result missing cloudstack_device_id".into()))
            })
        })
        .await
    }

    async fn attach_volume_as_root(&self, volume_id: &str, vm_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(
                        &format!("/volumes/{volume_id}/attach-root"),
                        &serde_json::json!({ "vm_id": vm_id }),
                    )
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    async fn detach_volume(&self, volume_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(&format!("/volumes/{volume_id}/detach"), &serde_json::json!({}))
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_volume(&self, volume_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(&format!("/volumes/{volume_id}/delete"), &serde_json::json!({}))
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    async fn get_volume(&self, volume_id: &str) -> CloudResult<CloudVolume> {
        self.timed(|| {
            with_retry(|| async {
                let resp = self
                    .http
                    .get(self.url(&format!("/volumes/{volume_id}")))
                    .bearer_auth(&self.config.api_key)
                    .send()
                    .await
                    .map_err(|e| Self::classify(&e))?;
                Self::check_status(&resp)?;
                let body: CloudVolumeBody = resp
                    .json()
                    .await
                    .map_err(|e| CloudError::Transient(format!("invalid volume body: {e}")))?;
                Ok(body.into())
            })
        })
        .await
    }

    async fn list_volumes(&self, vm_id: &str) -> CloudResult<Vec<CloudVolume>> {
        self.timed(|| {
            with_retry(|| async {
                let resp = self
                    .http
                    .get(self.url(&format!("/vms/{vm_id}/volumes")))
                    .bearer_auth(&self.config.api_key)
                    .send()
                    .await
                    .map_err(|e| Self::classify(&e))?;
                Self::check_status(&resp)?;
                let body: Vec<CloudVolumeBody> = resp
                    .json()
                    .await
                    .map_err(|e| CloudError::Transient(format!("invalid volume list body: {e}")))?;
                Ok(body.into_iter().map(Into::into).collect())
            })
        })
        .await
    }

    async fn power_off_vm(&self, vm_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(&format!("/vms/{vm_id}/power-off"), &serde_json::json!({}))
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_vm(&self, vm_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(&format!("/vms/{vm_id}/delete"), &serde_json::json!({}))
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    async fn create_snapshot(&self, volume_id: &str) -> CloudResult<String> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(&format!("/volumes/{volume_id}/snapshots"), &serde_json::json!({}))
                    .await?;
                let result = self.poll_job(&accepted.job_id).await?;
                result
                    .get("snapshot_id")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| CloudError::Transient("snapshot job result missing snapshot_id".into()))
            })
        })
        .await
    }

    async fn revert_snapshot(&self, volume_id: &str, snapshot_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(
                        &format!("/volumes/{volume_id}/snapshots/{snapshot_id}/revert"),
                        &serde_json::json!({}),
                    )
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> CloudResult<()> {
        self.timed(|| {
            with_retry(|| async {
                let accepted = self
                    .post_job(&format!("/snapshots/{snapshot_id}/delete"), &serde_json::json!({}))
                    .await?;
                self.poll_job(&accepted.job_id).await?;
                Ok(())
            })
        })
        .await
    }

    fn last_health(&self, n: usize) -> Vec<HealthSample> {
        self.health.last_n(n)
    }
}

/// Unused until the VM power-state query is wired into a caller; kept
/// here so the type exists at the abstraction boundary per §4.1.
#[allow(dead_code)]
fn power_state_from_str(s: &str) -> PowerState {
    match s {
        "on" | "On" | "ON" => PowerState::On,
        "off" | "Off" | "OFF" => PowerState::Off,
        _ => PowerState::Unknown,
    }
}
