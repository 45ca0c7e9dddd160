//! Readiness probes for started containers
//!
//! The executor's health-check step polls one of these until it passes or
//! the deadline expires. A probe performs exactly one check per call; the
//! retry loop, interval, and deadline all belong to the executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Job;
use crate::runtime::{ContainerHandle, ContainerRuntime, ContainerStatus, RuntimeError};

/// Why a single probe attempt did not pass
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("unhealthy response: HTTP {status}")]
    UnhealthyStatus { status: u16 },

    #[error("container is {status}, not running")]
    NotRunning { status: String },

    /// The spec publishes no host port for an HTTP probe to hit
    #[error("no published host port to probe")]
    NoPort,

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// One readiness check against a started container
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, job: &Job, handle: &ContainerHandle) -> Result<(), ProbeError>;
}

/// HTTP readiness probe.
///
/// GETs the first published host port on the loopback interface, at the
/// spec's `health_path` (default `/`); any 2xx response is healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("Failed to create HTTP probe client");
        Self { client }
    }

    fn probe_url(job: &Job) -> Result<String, ProbeError> {
        let port = job.spec.probe_port().ok_or(ProbeError::NoPort)?;
        let path = job.spec.health_path.as_deref().unwrap_or("/");
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        Ok(format!("http://127.0.0.1:{port}{path}"))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, job: &Job, _handle: &ContainerHandle) -> Result<(), ProbeError> {
        let url = Self::probe_url(job)?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::Unreachable(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::UnhealthyStatus {
                status: response.status().as_u16(),
            })
        }
    }
}

/// Engine-status readiness probe: healthy iff the container is `Running`.
///
/// The right choice for containers that publish no HTTP surface, and the
/// default pairing for the simulated runtime.
pub struct RuntimeStatusProbe {
    runtime: Arc<dyn ContainerRuntime>,
    inspect_timeout: Duration,
}

impl RuntimeStatusProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, inspect_timeout: Duration) -> Self {
        Self {
            runtime,
            inspect_timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for RuntimeStatusProbe {
    async fn probe(&self, _job: &Job, handle: &ContainerHandle) -> Result<(), ProbeError> {
        match self.runtime.inspect(handle, self.inspect_timeout).await? {
            ContainerStatus::Running => Ok(()),
            ContainerStatus::NotFound => Err(ProbeError::NotRunning {
                status: "not found".to_string(),
            }),
            ContainerStatus::Exited { exit_code } => Err(ProbeError::NotRunning {
                status: format!("exited({exit_code})"),
            }),
            ContainerStatus::Other(status) => Err(ProbeError::NotRunning { status }),
        }
    }
}
