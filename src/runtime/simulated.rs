//! In-process simulated runtime
//!
//! Deploys nothing: build and start are timed sleeps, containers are map
//! entries with a status. This is the default engine for demo instances
//! and the deterministic fixture for the orchestrator test-suite, which
//! scripts failures per target to drive every terminal path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::models::{DeploySpec, Job};

use super::{
    ContainerHandle, ContainerRuntime, ContainerStatus, ImageRef, LogStream, RuntimeError,
    container_name,
};

#[derive(Debug, Clone)]
struct SimulatedContainer {
    handle: ContainerHandle,
    job_id: Uuid,
    status: ContainerStatus,
}

#[derive(Debug, Default)]
struct FailureScript {
    build: HashSet<String>,
    start: HashSet<String>,
    never_healthy: HashSet<String>,
}

#[derive(Clone)]
pub struct SimulatedRuntime {
    step_delay: Duration,
    containers: Arc<RwLock<HashMap<String, SimulatedContainer>>>,
    script: Arc<RwLock<FailureScript>>,
}

impl SimulatedRuntime {
    pub fn new(step_delay: Duration) -> Self {
        Self {
            step_delay,
            containers: Arc::new(RwLock::new(HashMap::new())),
            script: Arc::new(RwLock::new(FailureScript::default())),
        }
    }

    /// Script the build step to fail for `target`
    pub async fn fail_build_for(&self, target: &str) {
        self.script.write().await.build.insert(target.to_string());
    }

    /// Script the start step to fail for `target`
    pub async fn fail_start_for(&self, target: &str) {
        self.script.write().await.start.insert(target.to_string());
    }

    /// Script containers of `target` to never reach `Running`
    pub async fn never_healthy_for(&self, target: &str) {
        self.script
            .write()
            .await
            .never_healthy
            .insert(target.to_string());
    }

    /// Remove every scripted failure for `target`
    pub async fn clear_script_for(&self, target: &str) {
        let mut script = self.script.write().await;
        script.build.remove(target);
        script.start.remove(target);
        script.never_healthy.remove(target);
    }

    /// Names of containers currently in `Running`
    pub async fn running_containers(&self) -> Vec<String> {
        self.containers
            .read()
            .await
            .values()
            .filter(|c| c.status.is_running())
            .map(|c| c.handle.name.clone())
            .collect()
    }

    async fn simulate_step(
        &self,
        operation: &str,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        tokio::time::timeout(timeout, tokio::time::sleep(self.step_delay))
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: operation.to_string(),
                timeout,
            })
    }
}

#[async_trait]
impl ContainerRuntime for SimulatedRuntime {
    async fn build(&self, spec: &DeploySpec, timeout: Duration) -> Result<ImageRef, RuntimeError> {
        self.simulate_step("simulated build", timeout).await?;
        if self.script.read().await.build.contains(&spec.target) {
            return Err(RuntimeError::CommandFailed {
                operation: "simulated build".to_string(),
                code: Some(1),
                stderr: format!("scripted build failure for target '{}'", spec.target),
            });
        }
        debug!(image = %spec.image, "simulated image build complete");
        Ok(ImageRef(spec.image.clone()))
    }

    async fn run(&self, job: &Job, timeout: Duration) -> Result<ContainerHandle, RuntimeError> {
        self.simulate_step("simulated run", timeout).await?;
        let script = self.script.read().await;
        if script.start.contains(&job.target) {
            return Err(RuntimeError::CommandFailed {
                operation: "simulated run".to_string(),
                code: Some(125),
                stderr: format!("scripted start failure for target '{}'", job.target),
            });
        }

        let name = container_name(&job.target);
        let handle = ContainerHandle {
            id: format!("sim{}", Uuid::new_v4().simple()),
            name: name.clone(),
        };
        let status = if script.never_healthy.contains(&job.target) {
            ContainerStatus::Other("created".to_string())
        } else {
            ContainerStatus::Running
        };
        drop(script);

        let mut containers = self.containers.write().await;
        // Same replace-on-redeploy semantics as the real engine: the slot
        // name belongs to at most one container.
        containers.retain(|_, c| c.handle.name != name);
        containers.insert(
            handle.id.clone(),
            SimulatedContainer {
                handle: handle.clone(),
                job_id: job.id,
                status,
            },
        );
        Ok(handle)
    }

    async fn stop(&self, handle: &ContainerHandle, _timeout: Duration) -> Result<(), RuntimeError> {
        // Stop-and-remove, idempotent like `docker rm -f`.
        self.containers.write().await.remove(&handle.id);
        Ok(())
    }

    async fn inspect(
        &self,
        handle: &ContainerHandle,
        _timeout: Duration,
    ) -> Result<ContainerStatus, RuntimeError> {
        Ok(self
            .containers
            .read()
            .await
            .get(&handle.id)
            .map(|c| c.status.clone())
            .unwrap_or(ContainerStatus::NotFound))
    }

    async fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStream, RuntimeError> {
        let container = self
            .containers
            .read()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                handle: handle.id.clone(),
            })?;

        let (tx, rx) = mpsc::channel(16);
        let pause = self.step_delay / 4;
        tokio::spawn(async move {
            let lines = [
                format!("container {} started", container.handle.name),
                format!("serving job {}", container.job_id),
                "ready to accept connections".to_string(),
            ];
            for line in lines {
                if tx.send(line).await.is_err() {
                    return;
                }
                tokio::time::sleep(pause).await;
            }
        });
        Ok(LogStream::new(rx, None))
    }
}
