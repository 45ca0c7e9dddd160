//! Docker CLI runtime adapter
//!
//! Shells out to the `docker` binary (configurable, so podman works too)
//! with piped stdio and a `tokio::time::timeout` around every invocation.
//! Containers are labelled with the owning job id and named after the
//! target's deployment slot, so a redeploy replaces the previous instance
//! instead of fighting it for ports.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::models::{DeploySpec, Job};

use super::{
    ContainerHandle, ContainerRuntime, ContainerStatus, ImageRef, LogStream, RuntimeError,
    container_name,
};

pub struct DockerCliRuntime {
    binary: String,
}

impl DockerCliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run one docker subcommand to completion under `timeout`
    async fn run_command(
        &self,
        operation: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<std::process::Output, RuntimeError> {
        debug!(operation, ?args, "invoking container engine");
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| RuntimeError::Timeout {
                operation: operation.to_string(),
                timeout,
            })?
            .map_err(RuntimeError::Io)
    }

    /// Like `run_command`, but a non-zero exit becomes `CommandFailed`
    async fn run_checked(
        &self,
        operation: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, RuntimeError> {
        let output = self.run_command(operation, args, timeout).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(RuntimeError::CommandFailed {
                operation: operation.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Argument vector for `docker run` on this job
    fn run_args(job: &Job) -> Vec<String> {
        let spec = &job.spec;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name(&job.target),
            "--label".to_string(),
            format!("deployd.job={}", job.id),
            "--label".to_string(),
            format!("deployd.target={}", job.target),
        ];
        for mapping in &spec.ports {
            args.push("-p".to_string());
            args.push(mapping.to_string());
        }
        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        if let Some(resources) = &spec.resources {
            if let Some(memory_mb) = resources.memory_mb {
                args.push("--memory".to_string());
                args.push(format!("{memory_mb}m"));
            }
            if let Some(cpu_shares) = resources.cpu_shares {
                args.push("--cpu-shares".to_string());
                args.push(cpu_shares.to_string());
            }
        }
        args.push(spec.image.clone());
        args
    }

    fn parse_inspect_output(raw: &str) -> ContainerStatus {
        let (status, exit_code) = match raw.trim().split_once('|') {
            Some(parts) => parts,
            None => return ContainerStatus::Other(raw.trim().to_string()),
        };
        match status {
            "running" => ContainerStatus::Running,
            "exited" | "dead" => ContainerStatus::Exited {
                exit_code: exit_code.parse().unwrap_or(-1),
            },
            other => ContainerStatus::Other(other.to_string()),
        }
    }

    fn is_missing_container(stderr: &str) -> bool {
        stderr.contains("No such container") || stderr.contains("No such object")
    }
}

#[async_trait]
impl ContainerRuntime for DockerCliRuntime {
    async fn build(&self, spec: &DeploySpec, timeout: Duration) -> Result<ImageRef, RuntimeError> {
        let pull_args = vec!["pull".to_string(), spec.image.clone()];
        self.run_checked("docker pull", &pull_args, timeout).await?;

        // Resolve the image id so the job record pins what actually ran.
        let inspect_args = vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{.Id}}".to_string(),
            spec.image.clone(),
        ];
        let image_id = self
            .run_checked("docker image inspect", &inspect_args, timeout)
            .await?;
        Ok(ImageRef(image_id))
    }

    async fn run(&self, job: &Job, timeout: Duration) -> Result<ContainerHandle, RuntimeError> {
        let name = container_name(&job.target);

        // Clear the slot: a prior deployment of this target may still hold
        // the name and the host ports.
        let rm_args = vec!["rm".to_string(), "-f".to_string(), name.clone()];
        if let Err(e) = self.run_checked("docker rm", &rm_args, timeout).await {
            match &e {
                RuntimeError::CommandFailed { stderr, .. }
                    if Self::is_missing_container(stderr) => {}
                _ => warn!(container = %name, error = %e, "could not remove previous container"),
            }
        }

        let id = self
            .run_checked("docker run", &Self::run_args(job), timeout)
            .await?;
        Ok(ContainerHandle { id, name })
    }

    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError> {
        let args = vec!["rm".to_string(), "-f".to_string(), handle.id.clone()];
        match self.run_checked("docker rm", &args, timeout).await {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. })
                if Self::is_missing_container(&stderr) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn inspect(
        &self,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> Result<ContainerStatus, RuntimeError> {
        let args = vec![
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}|{{.State.ExitCode}}".to_string(),
            handle.id.clone(),
        ];
        match self.run_checked("docker inspect", &args, timeout).await {
            Ok(raw) => Ok(Self::parse_inspect_output(&raw)),
            Err(RuntimeError::CommandFailed { stderr, .. })
                if Self::is_missing_container(&stderr) =>
            {
                Ok(ContainerStatus::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    async fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStream, RuntimeError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["logs", "-f", "--tail", "0", &handle.id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(RuntimeError::Io)?;
        let (tx, rx) = mpsc::channel(256);

        // docker writes the container's stdout and stderr to the matching
        // follower pipes; merge both into one line stream.
        if let Some(stdout) = child.stdout.take() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }

        Ok(LogStream::new(rx, Some(child)))
    }
}
