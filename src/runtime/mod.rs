//! Container runtime adapters
//!
//! `ContainerRuntime` is the narrow boundary between the orchestrator and
//! the container engine. Every operation carries a caller-supplied timeout;
//! blowing it surfaces as `RuntimeError::Timeout`, which the executor
//! classifies like any other step failure. The engine's own failure domain
//! never leaks past this trait.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Child;
use tokio::sync::mpsc;

use crate::models::{DeploySpec, Job};

mod docker;
mod simulated;

pub use docker::DockerCliRuntime;
pub use simulated::SimulatedRuntime;

/// Failures surfaced by a runtime adapter
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The operation exceeded the caller's deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The engine ran the operation and reported failure
    #[error("{operation} failed (exit {code:?}): {stderr}")]
    CommandFailed {
        operation: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The referenced container no longer exists
    #[error("container {handle} not found")]
    NotFound { handle: String },

    /// The engine binary could not be spawned or piped
    #[error("runtime i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolved image identity returned by the build step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef(pub String);

impl std::fmt::Display for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a started container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine-assigned id; what `stop`/`inspect` operate on
    pub id: String,
    /// Deterministic name derived from target and attempt
    pub name: String,
}

impl std::fmt::Display for ContainerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short id in the docker style
        write!(f, "{}", &self.id[..self.id.len().min(12)])
    }
}

/// Observed container state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited { exit_code: i32 },
    NotFound,
    /// Any other engine-reported state (created, paused, restarting, ...)
    Other(String),
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerStatus::Running)
    }
}

/// Live container log lines, starting from subscription time.
///
/// Dropping the stream detaches (and for the docker adapter kills the
/// `docker logs` follower). Re-subscribing starts from "now" again; there
/// is no replay.
pub struct LogStream {
    rx: mpsc::Receiver<String>,
    /// Follower process for CLI-backed streams, reaped on drop
    _follower: Option<Child>,
}

impl LogStream {
    pub(crate) fn new(rx: mpsc::Receiver<String>, follower: Option<Child>) -> Self {
        Self {
            rx,
            _follower: follower,
        }
    }

    /// Next log line, or `None` once the source is gone
    pub async fn next_line(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Narrow interface over an external container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make `spec.image` runnable locally and resolve its identity
    async fn build(&self, spec: &DeploySpec, timeout: Duration) -> Result<ImageRef, RuntimeError>;

    /// Start the job's container, replacing any previous instance that
    /// still occupies the target's container name
    async fn run(&self, job: &Job, timeout: Duration) -> Result<ContainerHandle, RuntimeError>;

    /// Stop and remove the container. Idempotent: a container that is
    /// already gone is success.
    async fn stop(&self, handle: &ContainerHandle, timeout: Duration) -> Result<(), RuntimeError>;

    /// Current engine-observed status
    async fn inspect(
        &self,
        handle: &ContainerHandle,
        timeout: Duration,
    ) -> Result<ContainerStatus, RuntimeError>;

    /// Follow log lines from "now"
    async fn stream_logs(&self, handle: &ContainerHandle) -> Result<LogStream, RuntimeError>;
}

/// Deterministic container name for a target's deployment slot.
///
/// Attempts share the slot name so a redeploy replaces the previous
/// container rather than colliding with it on ports.
pub fn container_name(target: &str) -> String {
    let slug: String = target
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("deployd-{}", slug.trim_matches('-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_slugged_and_stable() {
        assert_eq!(container_name("web"), "deployd-web");
        assert_eq!(container_name("Web Staging/eu"), "deployd-web-staging-eu");
        assert_eq!(container_name("api.v2"), "deployd-api-v2");
        // Same target, any attempt: same slot name
        assert_eq!(container_name("web"), container_name("web"));
    }

    #[test]
    fn handle_displays_short_id() {
        let handle = ContainerHandle {
            id: "0123456789abcdef0123".to_string(),
            name: "deployd-web".to_string(),
        };
        assert_eq!(handle.to_string(), "0123456789ab");

        let short = ContainerHandle {
            id: "abc".to_string(),
            name: "deployd-web".to_string(),
        };
        assert_eq!(short.to_string(), "abc");
    }
}
