//! Core domain types for deployment jobs
//!
//! A `Job` is one deployment attempt against a `target` (the logical
//! service+environment slot). Jobs move through a fixed state machine and
//! become immutable once terminal. `JobEvent`s are the append-only record
//! of those transitions, broadcast live and persisted per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle states of a deployment job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Admitted, waiting for its executor task to pick it up
    Queued,
    /// Image is being built/pulled
    Building,
    /// Container is being created and started
    Starting,
    /// Container started, readiness probe polling
    HealthChecking,
    /// Deployment finished and healthy
    Succeeded,
    /// A step failed; see `terminal_reason`
    Failed,
    /// Settled after a cancellation request
    Cancelled,
}

impl JobState {
    /// Terminal states permit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `next` is a legal successor of this state.
    ///
    /// Forward progress is strictly sequential; any non-terminal state may
    /// move to `Failed` (step error) or `Cancelled` (cooperative cancel).
    pub fn can_transition_to(&self, next: JobState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (JobState::Queued, JobState::Building)
            | (JobState::Building, JobState::Starting)
            | (JobState::Starting, JobState::HealthChecking)
            | (JobState::HealthChecking, JobState::Succeeded) => true,
            (_, JobState::Failed) | (_, JobState::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Building => write!(f, "building"),
            JobState::Starting => write!(f, "starting"),
            JobState::HealthChecking => write!(f, "health_checking"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Classification recorded on a job once it reaches a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Image build/pull step failed or timed out
    BuildFailed,
    /// Container creation/start step failed or timed out
    StartFailed,
    /// Readiness probe never passed within the health deadline
    HealthCheckTimeout,
    /// Job was cancelled by request
    Cancelled,
    /// Unclassified failure; the job was still settled terminally
    InternalError,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::BuildFailed => write!(f, "build_failed"),
            TerminalReason::StartFailed => write!(f, "start_failed"),
            TerminalReason::HealthCheckTimeout => write!(f, "health_check_timeout"),
            TerminalReason::Cancelled => write!(f, "cancelled"),
            TerminalReason::InternalError => write!(f, "internal_error"),
        }
    }
}

/// One host-to-container port publication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({"host": 8080, "container": 80}))]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

impl FromStr for PortMapping {
    type Err = SpecValidationError;

    /// Parses the conventional `"8080:80"` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| SpecValidationError::InvalidPortMapping {
            mapping: s.to_string(),
            reason: reason.to_string(),
        };
        let (host, container) = s
            .split_once(':')
            .ok_or_else(|| invalid("expected host:container"))?;
        let host: u16 = host.trim().parse().map_err(|_| invalid("bad host port"))?;
        let container: u16 = container
            .trim()
            .parse()
            .map_err(|_| invalid("bad container port"))?;
        let mapping = PortMapping { host, container };
        mapping.validate()?;
        Ok(mapping)
    }
}

impl PortMapping {
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.host == 0 || self.container == 0 {
            return Err(SpecValidationError::InvalidPortMapping {
                mapping: self.to_string(),
                reason: "ports must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Optional container resource limits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ResourceLimits {
    /// Memory ceiling in megabytes
    pub memory_mb: Option<u64>,
    /// Relative CPU weight (docker `--cpu-shares`)
    pub cpu_shares: Option<u64>,
}

/// Immutable deployment request a job carries for its whole lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[schema(description = "Deployment request: what to run and where")]
pub struct DeploySpec {
    /// Logical deployment slot, e.g. `web-staging`; serialization key
    pub target: String,
    /// Image reference to build/pull and run
    #[schema(example = "nginx:latest")]
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    /// Environment passed to the container; sorted map keeps argv ordering stable
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    /// Path polled by the HTTP readiness probe (default `/`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,
}

impl DeploySpec {
    /// Admission-time validation; rejected specs never become jobs
    pub fn validate(&self) -> Result<(), SpecValidationError> {
        if self.target.trim().is_empty() {
            return Err(SpecValidationError::EmptyTarget);
        }
        if self.image.trim().is_empty() {
            return Err(SpecValidationError::EmptyImage);
        }
        let mut seen_hosts = std::collections::HashSet::new();
        for mapping in &self.ports {
            mapping.validate()?;
            if !seen_hosts.insert(mapping.host) {
                return Err(SpecValidationError::DuplicateHostPort(mapping.host));
            }
        }
        Ok(())
    }

    /// Host port the HTTP readiness probe should hit, if any is published
    pub fn probe_port(&self) -> Option<u16> {
        self.ports.first().map(|m| m.host)
    }
}

/// Why a `DeploySpec` was rejected at admission
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpecValidationError {
    #[error("target must not be empty")]
    EmptyTarget,
    #[error("image reference must not be empty")]
    EmptyImage,
    #[error("invalid port mapping '{mapping}': {reason}")]
    InvalidPortMapping { mapping: String, reason: String },
    #[error("host port {0} mapped more than once")]
    DuplicateHostPort(u16),
}

/// One deployment attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[schema(description = "A deployment job and its current persisted state")]
pub struct Job {
    pub id: Uuid,
    /// Copy of `spec.target`, denormalized for lookups
    pub target: String,
    pub spec: DeploySpec,
    pub state: JobState,
    /// 0 for a first submission, incremented by reruns
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, by the terminal transition
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<TerminalReason>,
    /// Human-readable detail accompanying the terminal reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_detail: Option<String>,
    /// Runtime container id once the start step has succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl Job {
    /// A freshly admitted job in `Queued`
    pub fn new(spec: DeploySpec, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target: spec.target.clone(),
            spec,
            state: JobState::Queued,
            attempt,
            created_at: now,
            updated_at: now,
            terminal_reason: None,
            terminal_detail: None,
            container_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Distinguishes persisted lifecycle transitions from live-only log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// State-machine transition; persisted and broadcast
    Transition,
    /// Container log line; broadcast only
    Log,
}

/// Immutable notification describing a job observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub target: String,
    pub state: JobState,
    pub kind: EventKind,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobEvent {
    /// Event announcing `job`'s current (already persisted) state
    pub fn transition(job: &Job, detail: Option<String>) -> Self {
        Self {
            job_id: job.id,
            target: job.target.clone(),
            state: job.state,
            kind: EventKind::Transition,
            attempt: job.attempt,
            timestamp: Utc::now(),
            detail,
        }
    }

    /// Live-only container log line attributed to `job`
    pub fn log_line(job: &Job, line: String) -> Self {
        Self {
            job_id: job.id,
            target: job.target.clone(),
            state: job.state,
            kind: EventKind::Log,
            attempt: job.attempt,
            timestamp: Utc::now(),
            detail: Some(line),
        }
    }
}
