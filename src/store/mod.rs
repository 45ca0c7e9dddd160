//! Durable job records
//!
//! `JobStore` is the narrow seam the orchestrator persists through; an
//! acknowledged write is a durable write from the caller's point of view.
//! State changes go through `update_state`, a compare-and-swap keyed on the
//! expected current state, so a stale writer can never clobber a newer
//! transition. The in-memory implementation here is the reference backend;
//! anything that honors the CAS contract can be slotted in behind the trait.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, JobEvent, JobState, TerminalReason};

mod memory;

pub use memory::MemoryJobStore;

/// Failures surfaced by a job store backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// The stored state did not match the caller's expectation.
    ///
    /// Under the single-owner execution model this indicates a concurrency
    /// bug or a second writer; callers log it loudly and abort the
    /// operation.
    #[error("state conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: Uuid,
        expected: JobState,
        actual: JobState,
    },

    /// The requested transition is not an edge of the job state machine
    #[error("illegal transition on job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("job {job_id} not found")]
    NotFound { job_id: Uuid },

    #[error("job {job_id} already exists")]
    AlreadyExists { job_id: Uuid },

    /// Backend-specific failure (connection loss, I/O, ...)
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Persistence seam for jobs and their per-job event logs
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a freshly admitted job
    async fn create(&self, job: Job) -> Result<Job, StoreError>;

    /// Fetch the current persisted job, if any
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Compare-and-swap state transition.
    ///
    /// Fails with `Conflict` when the stored state differs from `expected`
    /// or is already terminal, and with `IllegalTransition` when the edge
    /// is not part of the state machine; neither failure mutates the
    /// record. `reason` and `detail` are recorded on terminal writes.
    async fn update_state(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
        reason: Option<TerminalReason>,
        detail: Option<String>,
    ) -> Result<Job, StoreError>;

    /// Attach the runtime-assigned container id once the start step succeeds
    async fn record_container(&self, job_id: Uuid, container_id: &str) -> Result<(), StoreError>;

    /// All jobs ever submitted for a target, newest first
    async fn list_by_target(&self, target: &str) -> Result<Vec<Job>, StoreError>;

    /// Deployment history across targets, newest first
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Jobs not yet settled; used by startup reconciliation
    async fn list_non_terminal(&self) -> Result<Vec<Job>, StoreError>;

    /// Append to the job's ordered, append-only event log
    async fn append_event(&self, event: JobEvent) -> Result<(), StoreError>;

    /// The persisted event log for a job, in append order
    async fn events_for(&self, job_id: Uuid) -> Result<Vec<JobEvent>, StoreError>;
}
