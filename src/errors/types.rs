//! Error type definitions for the deployd service
//!
//! Admission errors (`SubmitError`, `CancelError`, `RerunError`) are the
//! synchronous rejections a caller sees; job-terminal failures are not
//! errors at this level, they settle into the job's `terminal_reason`.

use thiserror::Error;
use uuid::Uuid;

use crate::models::{JobState, SpecValidationError};

/// Top-level application error type
///
/// Used at startup/wiring and as the catch-all the web layer maps to 500.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration loading or validation failures
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Job store failures
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Container runtime adapter failures
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runtime::RuntimeError),

    /// Admission rejections bubbled out of the scheduler
    #[error("Submit rejected: {0}")]
    Submit(#[from] SubmitError),

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AppError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Synchronous rejection of a deployment submission
///
/// Never queued, never retried internally; the caller decides whether to
/// resubmit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The request failed validation; correcting the spec is on the caller
    #[error("invalid deployment spec: {0}")]
    InvalidSpec(#[from] SpecValidationError),

    /// Another non-terminal job already holds this target
    #[error("target '{target}' is busy with job {owner}")]
    TargetBusy { target: String, owner: Uuid },

    /// The global concurrent-job limit is saturated
    #[error("at capacity: {limit} jobs already active")]
    AtCapacity { limit: usize },

    /// The admission write itself failed; nothing was scheduled
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Rejection of a cancellation request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CancelError {
    #[error("job {job_id} not found")]
    NotFound { job_id: Uuid },

    /// The job already settled; cancelling it again is a no-op error
    #[error("job {job_id} is already terminal ({state})")]
    AlreadyTerminal { job_id: Uuid, state: JobState },

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Rejection of a rerun request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RerunError {
    #[error("job {job_id} not found")]
    NotFound { job_id: Uuid },

    /// The fresh submission was rejected at admission
    #[error(transparent)]
    Submit(#[from] SubmitError),
}
