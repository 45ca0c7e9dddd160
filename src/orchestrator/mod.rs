//! Job orchestration subsystem for deployd
//!
//! This module coordinates concurrent deployment jobs:
//! - Admission with per-target serialization and a global concurrency cap
//! - One executor task per job, driving build/start/health-check steps
//! - Write-ahead persistence: every transition hits the store before the
//!   event announcing it is broadcast
//! - Cooperative cancellation at step boundaries
//!
//! The system is built around four main components:
//! - `TargetLocks`: atomic claim-or-reject map serializing each target
//! - `EventBus`: bounded broadcast fan-out of job lifecycle events
//! - `JobExecutor`: drives a single job to a terminal state
//! - `DeploymentScheduler`: admission, cancellation, rerun, recovery

pub mod events;
pub mod executor;
pub mod scheduler;
pub mod target_locks;

pub use events::{EventBus, EventFilter, EventStream, StreamItem};
pub use executor::{ExecutorSettings, JobExecutor};
pub use scheduler::{DeploymentScheduler, SchedulerStats};
pub use target_locks::TargetLocks;
