//! System status handler
//!
//! One endpoint that answers "what is this engine doing and how is the
//! host holding up". Job counts come from a bounded window of recent
//! jobs, not a full table scan.

use axum::{
    extract::State,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::JobState;
use crate::web::{
    AppState,
    responses::{ok, store_error_response},
};

/// How many recent jobs the per-state counts consider
const RECENT_JOBS_WINDOW: usize = 500;

/// Engine and host status
#[derive(Debug, Serialize, ToSchema)]
pub struct SystemStatus {
    pub version: String,
    /// Seconds since the service started
    pub uptime_seconds: i64,
    pub orchestrator: OrchestratorStatus,
    pub jobs: JobCounts,
    pub host: HostStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrchestratorStatus {
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub busy_targets: usize,
    /// Events dropped across all slow subscribers since startup
    pub events_dropped: u64,
}

/// Per-state counts over the recent-jobs window
#[derive(Debug, Default, Serialize, ToSchema)]
pub struct JobCounts {
    pub queued: usize,
    pub building: usize,
    pub starting: usize,
    pub health_checking: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HostStatus {
    pub total_memory_mb: u64,
    pub used_memory_mb: u64,
    pub cpu_usage_percent: f32,
    pub load_average_one: f64,
}

/// Engine and host status
#[utoipa::path(
    get,
    path = "/system/status",
    tag = "system",
    responses(
        (status = 200, description = "Engine load, job counts and host metrics"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn system_status(State(state): State<AppState>) -> Response {
    let jobs = match state.store.list_recent(RECENT_JOBS_WINDOW).await {
        Ok(jobs) => jobs,
        Err(error) => return store_error_response(error),
    };

    let mut counts = JobCounts::default();
    for job in &jobs {
        match job.state {
            JobState::Queued => counts.queued += 1,
            JobState::Building => counts.building += 1,
            JobState::Starting => counts.starting += 1,
            JobState::HealthChecking => counts.health_checking += 1,
            JobState::Succeeded => counts.succeeded += 1,
            JobState::Failed => counts.failed += 1,
            JobState::Cancelled => counts.cancelled += 1,
        }
    }

    let stats = state.scheduler.stats().await;
    let (total_memory, used_memory, cpu_usage) = {
        let system = state.system.read().await;
        (
            system.total_memory(),
            system.used_memory(),
            system.global_cpu_usage(),
        )
    };
    let load = sysinfo::System::load_average();

    let status = SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: (chrono::Utc::now() - state.start_time).num_seconds(),
        orchestrator: OrchestratorStatus {
            active_jobs: stats.active_jobs,
            max_concurrent_jobs: stats.max_concurrent_jobs,
            busy_targets: stats.busy_targets,
            events_dropped: stats.events_dropped,
        },
        jobs: counts,
        host: HostStatus {
            total_memory_mb: total_memory / 1024 / 1024,
            used_memory_mb: used_memory / 1024 / 1024,
            cpu_usage_percent: cpu_usage,
            load_average_one: load.one,
        },
    };

    ok(status).into_response()
}
