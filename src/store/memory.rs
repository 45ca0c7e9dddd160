//! In-memory `JobStore` backend
//!
//! Jobs and event logs live in maps behind async read/write locks. The CAS
//! in `update_state` holds the job-map write lock for the whole
//! read-compare-mutate sequence, which is what makes it atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Job, JobEvent, JobState, TerminalReason};

use super::{JobStore, StoreError};

#[derive(Clone, Default)]
pub struct MemoryJobStore {
    jobs: Arc<RwLock<HashMap<Uuid, Job>>>,
    events: Arc<RwLock<HashMap<Uuid, Vec<JobEvent>>>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job: Job) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(StoreError::AlreadyExists { job_id: job.id });
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn update_state(
        &self,
        job_id: Uuid,
        expected: JobState,
        new: JobState,
        reason: Option<TerminalReason>,
        detail: Option<String>,
    ) -> Result<Job, StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { job_id })?;

        if job.state != expected || job.state.is_terminal() {
            return Err(StoreError::Conflict {
                job_id,
                expected,
                actual: job.state,
            });
        }
        if !job.state.can_transition_to(new) {
            return Err(StoreError::IllegalTransition {
                job_id,
                from: job.state,
                to: new,
            });
        }

        job.state = new;
        job.updated_at = Utc::now();
        if new.is_terminal() {
            job.terminal_reason = reason;
            job.terminal_detail = detail;
        }
        Ok(job.clone())
    }

    async fn record_container(&self, job_id: Uuid, container_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::NotFound { job_id })?;
        job.container_id = Some(container_id.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_by_target(&self, target: &str) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matched: Vec<Job> = jobs.values().filter(|j| j.target == target).cloned().collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut all: Vec<Job> = jobs.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn list_non_terminal(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| !j.is_terminal()).cloned().collect())
    }

    async fn append_event(&self, event: JobEvent) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        events.entry(event.job_id).or_default().push(event);
        Ok(())
    }

    async fn events_for(&self, job_id: Uuid) -> Result<Vec<JobEvent>, StoreError> {
        let events = self.events.read().await;
        Ok(events.get(&job_id).cloned().unwrap_or_default())
    }
}
