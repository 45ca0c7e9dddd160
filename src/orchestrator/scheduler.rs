//! Admission control and the lifecycle front door
//!
//! The scheduler is the only component that creates jobs. Admission is
//! ordered so a rejected submission leaves no trace: validate the spec,
//! claim the target lock, take a concurrency slot, and only then persist
//! the job and hand it to a spawned executor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::{AppResult, CancelError, RerunError, SubmitError};
use crate::health::HealthProbe;
use crate::models::{DeploySpec, Job, JobEvent, JobState, TerminalReason};
use crate::runtime::{container_name, ContainerHandle, ContainerRuntime};
use crate::store::JobStore;

use super::events::EventBus;
use super::executor::{ExecutorSettings, JobExecutor};
use super::target_locks::TargetLocks;

/// Cancellation handles for jobs that are admitted but not yet settled.
/// Executors remove their own entry during settlement.
#[derive(Default)]
pub struct CancellationRegistry {
    inner: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancellationRegistry {
    pub async fn register(&self, job_id: Uuid, token: CancellationToken) {
        self.inner.lock().await.insert(job_id, token);
    }

    pub async fn token(&self, job_id: Uuid) -> Option<CancellationToken> {
        self.inner.lock().await.get(&job_id).cloned()
    }

    pub async fn remove(&self, job_id: Uuid) {
        self.inner.lock().await.remove(&job_id);
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}

/// Point-in-time view of scheduler load, for the system status endpoint
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub active_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub busy_targets: usize,
    pub events_dropped: u64,
}

pub struct DeploymentScheduler {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    events: EventBus,
    locks: Arc<TargetLocks>,
    registry: Arc<CancellationRegistry>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    shutdown_root: CancellationToken,
    settings: ExecutorSettings,
}

impl DeploymentScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        events: EventBus,
        config: &Config,
    ) -> Self {
        let max_concurrent = config.orchestrator.max_concurrent_jobs;
        Self {
            store,
            runtime,
            probe,
            events,
            locks: Arc::new(TargetLocks::new()),
            registry: Arc::new(CancellationRegistry::default()),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            shutdown_root: CancellationToken::new(),
            settings: ExecutorSettings::from_config(config),
        }
    }

    /// Admit a new deployment for `spec` and start executing it.
    pub async fn submit(&self, spec: DeploySpec) -> Result<Job, SubmitError> {
        self.submit_attempt(spec, 0).await
    }

    async fn submit_attempt(&self, spec: DeploySpec, attempt: u32) -> Result<Job, SubmitError> {
        spec.validate()?;
        let job = Job::new(spec, attempt);

        // Single-flight per target: the lock is claimed before a capacity
        // slot so a busy target reports as busy, not as the engine being
        // full.
        if let Err(owner) = self.locks.claim(&job.target, job.id).await {
            debug!(target = %job.target, %owner, "submission rejected, target busy");
            return Err(SubmitError::TargetBusy {
                target: job.target,
                owner,
            });
        }

        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.locks.release(&job.target, job.id).await;
                debug!(target = %job.target, limit = self.max_concurrent, "submission rejected, at capacity");
                return Err(SubmitError::AtCapacity {
                    limit: self.max_concurrent,
                });
            }
        };

        let target = job.target.clone();
        let job_id = job.id;
        let job = match self.store.create(job).await {
            Ok(created) => created,
            Err(e) => {
                self.locks.release(&target, job_id).await;
                drop(permit);
                error!(target = %target, error = %e, "failed to persist admitted job");
                return Err(SubmitError::Internal {
                    message: e.to_string(),
                });
            }
        };

        let queued = JobEvent::transition(&job, Some("queued".to_string()));
        if let Err(e) = self.store.append_event(queued.clone()).await {
            warn!(job_id = %job.id, error = %e, "failed to append queued event");
        }
        self.events.publish(queued);

        let token = self.shutdown_root.child_token();
        self.registry.register(job.id, token.clone()).await;
        tokio::spawn(self.executor().run(job.clone(), token, permit));

        info!(job_id = %job.id, target = %job.target, attempt = job.attempt, "deployment admitted");
        Ok(job)
    }

    /// Request cancellation of a running job. The acknowledgement returns
    /// the job as it was at the time of the request; the `Cancelled`
    /// transition lands asynchronously when the executor reaches its next
    /// step boundary.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, CancelError> {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Err(CancelError::NotFound { job_id }),
            Err(e) => {
                return Err(CancelError::Internal {
                    message: e.to_string(),
                });
            }
        };
        if job.is_terminal() {
            return Err(CancelError::AlreadyTerminal {
                job_id,
                state: job.state,
            });
        }
        match self.registry.token(job_id).await {
            Some(token) => {
                token.cancel();
                info!(job_id = %job_id, target = %job.target, "cancellation requested");
            }
            None => {
                // Non-terminal with no live executor: the request raced
                // with settlement, or the job predates this process.
                warn!(job_id = %job_id, state = %job.state, "no live executor for cancellation request");
            }
        }
        Ok(job)
    }

    /// Re-deploy using the spec of an earlier job. The rerun is an
    /// ordinary submission with the attempt counter bumped, so it is
    /// subject to the same admission rules.
    pub async fn rerun(&self, job_id: Uuid) -> Result<Job, RerunError> {
        let prior = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Err(RerunError::NotFound { job_id }),
            Err(e) => {
                return Err(RerunError::Submit(SubmitError::Internal {
                    message: e.to_string(),
                }));
            }
        };
        let attempt = prior.attempt + 1;
        info!(prior_job = %job_id, target = %prior.spec.target, attempt, "rerunning deployment");
        let job = self.submit_attempt(prior.spec, attempt).await?;
        Ok(job)
    }

    /// Settle jobs a previous process left non-terminal. Runs before the
    /// API begins serving so clients never observe stale active jobs.
    pub async fn recover(&self) -> AppResult<usize> {
        let orphans = self.store.list_non_terminal().await?;
        if orphans.is_empty() {
            return Ok(0);
        }
        warn!(count = orphans.len(), "settling jobs orphaned by a previous run");
        let mut settled = 0usize;
        for job in orphans {
            if let Some(container_id) = &job.container_id {
                let handle = ContainerHandle {
                    id: container_id.clone(),
                    name: container_name(&job.target),
                };
                if let Err(e) = self.runtime.stop(&handle, self.settings.stop_timeout).await {
                    warn!(job_id = %job.id, container = %handle, error = %e, "failed to stop orphaned container");
                }
            }
            match self
                .store
                .update_state(
                    job.id,
                    job.state,
                    JobState::Failed,
                    Some(TerminalReason::InternalError),
                    Some("orphaned by restart".to_string()),
                )
                .await
            {
                Ok(updated) => {
                    let event = JobEvent::transition(&updated, updated.terminal_detail.clone());
                    if let Err(e) = self.store.append_event(event.clone()).await {
                        warn!(job_id = %updated.id, error = %e, "failed to append recovery event");
                    }
                    self.events.publish(event);
                    settled += 1;
                }
                Err(e) => error!(job_id = %job.id, error = %e, "failed to settle orphaned job"),
            }
        }
        Ok(settled)
    }

    /// Cancel every active job and wait for executors to settle, up to
    /// `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        let active = self.registry.active_count().await;
        if active == 0 {
            info!("scheduler shutdown: no active jobs");
            return;
        }
        info!(active, ?grace, "scheduler shutdown: cancelling active jobs");
        self.shutdown_root.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.registry.active_count().await;
            if remaining == 0 {
                info!("all jobs settled");
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "shutdown grace period expired with jobs still settling");
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active_jobs: self.registry.active_count().await,
            max_concurrent_jobs: self.max_concurrent,
            busy_targets: self.locks.claimed_count().await,
            events_dropped: self.events.dropped_events(),
        }
    }

    fn executor(&self) -> JobExecutor {
        JobExecutor::new(
            self.store.clone(),
            self.runtime.clone(),
            self.probe.clone(),
            self.events.clone(),
            self.locks.clone(),
            self.registry.clone(),
            self.settings.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::RuntimeStatusProbe;
    use crate::models::PortMapping;
    use crate::runtime::SimulatedRuntime;
    use crate::store::MemoryJobStore;
    use std::collections::BTreeMap;

    fn test_config(max_jobs: usize) -> Config {
        let mut config = Config::default();
        config.orchestrator.max_concurrent_jobs = max_jobs;
        config.runtime.simulated_step_delay = Duration::from_millis(5);
        config.health.interval = Duration::from_millis(20);
        config.health.deadline = Duration::from_millis(300);
        config.health.max_attempts = 20;
        config
    }

    fn spec(target: &str) -> DeploySpec {
        DeploySpec {
            target: target.to_string(),
            image: "nginx:latest".to_string(),
            ports: vec![PortMapping {
                host: 8080,
                container: 80,
            }],
            env: BTreeMap::new(),
            resources: None,
            health_path: None,
        }
    }

    struct Setup {
        store: Arc<MemoryJobStore>,
        runtime: Arc<SimulatedRuntime>,
        scheduler: DeploymentScheduler,
    }

    fn setup(max_jobs: usize) -> Setup {
        let config = test_config(max_jobs);
        let store = Arc::new(MemoryJobStore::new());
        let runtime = Arc::new(SimulatedRuntime::new(config.runtime.simulated_step_delay));
        let probe = Arc::new(RuntimeStatusProbe::new(
            runtime.clone(),
            Duration::from_secs(1),
        ));
        let scheduler = DeploymentScheduler::new(
            store.clone(),
            runtime.clone(),
            probe,
            EventBus::new(config.events.channel_capacity),
            &config,
        );
        Setup {
            store,
            runtime,
            scheduler,
        }
    }

    async fn wait_terminal(store: &Arc<MemoryJobStore>, job_id: Uuid, timeout: Duration) -> Job {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = store.get(job_id).await.unwrap() {
                if job.is_terminal() {
                    return job;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("job {job_id} did not settle within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submitted_job_runs_to_success() {
        let s = setup(4);
        let job = s.scheduler.submit(spec("web")).await.unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.attempt, 0);

        let settled = wait_terminal(&s.store, job.id, Duration::from_secs(5)).await;
        assert_eq!(settled.state, JobState::Succeeded);

        let stats = s.scheduler.stats().await;
        assert_eq!(stats.active_jobs, 0);
        assert_eq!(stats.busy_targets, 0);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_any_claim() {
        let s = setup(4);
        let mut bad = spec("web");
        bad.target = String::new();

        let err = s.scheduler.submit(bad).await.unwrap_err();
        assert!(matches!(err, SubmitError::InvalidSpec(_)));
        assert_eq!(s.scheduler.stats().await.busy_targets, 0);
    }

    #[tokio::test]
    async fn test_second_submission_for_busy_target_is_rejected() {
        let s = setup(4);
        s.runtime.never_healthy_for("web").await;
        let first = s.scheduler.submit(spec("web")).await.unwrap();

        let err = s.scheduler.submit(spec("web")).await.unwrap_err();
        match err {
            SubmitError::TargetBusy { target, owner } => {
                assert_eq!(target, "web");
                assert_eq!(owner, first.id);
            }
            other => panic!("expected TargetBusy, got {other:?}"),
        }

        // A different target is still admissible.
        s.scheduler.submit(spec("api")).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_rejection_does_not_leak_target_lock() {
        let s = setup(1);
        s.runtime.never_healthy_for("web").await;
        s.scheduler.submit(spec("web")).await.unwrap();

        let err = s.scheduler.submit(spec("api")).await.unwrap_err();
        assert!(matches!(err, SubmitError::AtCapacity { limit: 1 }));

        // The rejected submission must not have left "api" claimed.
        assert_eq!(s.scheduler.stats().await.busy_targets, 1);
    }

    #[tokio::test]
    async fn test_slot_is_reusable_after_settlement() {
        let s = setup(1);
        s.runtime.fail_build_for("web").await;
        let first = s.scheduler.submit(spec("web")).await.unwrap();
        wait_terminal(&s.store, first.id, Duration::from_secs(5)).await;

        // Both the slot and the target free up once the job settles.
        let second = s.scheduler.submit(spec("web")).await.unwrap();
        wait_terminal(&s.store, second.id, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_cancel_settles_job_and_rejects_repeat() {
        let s = setup(4);
        s.runtime.never_healthy_for("web").await;
        let job = s.scheduler.submit(spec("web")).await.unwrap();

        // Wait until the executor is past admission before cancelling.
        tokio::time::sleep(Duration::from_millis(30)).await;
        s.scheduler.cancel(job.id).await.unwrap();

        let settled = wait_terminal(&s.store, job.id, Duration::from_secs(5)).await;
        assert_eq!(settled.state, JobState::Cancelled);
        assert_eq!(settled.terminal_reason, Some(TerminalReason::Cancelled));

        let err = s.scheduler.cancel(job.id).await.unwrap_err();
        assert!(matches!(err, CancelError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn test_cancel_unknown_job_reports_not_found() {
        let s = setup(4);
        let err = s.scheduler.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, CancelError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rerun_bumps_attempt_and_reuses_spec() {
        let s = setup(4);
        s.runtime.fail_build_for("web").await;
        let first = s.scheduler.submit(spec("web")).await.unwrap();
        wait_terminal(&s.store, first.id, Duration::from_secs(5)).await;

        let rerun = s.scheduler.rerun(first.id).await.unwrap();
        assert_ne!(rerun.id, first.id);
        assert_eq!(rerun.attempt, 1);
        assert_eq!(rerun.spec, first.spec);
        wait_terminal(&s.store, rerun.id, Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_rerun_unknown_job_reports_not_found() {
        let s = setup(4);
        let err = s.scheduler.rerun(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RerunError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_recover_settles_orphaned_jobs() {
        let s = setup(4);

        // A job left mid-flight by a previous process: non-terminal in the
        // store with no executor attached.
        let mut orphan = Job::new(spec("web"), 0);
        orphan.state = JobState::Building;
        let orphan = s.store.create(orphan).await.unwrap();

        let settled = s.scheduler.recover().await.unwrap();
        assert_eq!(settled, 1);

        let job = s.store.get(orphan.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.terminal_reason, Some(TerminalReason::InternalError));
        assert_eq!(job.terminal_detail.as_deref(), Some("orphaned by restart"));

        // A second pass finds nothing to do.
        assert_eq!(s.scheduler.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_active_jobs() {
        let s = setup(4);
        s.runtime.never_healthy_for("web").await;
        s.runtime.never_healthy_for("api").await;
        let a = s.scheduler.submit(spec("web")).await.unwrap();
        let b = s.scheduler.submit(spec("api")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        s.scheduler.shutdown(Duration::from_secs(5)).await;

        assert_eq!(
            wait_terminal(&s.store, a.id, Duration::from_secs(1)).await.state,
            JobState::Cancelled
        );
        assert_eq!(
            wait_terminal(&s.store, b.id, Duration::from_secs(1)).await.state,
            JobState::Cancelled
        );
        assert_eq!(s.scheduler.stats().await.active_jobs, 0);
    }
}
