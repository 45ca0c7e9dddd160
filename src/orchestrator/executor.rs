//! Per-job execution
//!
//! One `JobExecutor::run` invocation owns one job from `Queued` to a
//! terminal state. Transitions are write-ahead: the store's CAS write
//! happens first, the event announcing it second. Cancellation is
//! cooperative and observed only at step boundaries; an in-flight runtime
//! call always completes before the signal is honored.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::health::HealthProbe;
use crate::models::{Job, JobEvent, JobState, TerminalReason};
use crate::runtime::{ContainerHandle, ContainerRuntime};
use crate::store::{JobStore, StoreError};

use super::events::EventBus;
use super::scheduler::CancellationRegistry;
use super::target_locks::TargetLocks;

/// Step timeouts and health-check policy, fixed at startup
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub build_timeout: Duration,
    pub start_timeout: Duration,
    pub stop_timeout: Duration,
    pub health_interval: Duration,
    pub health_deadline: Duration,
    pub health_max_attempts: usize,
}

impl ExecutorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            build_timeout: config.runtime.build_timeout,
            start_timeout: config.runtime.start_timeout,
            stop_timeout: config.runtime.stop_timeout,
            health_interval: config.health.interval,
            health_deadline: config.health.deadline,
            health_max_attempts: config.health.max_attempts,
        }
    }
}

pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
    events: EventBus,
    locks: Arc<TargetLocks>,
    registry: Arc<CancellationRegistry>,
    settings: ExecutorSettings,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HealthProbe>,
        events: EventBus,
        locks: Arc<TargetLocks>,
        registry: Arc<CancellationRegistry>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            runtime,
            probe,
            events,
            locks,
            registry,
            settings,
        }
    }

    /// Drive `job` to a terminal state. Every exit path settles the job;
    /// the target lock, cancellation registration, and concurrency permit
    /// are released during settlement.
    pub async fn run(self, mut job: Job, token: CancellationToken, permit: OwnedSemaphorePermit) {
        let started = std::time::Instant::now();
        info!(job_id = %job.id, target = %job.target, attempt = job.attempt, "executor picked up job");

        // -- Queued -> Building ------------------------------------------
        if token.is_cancelled() {
            return self
                .settle(
                    job,
                    None,
                    None,
                    permit,
                    started,
                    JobState::Cancelled,
                    Some(TerminalReason::Cancelled),
                    "cancelled before build started".to_string(),
                )
                .await;
        }
        if let Err(e) = self.transition(&mut job, JobState::Building, "building image").await {
            return self
                .settle(
                    job,
                    None,
                    None,
                    permit,
                    started,
                    JobState::Failed,
                    Some(TerminalReason::InternalError),
                    format!("state write conflicted: {e}"),
                )
                .await;
        }
        match self.runtime.build(&job.spec, self.settings.build_timeout).await {
            Ok(image) => debug!(job_id = %job.id, image = %image, "image ready"),
            Err(e) => {
                return self
                    .settle(
                        job,
                        None,
                        None,
                        permit,
                        started,
                        JobState::Failed,
                        Some(TerminalReason::BuildFailed),
                        format!("build failed: {e}"),
                    )
                    .await;
            }
        }

        // -- Building -> Starting ----------------------------------------
        if token.is_cancelled() {
            return self
                .settle(
                    job,
                    None,
                    None,
                    permit,
                    started,
                    JobState::Cancelled,
                    Some(TerminalReason::Cancelled),
                    "cancelled after build step".to_string(),
                )
                .await;
        }
        if let Err(e) = self
            .transition(&mut job, JobState::Starting, "starting container")
            .await
        {
            return self
                .settle(
                    job,
                    None,
                    None,
                    permit,
                    started,
                    JobState::Failed,
                    Some(TerminalReason::InternalError),
                    format!("state write conflicted: {e}"),
                )
                .await;
        }
        let handle = match self.runtime.run(&job, self.settings.start_timeout).await {
            Ok(handle) => handle,
            Err(e) => {
                return self
                    .settle(
                        job,
                        None,
                        None,
                        permit,
                        started,
                        JobState::Failed,
                        Some(TerminalReason::StartFailed),
                        format!("container start failed: {e}"),
                    )
                    .await;
            }
        };
        if let Err(e) = self.store.record_container(job.id, &handle.id).await {
            warn!(job_id = %job.id, error = %e, "failed to record container id");
        } else {
            job.container_id = Some(handle.id.clone());
        }
        let log_pump = self.spawn_log_pump(&job, &handle).await;

        // -- Starting -> HealthChecking ----------------------------------
        if token.is_cancelled() {
            return self
                .settle(
                    job,
                    Some(handle),
                    log_pump,
                    permit,
                    started,
                    JobState::Cancelled,
                    Some(TerminalReason::Cancelled),
                    "cancelled after container start".to_string(),
                )
                .await;
        }
        if let Err(e) = self
            .transition(&mut job, JobState::HealthChecking, "waiting for readiness probe")
            .await
        {
            return self
                .settle(
                    job,
                    Some(handle),
                    log_pump,
                    permit,
                    started,
                    JobState::Failed,
                    Some(TerminalReason::InternalError),
                    format!("state write conflicted: {e}"),
                )
                .await;
        }

        let deadline = tokio::time::Instant::now() + self.settings.health_deadline;
        let mut attempts: usize = 0;
        let mut last_failure = String::from("no probe attempted");
        let healthy = loop {
            attempts += 1;
            match self.probe.probe(&job, &handle).await {
                Ok(()) => break true,
                Err(e) => {
                    debug!(job_id = %job.id, attempt = attempts, error = %e, "readiness probe not passing");
                    last_failure = e.to_string();
                }
            }
            if attempts >= self.settings.health_max_attempts {
                break false;
            }
            // The next poll would land past the deadline: the step failed.
            if tokio::time::Instant::now() + self.settings.health_interval >= deadline {
                break false;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.health_interval) => {}
                _ = token.cancelled() => {
                    return self
                        .settle(
                            job,
                            Some(handle),
                            log_pump,
                            permit,
                            started,
                            JobState::Cancelled,
                            Some(TerminalReason::Cancelled),
                            "cancelled during health check".to_string(),
                        )
                        .await;
                }
            }
        };
        if !healthy {
            return self
                .settle(
                    job,
                    Some(handle),
                    log_pump,
                    permit,
                    started,
                    JobState::Failed,
                    Some(TerminalReason::HealthCheckTimeout),
                    format!("health check failed after {attempts} attempts: {last_failure}"),
                )
                .await;
        }

        // -- HealthChecking -> Succeeded ---------------------------------
        self.settle(
            job,
            Some(handle),
            log_pump,
            permit,
            started,
            JobState::Succeeded,
            None,
            format!("healthy after {attempts} probe attempt(s)"),
        )
        .await;
    }

    /// Write-ahead non-terminal transition: CAS the store, append the
    /// event, then broadcast it.
    async fn transition(
        &self,
        job: &mut Job,
        next: JobState,
        detail: &str,
    ) -> Result<(), StoreError> {
        match self
            .store
            .update_state(job.id, job.state, next, None, None)
            .await
        {
            Ok(updated) => {
                *job = updated;
                let event = JobEvent::transition(job, Some(detail.to_string()));
                if let Err(e) = self.store.append_event(event.clone()).await {
                    warn!(job_id = %job.id, error = %e, "failed to append transition event");
                }
                self.events.publish(event);
                info!(job_id = %job.id, target = %job.target, state = %job.state, "job transitioned");
                Ok(())
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "state transition rejected");
                Err(e)
            }
        }
    }

    /// Terminal settlement. Order matters: stop the container (unless the
    /// deployment succeeded), persist the terminal state, release the
    /// target lock / registry entry / concurrency slot, and only then
    /// broadcast the terminal event, so a subscriber reacting to it can
    /// resubmit the target at once.
    #[allow(clippy::too_many_arguments)]
    async fn settle(
        &self,
        job: Job,
        container: Option<ContainerHandle>,
        log_pump: Option<JoinHandle<()>>,
        permit: OwnedSemaphorePermit,
        started: std::time::Instant,
        terminal: JobState,
        reason: Option<TerminalReason>,
        detail: String,
    ) {
        if let Some(pump) = log_pump {
            pump.abort();
        }

        if terminal != JobState::Succeeded {
            if let Some(handle) = &container {
                if let Err(e) = self.runtime.stop(handle, self.settings.stop_timeout).await {
                    warn!(job_id = %job.id, container = %handle, error = %e, "best-effort container stop failed");
                }
            }
        }

        let settled = self.write_terminal(&job, terminal, reason, detail).await;

        self.locks.release(&job.target, job.id).await;
        self.registry.remove(job.id).await;
        drop(permit);

        if let Some(final_job) = settled {
            let event = JobEvent::transition(&final_job, final_job.terminal_detail.clone());
            if let Err(e) = self.store.append_event(event.clone()).await {
                warn!(job_id = %final_job.id, error = %e, "failed to append terminal event");
            }
            self.events.publish(event);

            let elapsed = started.elapsed();
            match final_job.state {
                JobState::Succeeded => {
                    info!(job_id = %final_job.id, target = %final_job.target, ?elapsed, "deployment succeeded");
                }
                JobState::Cancelled => {
                    info!(job_id = %final_job.id, target = %final_job.target, ?elapsed, "deployment cancelled");
                }
                _ => {
                    warn!(
                        job_id = %final_job.id,
                        target = %final_job.target,
                        reason = ?final_job.terminal_reason,
                        detail = final_job.terminal_detail.as_deref().unwrap_or(""),
                        ?elapsed,
                        "deployment failed"
                    );
                }
            }
        }
    }

    /// CAS the terminal state in. A conflict means a second writer touched
    /// the job; re-read and, if it is somehow still non-terminal, force it
    /// to `Failed` so no job is ever left dangling.
    async fn write_terminal(
        &self,
        job: &Job,
        terminal: JobState,
        reason: Option<TerminalReason>,
        detail: String,
    ) -> Option<Job> {
        match self
            .store
            .update_state(job.id, job.state, terminal, reason, Some(detail))
            .await
        {
            Ok(updated) => Some(updated),
            Err(first_err) => {
                error!(job_id = %job.id, error = %first_err, "terminal transition conflicted");
                let current = match self.store.get(job.id).await {
                    Ok(Some(current)) => current,
                    Ok(None) => return None,
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "could not re-read job after conflict");
                        return None;
                    }
                };
                if current.is_terminal() {
                    warn!(job_id = %job.id, state = %current.state, "job was settled by another writer");
                    return None;
                }
                match self
                    .store
                    .update_state(
                        job.id,
                        current.state,
                        JobState::Failed,
                        Some(TerminalReason::InternalError),
                        Some(format!("settled after conflicting write: {first_err}")),
                    )
                    .await
                {
                    Ok(updated) => Some(updated),
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "could not settle job after conflict");
                        None
                    }
                }
            }
        }
    }

    /// Forward container log lines onto the bus as live-only events
    async fn spawn_log_pump(&self, job: &Job, handle: &ContainerHandle) -> Option<JoinHandle<()>> {
        match self.runtime.stream_logs(handle).await {
            Ok(mut stream) => {
                let events = self.events.clone();
                let job = job.clone();
                Some(tokio::spawn(async move {
                    while let Some(line) = stream.next_line().await {
                        events.publish(JobEvent::log_line(&job, line));
                    }
                }))
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "could not attach container log stream");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::RuntimeStatusProbe;
    use crate::models::{DeploySpec, EventKind, PortMapping};
    use crate::orchestrator::events::{EventFilter, StreamItem};
    use crate::runtime::SimulatedRuntime;
    use crate::store::MemoryJobStore;
    use std::collections::BTreeMap;
    use tokio::sync::Semaphore;

    struct Harness {
        store: Arc<MemoryJobStore>,
        runtime: Arc<SimulatedRuntime>,
        events: EventBus,
        locks: Arc<TargetLocks>,
        registry: Arc<CancellationRegistry>,
        semaphore: Arc<Semaphore>,
        settings: ExecutorSettings,
    }

    fn fast_settings() -> ExecutorSettings {
        ExecutorSettings {
            build_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(5),
            health_interval: Duration::from_millis(20),
            health_deadline: Duration::from_millis(400),
            health_max_attempts: 50,
        }
    }

    fn harness() -> Harness {
        Harness {
            store: Arc::new(MemoryJobStore::new()),
            runtime: Arc::new(SimulatedRuntime::new(Duration::from_millis(5))),
            events: EventBus::new(64),
            locks: Arc::new(TargetLocks::new()),
            registry: Arc::new(CancellationRegistry::default()),
            semaphore: Arc::new(Semaphore::new(4)),
            settings: fast_settings(),
        }
    }

    impl Harness {
        fn executor(&self) -> JobExecutor {
            JobExecutor::new(
                self.store.clone(),
                self.runtime.clone(),
                Arc::new(RuntimeStatusProbe::new(
                    self.runtime.clone(),
                    Duration::from_secs(1),
                )),
                self.events.clone(),
                self.locks.clone(),
                self.registry.clone(),
                self.settings.clone(),
            )
        }

        /// Admit a job the way the scheduler would: lock claimed, record
        /// created, token registered.
        async fn admit(&self, target: &str) -> (Job, CancellationToken, OwnedSemaphorePermit) {
            let job = Job::new(
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
                },
                0,
            );
            self.locks.claim(target, job.id).await.unwrap();
            let job = self.store.create(job).await.unwrap();
            let token = CancellationToken::new();
            self.registry.register(job.id, token.clone()).await;
            let permit = self.semaphore.clone().try_acquire_owned().unwrap();
            (job, token, permit)
        }

        async fn persisted_states(&self, job_id: uuid::Uuid) -> Vec<JobState> {
            self.store
                .events_for(job_id)
                .await
                .unwrap()
                .into_iter()
                .filter(|e| e.kind == EventKind::Transition)
                .map(|e| e.state)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_success_path_walks_every_state() {
        let h = harness();
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;

        h.executor().run(job, token, permit).await;

        let settled = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(settled.state, JobState::Succeeded);
        assert!(settled.terminal_reason.is_none());
        assert!(settled.container_id.is_some());

        assert_eq!(
            h.persisted_states(job_id).await,
            vec![
                JobState::Building,
                JobState::Starting,
                JobState::HealthChecking,
                JobState::Succeeded
            ]
        );

        // Lock, registry and permit are all released.
        assert_eq!(h.locks.owner("web").await, None);
        assert_eq!(h.registry.active_count().await, 0);
        assert_eq!(h.semaphore.available_permits(), 4);
        // A succeeded deployment keeps its container running.
        assert_eq!(h.runtime.running_containers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_build_failure_settles_failed_with_reason() {
        let h = harness();
        h.runtime.fail_build_for("web").await;
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;

        h.executor().run(job, token, permit).await;

        let settled = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(settled.state, JobState::Failed);
        assert_eq!(settled.terminal_reason, Some(TerminalReason::BuildFailed));
        assert!(settled.terminal_detail.as_deref().unwrap().contains("build failed"));

        assert_eq!(
            h.persisted_states(job_id).await,
            vec![JobState::Building, JobState::Failed]
        );
        assert_eq!(h.locks.owner("web").await, None);
        assert!(h.runtime.running_containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_settles_start_failed() {
        let h = harness();
        h.runtime.fail_start_for("web").await;
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;

        h.executor().run(job, token, permit).await;

        let settled = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(settled.state, JobState::Failed);
        assert_eq!(settled.terminal_reason, Some(TerminalReason::StartFailed));
        assert_eq!(
            h.persisted_states(job_id).await,
            vec![JobState::Building, JobState::Starting, JobState::Failed]
        );
    }

    #[tokio::test]
    async fn test_pre_cancelled_job_settles_without_touching_runtime() {
        let h = harness();
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;
        token.cancel();

        h.executor().run(job, token, permit).await;

        let settled = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(settled.state, JobState::Cancelled);
        assert_eq!(settled.terminal_reason, Some(TerminalReason::Cancelled));
        assert!(settled.container_id.is_none());
        assert_eq!(h.persisted_states(job_id).await, vec![JobState::Cancelled]);
        assert!(h.runtime.running_containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_health_check_stops_container() {
        let h = harness();
        h.runtime.never_healthy_for("web").await;
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;

        let executor = h.executor();
        let run = tokio::spawn(executor.run(job, token.clone(), permit));

        // Let the job reach the health-check loop, then cancel.
        let mut reached = false;
        for _ in 0..100 {
            if let Some(current) = h.store.get(job_id).await.unwrap() {
                if current.state == JobState::HealthChecking {
                    reached = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(reached, "job never reached health checking");
        token.cancel();
        run.await.unwrap();

        let settled = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(settled.state, JobState::Cancelled);
        assert!(h.runtime.running_containers().await.is_empty());
    }

    #[tokio::test]
    async fn test_health_deadline_is_honored_within_one_interval() {
        let h = harness();
        h.runtime.never_healthy_for("web").await;
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;

        let started = std::time::Instant::now();
        h.executor().run(job, token, permit).await;
        let elapsed = started.elapsed();

        let settled = h.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(settled.state, JobState::Failed);
        assert_eq!(
            settled.terminal_reason,
            Some(TerminalReason::HealthCheckTimeout)
        );

        // Two simulated steps (~10ms) plus the health loop; the loop must
        // give up at the deadline, give or take one poll interval.
        let deadline = h.settings.health_deadline;
        let interval = h.settings.health_interval;
        assert!(
            elapsed >= deadline - interval - Duration::from_millis(5),
            "gave up too early: {elapsed:?}"
        );
        assert!(
            elapsed < deadline + interval + Duration::from_millis(200),
            "gave up too late: {elapsed:?}"
        );
        // The unhealthy container was stopped before finalizing.
        assert!(h.runtime.running_containers().await.is_empty());
    }

    /// Order of a state along the lifecycle, for "store is never behind
    /// the broadcast" checks.
    fn phase(state: JobState) -> u8 {
        match state {
            JobState::Queued => 0,
            JobState::Building => 1,
            JobState::Starting => 2,
            JobState::HealthChecking => 3,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled => 4,
        }
    }

    #[tokio::test]
    async fn test_live_subscribers_see_writes_after_the_store() {
        let h = harness();
        let (job, token, permit) = h.admit("web").await;
        let job_id = job.id;
        let mut stream = h.events.subscribe(EventFilter::Job(job_id));

        let store = h.store.clone();
        let run = tokio::spawn(h.executor().run(job, token, permit));

        // Each broadcast state must already be readable from the store:
        // the persisted job is at, or past, the announced state.
        while let Some(item) = stream.next().await {
            let event = match item {
                StreamItem::Event(event) => event,
                StreamItem::Lagged(_) => continue,
            };
            if event.kind != EventKind::Transition {
                continue;
            }
            let persisted = store.get(job_id).await.unwrap().unwrap();
            assert!(
                phase(persisted.state) >= phase(event.state),
                "event {:?} observed before store write {:?}",
                event.state,
                persisted.state
            );
            if event.state.is_terminal() {
                break;
            }
        }
        run.await.unwrap();
    }
}
