//! End-to-end orchestration scenarios
//!
//! Drives the scheduler, executor, store, and event bus as one assembled
//! stack, with the simulated runtime scripted per target to reach every
//! terminal outcome:
//! - Full lifecycle journaling (store and broadcast agree on the sequence)
//! - Per-target single-flight under concurrent submissions
//! - Global capacity enforcement and slot reuse after settlement
//! - Cancellation at step boundaries without leaked containers
//! - Health-check deadline classification
//! - Rerun after a fixed build, restart recovery, graceful shutdown

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use deployd::config::Config;
use deployd::errors::{RerunError, SubmitError};
use deployd::health::RuntimeStatusProbe;
use deployd::models::{DeploySpec, EventKind, Job, JobState, PortMapping, TerminalReason};
use deployd::orchestrator::{DeploymentScheduler, EventBus, EventFilter, StreamItem};
use deployd::runtime::SimulatedRuntime;
use deployd::store::{JobStore, MemoryJobStore};

struct Stack {
    store: Arc<MemoryJobStore>,
    runtime: Arc<SimulatedRuntime>,
    events: EventBus,
    scheduler: Arc<DeploymentScheduler>,
}

fn stack(max_jobs: usize) -> Stack {
    stack_with_step_delay(max_jobs, Duration::from_millis(5))
}

fn stack_with_step_delay(max_jobs: usize, step_delay: Duration) -> Stack {
    let mut config = Config::default();
    config.orchestrator.max_concurrent_jobs = max_jobs;
    config.runtime.simulated_step_delay = step_delay;
    config.health.interval = Duration::from_millis(20);
    config.health.deadline = Duration::from_millis(300);
    config.health.max_attempts = 20;

    let store = Arc::new(MemoryJobStore::new());
    let runtime = Arc::new(SimulatedRuntime::new(config.runtime.simulated_step_delay));
    let probe = Arc::new(RuntimeStatusProbe::new(
        runtime.clone(),
        Duration::from_secs(1),
    ));
    let events = EventBus::new(config.events.channel_capacity);
    let scheduler = Arc::new(DeploymentScheduler::new(
        store.clone(),
        runtime.clone(),
        probe,
        events.clone(),
        &config,
    ));

    Stack {
        store,
        runtime,
        events,
        scheduler,
    }
}

fn spec(target: &str) -> DeploySpec {
    DeploySpec {
        target: target.to_string(),
        image: "registry.example.com/app:1.0".to_string(),
        ports: vec![PortMapping {
            host: 8080,
            container: 80,
        }],
        env: BTreeMap::new(),
        resources: None,
        health_path: None,
    }
}

/// Poll the store until the job reaches a terminal state or the timeout lapses.
async fn wait_terminal(store: &Arc<MemoryJobStore>, job_id: Uuid, timeout: Duration) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store
            .get(job_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("job {job_id} missing from store"));
        if job.is_terminal() {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job {job_id} still {:?} at deadline", job.state);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Submit with a short retry window, absorbing the instant between a job's
/// terminal write landing in the store and its lock/slot actually releasing.
async fn submit_with_retry(
    scheduler: &Arc<DeploymentScheduler>,
    spec: DeploySpec,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match scheduler.submit(spec.clone()).await {
            Ok(job) => return job,
            Err(SubmitError::AtCapacity { .. }) | Err(SubmitError::TargetBusy { .. })
                if tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(other) => panic!("submission not admitted: {other}"),
        }
    }
}

#[tokio::test]
async fn success_lifecycle_is_fully_journaled() {
    let stack = stack(4);

    let job = stack.scheduler.submit(spec("web")).await.unwrap();
    let settled = wait_terminal(&stack.store, job.id, Duration::from_secs(5)).await;

    assert_eq!(settled.state, JobState::Succeeded);
    assert!(settled.terminal_reason.is_none());
    assert!(settled.container_id.is_some());

    let journal = stack.store.events_for(job.id).await.unwrap();
    let states: Vec<JobState> = journal
        .iter()
        .filter(|event| event.kind == EventKind::Transition)
        .map(|event| event.state)
        .collect();
    assert_eq!(
        states,
        vec![
            JobState::Queued,
            JobState::Building,
            JobState::Starting,
            JobState::HealthChecking,
            JobState::Succeeded,
        ]
    );
    for pair in journal.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    assert_eq!(
        stack.runtime.running_containers().await,
        vec!["deployd-web".to_string()]
    );
}

#[tokio::test]
async fn concurrent_submissions_for_one_target_admit_exactly_one() {
    let stack = stack(8);
    stack.runtime.never_healthy_for("web").await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let scheduler = stack.scheduler.clone();
        let candidate = spec("web");
        handles.push(tokio::spawn(
            async move { scheduler.submit(candidate).await },
        ));
    }

    let mut admitted = Vec::new();
    let mut busy = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => admitted.push(job),
            Err(SubmitError::TargetBusy { .. }) => busy += 1,
            Err(other) => panic!("unexpected rejection: {other}"),
        }
    }
    assert_eq!(admitted.len(), 1, "exactly one submission may hold a target");
    assert_eq!(busy, 7);

    stack.scheduler.cancel(admitted[0].id).await.unwrap();
    let settled = wait_terminal(&stack.store, admitted[0].id, Duration::from_secs(5)).await;
    assert_eq!(settled.state, JobState::Cancelled);
}

#[tokio::test]
async fn capacity_slot_frees_when_a_job_settles() {
    let stack = stack(2);
    stack.runtime.never_healthy_for("a").await;
    stack.runtime.never_healthy_for("b").await;

    let first = stack.scheduler.submit(spec("a")).await.unwrap();
    let _second = stack.scheduler.submit(spec("b")).await.unwrap();

    let err = stack.scheduler.submit(spec("c")).await.unwrap_err();
    assert!(matches!(err, SubmitError::AtCapacity { limit: 2 }));

    stack.scheduler.cancel(first.id).await.unwrap();
    wait_terminal(&stack.store, first.id, Duration::from_secs(5)).await;

    let third = submit_with_retry(&stack.scheduler, spec("c"), Duration::from_secs(2)).await;
    wait_terminal(&stack.store, third.id, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn cancel_mid_build_never_starts_a_container() {
    let stack = stack_with_step_delay(4, Duration::from_millis(150));

    let job = stack.scheduler.submit(spec("web")).await.unwrap();

    // Catch the job inside its (slow) build step, then cancel.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = stack.store.get(job.id).await.unwrap().unwrap();
        if current.state == JobState::Building {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("job never reached the building state");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    stack.scheduler.cancel(job.id).await.unwrap();

    let settled = wait_terminal(&stack.store, job.id, Duration::from_secs(5)).await;
    assert_eq!(settled.state, JobState::Cancelled);
    assert_eq!(settled.terminal_reason, Some(TerminalReason::Cancelled));
    assert!(settled.container_id.is_none());
    assert!(stack.runtime.running_containers().await.is_empty());

    let states: Vec<JobState> = stack
        .store
        .events_for(job.id)
        .await
        .unwrap()
        .iter()
        .filter(|event| event.kind == EventKind::Transition)
        .map(|event| event.state)
        .collect();
    assert_eq!(
        states,
        vec![JobState::Queued, JobState::Building, JobState::Cancelled]
    );
}

#[tokio::test]
async fn unhealthy_deployment_is_classified_as_health_timeout() {
    let stack = stack(4);
    stack.runtime.never_healthy_for("web").await;

    let job = stack.scheduler.submit(spec("web")).await.unwrap();
    let settled = wait_terminal(&stack.store, job.id, Duration::from_secs(5)).await;

    assert_eq!(settled.state, JobState::Failed);
    assert_eq!(
        settled.terminal_reason,
        Some(TerminalReason::HealthCheckTimeout)
    );
    let detail = settled.terminal_detail.as_deref().unwrap();
    assert!(detail.contains("health check failed"), "detail: {detail}");

    // The failed container is stopped, not left half-deployed.
    assert!(stack.runtime.running_containers().await.is_empty());
}

#[tokio::test]
async fn live_subscribers_see_the_whole_run_in_order() {
    let stack = stack(4);

    let mut stream = stack.events.subscribe(EventFilter::All);
    let job = stack.scheduler.submit(spec("web")).await.unwrap();

    let mut live_states = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(StreamItem::Event(event))) => {
                if event.job_id != job.id || event.kind != EventKind::Transition {
                    continue;
                }
                live_states.push(event.state);
                if event.state.is_terminal() {
                    break;
                }
            }
            Ok(Some(StreamItem::Lagged(_))) => continue,
            Ok(None) => panic!("event stream closed before the job settled"),
            Err(_) => panic!("no event within timeout"),
        }
    }

    assert_eq!(
        live_states,
        vec![
            JobState::Queued,
            JobState::Building,
            JobState::Starting,
            JobState::HealthChecking,
            JobState::Succeeded,
        ]
    );
}

#[tokio::test]
async fn log_lines_are_broadcast_but_not_journaled() {
    let stack = stack(4);
    stack.runtime.never_healthy_for("web").await;

    let job = stack.scheduler.submit(spec("web")).await.unwrap();
    let mut stream = stack.events.subscribe(EventFilter::Job(job.id));

    let mut saw_log_line = false;
    while !saw_log_line {
        match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
            Ok(Some(StreamItem::Event(event))) if event.kind == EventKind::Log => {
                assert!(event.detail.is_some());
                saw_log_line = true;
            }
            Ok(Some(_)) => continue,
            Ok(None) => panic!("stream closed before any log line"),
            Err(_) => panic!("no log line within timeout"),
        }
    }

    // The job may have hit its health deadline already; either way it settles.
    let _ = stack.scheduler.cancel(job.id).await;
    wait_terminal(&stack.store, job.id, Duration::from_secs(5)).await;

    let journal = stack.store.events_for(job.id).await.unwrap();
    assert!(
        journal
            .iter()
            .all(|event| event.kind == EventKind::Transition),
        "the persisted journal holds transitions only"
    );
}

#[tokio::test]
async fn rerun_after_fixed_build_replaces_the_slot() {
    let stack = stack(4);
    stack.runtime.fail_build_for("web").await;

    let first = stack.scheduler.submit(spec("web")).await.unwrap();
    let failed = wait_terminal(&stack.store, first.id, Duration::from_secs(5)).await;
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.terminal_reason, Some(TerminalReason::BuildFailed));
    assert!(stack.runtime.running_containers().await.is_empty());

    stack.runtime.clear_script_for("web").await;

    let second = {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match stack.scheduler.rerun(first.id).await {
                Ok(job) => break job,
                Err(RerunError::Submit(SubmitError::TargetBusy { .. }))
                    if tokio::time::Instant::now() < deadline =>
                {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Err(other) => panic!("rerun rejected: {other}"),
            }
        }
    };
    assert_ne!(second.id, first.id);
    assert_eq!(second.attempt, 1);
    assert_eq!(second.spec, first.spec);

    let settled = wait_terminal(&stack.store, second.id, Duration::from_secs(5)).await;
    assert_eq!(settled.state, JobState::Succeeded);
    assert_eq!(
        stack.runtime.running_containers().await,
        vec!["deployd-web".to_string()]
    );
}

#[tokio::test]
async fn recovery_settles_orphans_and_reopens_the_target() {
    let stack = stack(4);

    // A previous process died mid-flight: the store holds a non-terminal job
    // with a recorded container, and nobody is driving it.
    let mut orphan = Job::new(spec("web"), 0);
    orphan.state = JobState::Starting;
    let orphan = stack.store.create(orphan).await.unwrap();
    stack
        .store
        .record_container(orphan.id, "stale-container")
        .await
        .unwrap();

    assert_eq!(stack.scheduler.recover().await.unwrap(), 1);

    let settled = stack.store.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(settled.state, JobState::Failed);
    assert_eq!(settled.terminal_reason, Some(TerminalReason::InternalError));

    // The target is immediately deployable again.
    let job = stack.scheduler.submit(spec("web")).await.unwrap();
    let fresh = wait_terminal(&stack.store, job.id, Duration::from_secs(5)).await;
    assert_eq!(fresh.state, JobState::Succeeded);
}

#[tokio::test]
async fn shutdown_drains_every_active_job() {
    let stack = stack(4);
    stack.runtime.never_healthy_for("a").await;
    stack.runtime.never_healthy_for("b").await;

    let first = stack.scheduler.submit(spec("a")).await.unwrap();
    let second = stack.scheduler.submit(spec("b")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;

    stack.scheduler.shutdown(Duration::from_secs(5)).await;

    for id in [first.id, second.id] {
        let job = stack.store.get(id).await.unwrap().unwrap();
        assert!(job.is_terminal(), "job {id} left non-terminal after shutdown");
    }
    assert!(stack.runtime.running_containers().await.is_empty());
    assert_eq!(stack.scheduler.stats().await.active_jobs, 0);
}
