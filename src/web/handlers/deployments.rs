//! Deployment HTTP handlers
//!
//! Thin wrappers over the scheduler and job store: parse the request,
//! delegate, map the outcome. No lifecycle logic lives here.

use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::models::DeploySpec;
use crate::web::{
    AppState,
    responses::{
        cancel_error_response, created, not_found_response, ok, rerun_error_response,
        store_error_response, submit_error_response,
    },
};

fn default_list_limit() -> usize {
    100
}

/// Query parameters for listing deployments
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListDeploymentsParams {
    /// Only return jobs for this target
    pub target: Option<String>,
    /// Maximum number of jobs to return, newest first
    #[serde(default = "default_list_limit")]
    pub limit: usize,
}

/// Submit a new deployment
#[utoipa::path(
    post,
    path = "/deployments",
    tag = "deployments",
    request_body = DeploySpec,
    responses(
        (status = 201, description = "Deployment admitted and queued"),
        (status = 400, description = "Spec failed validation"),
        (status = 409, description = "Target already has an active deployment"),
        (status = 429, description = "Engine is at its concurrency limit"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn submit_deployment(
    State(state): State<AppState>,
    Json(spec): Json<DeploySpec>,
) -> Response {
    debug!(target = %spec.target, image = %spec.image, "deployment submission received");
    match state.scheduler.submit(spec).await {
        Ok(job) => created(job).into_response(),
        Err(error) => submit_error_response(error),
    }
}

/// List recent deployments
#[utoipa::path(
    get,
    path = "/deployments",
    tag = "deployments",
    params(ListDeploymentsParams),
    responses(
        (status = 200, description = "Deployments, newest first"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn list_deployments(
    State(state): State<AppState>,
    Query(params): Query<ListDeploymentsParams>,
) -> Response {
    let result = match &params.target {
        Some(target) => state.store.list_by_target(target).await,
        None => state.store.list_recent(params.limit).await,
    };
    match result {
        Ok(mut jobs) => {
            jobs.truncate(params.limit);
            ok(jobs).into_response()
        }
        Err(error) => store_error_response(error),
    }
}

/// Get a deployment by id
#[utoipa::path(
    get,
    path = "/deployments/{id}",
    tag = "deployments",
    params(
        ("id" = Uuid, Path, description = "Deployment job id"),
    ),
    responses(
        (status = 200, description = "Deployment details"),
        (status = 404, description = "No such deployment"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn get_deployment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.store.get(id).await {
        Ok(Some(job)) => ok(job).into_response(),
        Ok(None) => not_found_response("deployment", id),
        Err(error) => store_error_response(error),
    }
}

/// Request cancellation of a running deployment
///
/// Acknowledges with the job as it was at the time of the request; the
/// `cancelled` state lands asynchronously once the executor reaches its
/// next step boundary.
#[utoipa::path(
    post,
    path = "/deployments/{id}/cancel",
    tag = "deployments",
    params(
        ("id" = Uuid, Path, description = "Deployment job id"),
    ),
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 404, description = "No such deployment"),
        (status = 409, description = "Deployment already settled"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn cancel_deployment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.scheduler.cancel(id).await {
        Ok(job) => ok(job).into_response(),
        Err(error) => cancel_error_response(error),
    }
}

/// Re-deploy using the spec of an earlier job
#[utoipa::path(
    post,
    path = "/deployments/{id}/rerun",
    tag = "deployments",
    params(
        ("id" = Uuid, Path, description = "Job id whose spec to redeploy"),
    ),
    responses(
        (status = 201, description = "New deployment admitted"),
        (status = 404, description = "No such deployment"),
        (status = 409, description = "Target already has an active deployment"),
        (status = 429, description = "Engine is at its concurrency limit"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn rerun_deployment(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.scheduler.rerun(id).await {
        Ok(job) => created(job).into_response(),
        Err(error) => rerun_error_response(error),
    }
}

/// Get the persisted transition log of a deployment
#[utoipa::path(
    get,
    path = "/deployments/{id}/events",
    tag = "deployments",
    params(
        ("id" = Uuid, Path, description = "Deployment job id"),
    ),
    responses(
        (status = 200, description = "Transition events in append order"),
        (status = 404, description = "No such deployment"),
        (status = 500, description = "Internal server error"),
    )
)]
pub async fn get_deployment_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.store.get(id).await {
        Ok(Some(_)) => match state.store.events_for(id).await {
            Ok(events) => ok(events).into_response(),
            Err(error) => store_error_response(error),
        },
        Ok(None) => not_found_response("deployment", id),
        Err(error) => store_error_response(error),
    }
}
