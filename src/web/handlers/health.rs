//! Health check HTTP handlers
//!
//! Liveness is unconditional; readiness additionally proves the job store
//! answers queries, since every API operation goes through it.

use axum::{extract::State, response::IntoResponse};

use crate::web::{AppState, responses::ok};

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is healthy"),
    )
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.scheduler.stats().await;
    ok(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "active_jobs": stats.active_jobs,
        "timestamp": chrono::Utc::now(),
    }))
}

/// Readiness check (for Kubernetes probes)
#[utoipa::path(
    get,
    path = "/ready",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready to accept deployments"),
        (status = 503, description = "Job store is not answering"),
    )
)]
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_recent(1).await {
        Ok(_) => ok(serde_json::json!({
            "status": "ready",
            "timestamp": chrono::Utc::now(),
        }))
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "readiness check failed against job store");
            axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Liveness check (for Kubernetes probes)
#[utoipa::path(
    get,
    path = "/live",
    tag = "health",
    responses(
        (status = 200, description = "Process is alive"),
    )
)]
pub async fn liveness_check() -> impl IntoResponse {
    ok(serde_json::json!({
        "status": "alive",
        "timestamp": chrono::Utc::now(),
    }))
}
