//! OpenAPI documentation generation using utoipa
//!
//! Handlers carry `#[utoipa::path]` annotations; this module collects
//! them with the schemas into one document served at
//! `/api/v1/openapi.json`.

use axum::{Json, response::IntoResponse};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Deployd API",
        version = "0.0.1",
        description = "Container deployment orchestration: submit a deployment for a target, follow it through build, start and health checking, and stream lifecycle events live.",
    ),
    servers(
        (url = "/api/v1", description = "API Version 1"),
    ),
    tags(
        (name = "deployments", description = "Deployment submission, inspection and control"),
        (name = "events", description = "Live deployment event streaming"),
        (name = "system", description = "Engine and host status"),
        (name = "health", description = "Service health monitoring"),
    ),
    components(
        schemas(
            crate::models::DeploySpec,
            crate::models::PortMapping,
            crate::models::ResourceLimits,
            crate::models::Job,
            crate::models::JobState,
            crate::models::TerminalReason,
            crate::models::JobEvent,
            crate::models::EventKind,
            crate::web::responses::ApiResponse<crate::models::Job>,
            crate::web::handlers::system::SystemStatus,
            crate::web::handlers::system::OrchestratorStatus,
            crate::web::handlers::system::JobCounts,
            crate::web::handlers::system::HostStatus,
        )
    ),
    paths(
        crate::web::handlers::deployments::submit_deployment,
        crate::web::handlers::deployments::list_deployments,
        crate::web::handlers::deployments::get_deployment,
        crate::web::handlers::deployments::cancel_deployment,
        crate::web::handlers::deployments::rerun_deployment,
        crate::web::handlers::deployments::get_deployment_events,
        crate::web::handlers::events::stream_events,
        crate::web::handlers::system::system_status,
        crate::web::handlers::health::health_check,
        crate::web::handlers::health::readiness_check,
        crate::web::handlers::health::liveness_check,
    )
)]
pub struct ApiDoc;

/// The OpenAPI specification with the build version filled in
pub fn get_openapi_spec() -> utoipa::openapi::OpenApi {
    let mut openapi = ApiDoc::openapi();
    openapi.info.version = env!("CARGO_PKG_VERSION").to_string();
    openapi
}

/// Serve the OpenAPI specification JSON
pub async fn serve_openapi_spec() -> impl IntoResponse {
    Json(get_openapi_spec())
}
