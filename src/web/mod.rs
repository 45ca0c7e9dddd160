//! Web layer module
//!
//! HTTP interface over the deployment engine: admission, cancellation,
//! job inspection, live event streaming and status. Handlers are thin
//! and delegate to the scheduler and job store; lifecycle logic never
//! lives here.

use anyhow::Result;
use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::orchestrator::{DeploymentScheduler, EventBus};
use crate::store::JobStore;

pub mod handlers;
pub mod openapi;
pub mod responses;
pub mod system_monitor;

pub use responses::ApiResponse;
pub use system_monitor::SystemMonitor;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<DeploymentScheduler>,
    pub store: Arc<dyn JobStore>,
    pub events: EventBus,
    pub system: Arc<tokio::sync::RwLock<sysinfo::System>>,
    /// Application start time for uptime calculation
    pub start_time: chrono::DateTime<chrono::Utc>,
}

/// Build the full application router. Public so integration tests can
/// drive the API without binding a socket.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/live", get(handlers::health::liveness_check))
        .nest("/api/v1", api_v1_routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/deployments",
            get(handlers::deployments::list_deployments)
                .post(handlers::deployments::submit_deployment),
        )
        .route(
            "/deployments/{id}",
            get(handlers::deployments::get_deployment),
        )
        .route(
            "/deployments/{id}/cancel",
            post(handlers::deployments::cancel_deployment),
        )
        .route(
            "/deployments/{id}/rerun",
            post(handlers::deployments::rerun_deployment),
        )
        .route(
            "/deployments/{id}/events",
            get(handlers::deployments::get_deployment_events),
        )
        .route("/events", get(handlers::events::stream_events))
        .route("/system/status", get(handlers::system::system_status))
        .route("/openapi.json", get(openapi::serve_openapi_spec))
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: &Config, state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.web.host, config.web.port).parse()?;
        Ok(Self {
            app: create_router(state),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start the web server
    pub async fn serve(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app).await?;
        Ok(())
    }

    /// Serve with cancellation support and a notification once the
    /// listener is actually bound (or failed to bind).
    pub async fn serve_with_cancellation(
        self,
        ready_signal: tokio::sync::oneshot::Sender<Result<()>>,
        cancellation_token: Option<tokio_util::sync::CancellationToken>,
    ) -> Result<()> {
        match tokio::net::TcpListener::bind(&self.addr).await {
            Ok(listener) => {
                let _ = ready_signal.send(Ok(()));

                let shutdown_signal = async move {
                    if let Some(token) = &cancellation_token {
                        token.cancelled().await;
                        tracing::info!("web server received cancellation signal, shutting down");
                    } else {
                        #[cfg(unix)]
                        {
                            use tokio::signal::unix::{SignalKind, signal};
                            let mut sigterm = signal(SignalKind::terminate())
                                .expect("failed to install SIGTERM handler");
                            let mut sigint = signal(SignalKind::interrupt())
                                .expect("failed to install SIGINT handler");

                            tokio::select! {
                                _ = sigterm.recv() => {
                                    tracing::info!("received SIGTERM, shutting down");
                                }
                                _ = sigint.recv() => {
                                    tracing::info!("received SIGINT, shutting down");
                                }
                            }
                        }

                        #[cfg(not(unix))]
                        {
                            use tokio::signal;
                            signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
                            tracing::info!("received Ctrl+C, shutting down");
                        }
                    }
                };

                axum::serve(listener, self.app)
                    .with_graceful_shutdown(shutdown_signal)
                    .await?;
                Ok(())
            }
            Err(bind_error) => {
                let message = format!("failed to bind to {}: {}", self.addr, bind_error);
                let _ = ready_signal.send(Err(anyhow::anyhow!("{}", message)));
                Err(anyhow::anyhow!("{}", message))
            }
        }
    }
}
