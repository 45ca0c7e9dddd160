use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Use the library instead of redeclaring modules
use deployd::{
    config::{Config, ProbeMode, RuntimeMode},
    health::{HealthProbe, HttpHealthProbe, RuntimeStatusProbe},
    orchestrator::{DeploymentScheduler, EventBus},
    runtime::{ContainerRuntime, DockerCliRuntime, SimulatedRuntime},
    store::{JobStore, MemoryJobStore},
    web::{AppState, SystemMonitor, WebServer},
};

#[derive(Parser)]
#[command(name = "deployd")]
#[command(version = "0.1.0")]
#[command(about = "A container deployment engine with health-gated rollouts")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Container runtime (docker, simulated; overrides config file)
    #[arg(short = 'r', long, value_name = "MODE")]
    runtime: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging with specified level
    let log_filter = if cli.log_level == "trace" {
        format!("deployd={},tower_http=trace", cli.log_level)
    } else {
        format!("deployd={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting deployd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from specified file
    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    // Override config with CLI arguments
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(mode) = cli.runtime {
        config.runtime.mode = match mode.as_str() {
            "docker" => RuntimeMode::Docker,
            "simulated" => RuntimeMode::Simulated,
            other => return Err(anyhow::anyhow!("unknown runtime mode '{other}'")),
        };
    }
    config.validate()?;

    let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
    let events = EventBus::new(config.events.channel_capacity);

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime.mode {
        RuntimeMode::Docker => {
            info!(binary = %config.runtime.docker_binary, "using docker CLI runtime");
            Arc::new(DockerCliRuntime::new(config.runtime.docker_binary.clone()))
        }
        RuntimeMode::Simulated => {
            info!("using simulated container runtime");
            Arc::new(SimulatedRuntime::new(config.runtime.simulated_step_delay))
        }
    };

    let probe: Arc<dyn HealthProbe> = match config.health.probe {
        ProbeMode::Http => Arc::new(HttpHealthProbe::new(config.health.request_timeout)),
        ProbeMode::Container => Arc::new(RuntimeStatusProbe::new(
            runtime.clone(),
            config.health.request_timeout,
        )),
    };

    let scheduler = Arc::new(DeploymentScheduler::new(
        store.clone(),
        runtime,
        probe,
        events.clone(),
        &config,
    ));

    // Settle anything a previous process left behind before accepting
    // traffic.
    let recovered = scheduler.recover().await?;
    if recovered > 0 {
        info!(recovered, "settled jobs orphaned by a previous run");
    }

    let monitor = SystemMonitor::new(Duration::from_secs(5));
    let state = AppState {
        scheduler: scheduler.clone(),
        store,
        events,
        system: monitor.system(),
        start_time: chrono::Utc::now(),
    };

    let web_server = WebServer::new(&config, state)?;
    info!("Starting web server on {}", web_server.addr());

    // Create a channel to signal when the server is ready or fails to bind
    let (server_ready_tx, server_ready_rx) = tokio::sync::oneshot::channel();
    let shutdown_token = tokio_util::sync::CancellationToken::new();

    let server_token = shutdown_token.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = web_server
            .serve_with_cancellation(server_ready_tx, Some(server_token))
            .await
        {
            tracing::error!("Web server failed: {}", e);
        }
    });

    // Wait for the server bind result (success or failure)
    match server_ready_rx.await {
        Ok(Ok(())) => {
            info!("Web server is now listening");
        }
        Ok(Err(bind_error)) => {
            tracing::error!("Failed to bind web server: {}", bind_error);
            return Err(bind_error);
        }
        Err(_) => {
            tracing::error!("Web server task completed without signaling");
            return Err(anyhow::anyhow!("Web server failed to start"));
        }
    }

    // Serve until a shutdown signal arrives, then drain: stop accepting
    // requests first, then cancel running jobs and wait them out.
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received");

    shutdown_token.cancel();
    scheduler.shutdown(config.orchestrator.shutdown_grace).await;
    server_handle.await?;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        info!("Received Ctrl+C");
    }
}
