//! Service configuration
//!
//! Loaded from a TOML file (`CONFIG_FILE` env var or `./config.toml`); a
//! missing file is created with defaults so a bare `deployd` starts a
//! working simulated instance. Every field has a default; CLI flags
//! override the file.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

pub mod duration_serde;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Hard cap on request handling time before the server gives up
    #[serde(default = "default_request_timeout", with = "duration_serde::duration")]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Global cap on concurrently executing jobs, across all targets
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// How long shutdown waits for active jobs to settle as cancelled
    #[serde(default = "default_shutdown_grace", with = "duration_serde::duration")]
    pub shutdown_grace: Duration,
}

/// Which container engine backs the runtime adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// In-process simulation of build/run/stop; the demo default
    Simulated,
    /// Shell out to the docker CLI
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_mode")]
    pub mode: RuntimeMode,
    /// Binary used in docker mode; override for podman etc.
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    #[serde(default = "default_build_timeout", with = "duration_serde::duration")]
    pub build_timeout: Duration,
    #[serde(default = "default_start_timeout", with = "duration_serde::duration")]
    pub start_timeout: Duration,
    #[serde(default = "default_stop_timeout", with = "duration_serde::duration")]
    pub stop_timeout: Duration,
    /// Per-step latency of the simulated runtime
    #[serde(
        default = "default_simulated_step_delay",
        with = "duration_serde::duration"
    )]
    pub simulated_step_delay: Duration,
}

/// Which readiness probe the health-check step polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// GET the first published host port; 2xx is healthy
    Http,
    /// Inspect the container; `Running` is healthy
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_mode")]
    pub probe: ProbeMode,
    /// Fixed pause between probe attempts
    #[serde(default = "default_health_interval", with = "duration_serde::duration")]
    pub interval: Duration,
    /// Hard deadline for the whole health-check step
    #[serde(default = "default_health_deadline", with = "duration_serde::duration")]
    pub deadline: Duration,
    /// Attempt bound inside the deadline
    #[serde(default = "default_health_max_attempts")]
    pub max_attempts: usize,
    /// Per-attempt HTTP timeout
    #[serde(
        default = "default_probe_request_timeout",
        with = "duration_serde::duration"
    )]
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Per-subscriber queue depth; overflow drops the oldest events
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}
fn default_runtime_mode() -> RuntimeMode {
    RuntimeMode::Simulated
}
fn default_docker_binary() -> String {
    "docker".to_string()
}
fn default_build_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_start_timeout() -> Duration {
    Duration::from_secs(60)
}
fn default_stop_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_simulated_step_delay() -> Duration {
    Duration::from_millis(400)
}
fn default_probe_mode() -> ProbeMode {
    ProbeMode::Container
}
fn default_health_interval() -> Duration {
    Duration::from_secs(2)
}
fn default_health_deadline() -> Duration {
    Duration::from_secs(60)
}
fn default_health_max_attempts() -> usize {
    30
}
fn default_probe_request_timeout() -> Duration {
    Duration::from_secs(2)
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: default_runtime_mode(),
            docker_binary: default_docker_binary(),
            build_timeout: default_build_timeout(),
            start_timeout: default_start_timeout(),
            stop_timeout: default_stop_timeout(),
            simulated_step_delay: default_simulated_step_delay(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: default_probe_mode(),
            interval: default_health_interval(),
            deadline: default_health_deadline(),
            max_attempts: default_health_max_attempts(),
            request_timeout: default_probe_request_timeout(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_file =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::load_from_file(&config_file)
    }

    pub fn load_from_file(config_file: &str) -> Result<Self> {
        if std::path::Path::new(&config_file).exists() {
            let contents = std::fs::read_to_string(config_file)?;
            Ok(toml::from_str(&contents)?)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file);
            Ok(default_config)
        }
    }

    /// Sanity checks beyond what serde can express
    pub fn validate(&self) -> Result<(), crate::errors::AppError> {
        if self.orchestrator.max_concurrent_jobs == 0 {
            return Err(crate::errors::AppError::configuration(
                "orchestrator.max_concurrent_jobs must be at least 1",
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(crate::errors::AppError::configuration(
                "events.channel_capacity must be at least 1",
            ));
        }
        if self.health.interval.is_zero() {
            return Err(crate::errors::AppError::configuration(
                "health.interval must be non-zero",
            ));
        }
        if self.health.max_attempts == 0 {
            return Err(crate::errors::AppError::configuration(
                "health.max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}
