//! Agent Configuration
//!
//! TOML file with per-section defaults; a missing file yields the default
//! configuration so a fresh host can run with nothing but CLI flags.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// One-time enrollment token; usually supplied via flag or env instead.
    pub enroll_token: Option<String>,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_docker_socket")]
    pub docker_socket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_interval_secs")]
    pub metrics_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_api_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_sync_interval_secs() -> u64 {
    10
}

fn default_docker_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_interval_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            enroll_token: None,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            sync_interval_secs: default_sync_interval_secs(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: default_docker_socket(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            metrics_interval_secs: default_metrics_interval_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }
}
