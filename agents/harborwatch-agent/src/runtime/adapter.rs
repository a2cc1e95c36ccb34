//! Runtime Adapter Trait
//!
//! Defines the common interface for all container runtime adapters. The
//! agent core only depends on this seam; the Docker implementation lives in
//! `runtime::docker`.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::io::AsyncRead;

/// Raw multiplexed log attachment, exactly as the engine frames it on the
/// wire. Decoded by [`crate::runtime::mux::FrameReader`].
pub type LogAttachment = Box<dyn AsyncRead + Send + Unpin>;

/// Normalized snapshot of one container, as reported by a listing.
///
/// Serialized camelCase because the same shape is pushed to the control
/// plane on every sync tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSummary {
    pub docker_id: String,
    pub name: String,
    pub image: String,
    pub image_id: String,
    pub command: String,
    pub state: String,
    pub status: String,
    pub ports: HashMap<String, Option<u16>>,
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

impl ContainerSummary {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Point-in-time resource counters for one container.
///
/// These are the raw cumulative counters the engine reports; percentage and
/// working-set arithmetic happens in the metrics sampler.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub cpu_total_usage: u64,
    pub cpu_system_usage: u64,
    pub precpu_total_usage: u64,
    pub precpu_system_usage: u64,
    pub num_cpus: u32,
    pub memory_usage: u64,
    pub memory_cache: u64,
    pub networks: Vec<InterfaceCounters>,
}

/// Cumulative byte counters for one network interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Runtime adapter trait - common interface for all container runtimes.
///
/// Implementations must be safe for concurrent independent calls; the agent
/// shares one instance across all of its tasks without extra locking.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Get the runtime type name.
    fn runtime_type(&self) -> &str;

    /// Get runtime version information.
    async fn version(&self) -> Result<String>;

    /// List containers; `all = false` limits the listing to running ones.
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Fetch one point-in-time counter snapshot for a container.
    async fn stats_snapshot(&self, id: &str) -> Result<StatsSnapshot>;

    /// Open the combined stdout/stderr log attachment for a container.
    async fn attach_logs(&self, id: &str) -> Result<LogAttachment>;

    /// Start a container.
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Stop a container.
    async fn stop_container(&self, id: &str) -> Result<()>;

    /// Restart a container.
    async fn restart_container(&self, id: &str) -> Result<()>;
}
