//! Metrics Sampling
//!
//! Periodically derives per-container CPU, memory, and network figures from
//! raw engine counters and enqueues them as one message per tick. A tick
//! taken while the control channel is down is discarded rather than queued.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::agent::state::AgentStateManager;
use crate::connection::protocol::{MetricSample, OutboundMessage};
use crate::connection::session::OutboundSender;
use crate::runtime::adapter::{RuntimeAdapter, StatsSnapshot};

/// Per-container stats read is abandoned after this long.
pub const STATS_TIMEOUT: Duration = Duration::from_secs(2);

/// Samples all running containers once per telemetry tick.
pub struct MetricsSampler<R: RuntimeAdapter> {
    runtime: Arc<R>,
    outbound: OutboundSender,
    state: AgentStateManager,
    host_id: String,
}

impl<R: RuntimeAdapter> MetricsSampler<R> {
    pub fn new(
        runtime: Arc<R>,
        outbound: OutboundSender,
        state: AgentStateManager,
        host_id: String,
    ) -> Self {
        Self {
            runtime,
            outbound,
            state,
            host_id,
        }
    }

    /// Sample every running container and enqueue one metrics message.
    /// A container whose stats read fails or times out is skipped; the
    /// tick still reports the rest.
    pub async fn tick(&self) {
        let containers = match self.runtime.list_containers(false).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "failed to list containers for metrics tick");
                return;
            }
        };

        let mut samples = Vec::with_capacity(containers.len());
        for container in containers.iter().filter(|c| c.is_running()) {
            match tokio::time::timeout(STATS_TIMEOUT, self.runtime.stats_snapshot(&container.docker_id))
                .await
            {
                Ok(Ok(snapshot)) => {
                    samples.push(derive_sample(&container.docker_id, &snapshot));
                }
                Ok(Err(e)) => {
                    warn!(
                        container_id = %container.docker_id,
                        error = %format!("{e:#}"),
                        "stats read failed, skipping container"
                    );
                }
                Err(_) => {
                    warn!(
                        container_id = %container.docker_id,
                        "stats read timed out, skipping container"
                    );
                }
            }
        }

        if samples.is_empty() {
            return;
        }

        if !self.state.is_connected() {
            debug!(
                count = samples.len(),
                "control channel down, discarding metrics tick"
            );
            return;
        }

        self.outbound
            .send(OutboundMessage::Metrics {
                host_id: self.host_id.clone(),
                metrics: samples,
            })
            .await;
    }
}

/// Derive one wire sample from raw engine counters.
pub fn derive_sample(container_id: &str, stats: &StatsSnapshot) -> MetricSample {
    let cpu_delta = stats.cpu_total_usage as f64 - stats.precpu_total_usage as f64;
    let system_delta = stats.cpu_system_usage as f64 - stats.precpu_system_usage as f64;

    let rx: u64 = stats.networks.iter().map(|n| n.rx_bytes).sum();
    let tx: u64 = stats.networks.iter().map(|n| n.tx_bytes).sum();

    MetricSample {
        container_id: container_id.to_string(),
        cpu_usage_percent: cpu_percent(cpu_delta, system_delta, stats.num_cpus),
        memory_usage_bytes: stats.memory_usage.saturating_sub(stats.memory_cache),
        network_rx_bytes: rx,
        network_tx_bytes: tx,
    }
}

/// CPU usage as a percentage of one core, scaled by the core count.
/// Reports zero unless both deltas are positive.
pub fn cpu_percent(cpu_delta: f64, system_delta: f64, num_cpus: u32) -> f64 {
    if cpu_delta > 0.0 && system_delta > 0.0 {
        (cpu_delta / system_delta) * num_cpus as f64 * 100.0
    } else {
        0.0
    }
}
