//! Message Protocol
//!
//! Defines the message types exchanged between the agent and control plane.
//! Inbound decoding is strict: a message whose tag or fields do not match
//! is rejected by serde and dropped by the session with a warning, never
//! silently defaulted.

use serde::{Deserialize, Serialize};

use crate::runtime::mux::StreamKind;

/// Messages the agent pushes to the control plane.
///
/// All producers enqueue these on the session's outbound queue; the write
/// path serializes them onto the wire strictly in enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    /// One sampling tick's worth of derived container metrics.
    #[serde(rename = "metrics")]
    Metrics {
        #[serde(rename = "hostId")]
        host_id: String,
        metrics: Vec<MetricSample>,
    },

    /// A batch of log records for one container.
    #[serde(rename = "logs")]
    Logs {
        #[serde(rename = "hostId")]
        host_id: String,
        logs: Vec<LogRecord>,
    },

    /// The single outcome report for one dispatched action.
    #[serde(rename = "action_result")]
    ActionResult {
        action_id: String,
        status: ActionStatus,
        error: String,
    },
}

/// Messages the control plane sends to the agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// Container lifecycle command.
    #[serde(rename = "action")]
    Action(ActionRequest),
}

/// A lifecycle command against one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_id: String,
    #[serde(rename = "containerId")]
    pub container_id: String,
    /// Verb string; validated by the dispatcher, not here.
    pub action: String,
}

/// Terminal outcome of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionStatus {
    Success,
    Failure,
}

/// Derived metrics for one container at one sampling instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub container_id: String,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// One demultiplexed log line, tagged with its source container and stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(rename = "containerId")]
    pub container_id: String,
    pub stream: StreamKind,
    pub message: String,
}
