//! Harborwatch Agent Library
//!
//! This crate provides the core functionality for the Harborwatch host
//! agent, including the control plane session, container runtime
//! adaptation, log stream supervision, and metrics sampling.

pub mod agent;
pub mod cli;
pub mod connection;
pub mod runtime;

// Re-exports for convenience
pub use agent::actions::ActionDispatcher;
pub use agent::metrics::MetricsSampler;
pub use agent::state::{AgentState, AgentStateManager};
pub use agent::streams::StreamSupervisor;
pub use cli::config::Config;
pub use connection::enroll::ApiClient;
pub use connection::protocol::{InboundMessage, OutboundMessage};
pub use connection::session::{OutboundSender, Session};
pub use runtime::adapter::RuntimeAdapter;
pub use runtime::docker::adapter::DockerAdapter;
