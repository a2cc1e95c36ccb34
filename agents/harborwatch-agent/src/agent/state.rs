//! Agent State Management
//!
//! Tracks the control channel's connection status. Telemetry producers
//! consult this to decide whether a tick's samples are worth enqueueing.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Connection status of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentState::Disconnected => write!(f, "Disconnected"),
            AgentState::Connecting => write!(f, "Connecting"),
            AgentState::Connected => write!(f, "Connected"),
            AgentState::Reconnecting => write!(f, "Reconnecting"),
            AgentState::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

struct StateInner {
    current: AgentState,
    last_connected: Option<DateTime<Utc>>,
    connection_attempts: u32,
}

/// Thread-safe agent state manager, shared by the session and the
/// telemetry tasks.
#[derive(Clone)]
pub struct AgentStateManager {
    inner: Arc<RwLock<StateInner>>,
}

impl AgentStateManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(StateInner {
                current: AgentState::Disconnected,
                last_connected: None,
                connection_attempts: 0,
            })),
        }
    }

    pub fn current_state(&self) -> AgentState {
        self.inner.read().current
    }

    pub fn last_connected(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_connected
    }

    pub fn connection_attempts(&self) -> u32 {
        self.inner.read().connection_attempts
    }

    /// Transition to a new state; invalid transitions are ignored.
    pub fn transition_to(&self, new_state: AgentState, reason: Option<&str>) -> bool {
        let mut inner = self.inner.write();

        if !Self::is_valid_transition(inner.current, new_state) {
            return false;
        }

        let old_state = inner.current;
        inner.current = new_state;

        match new_state {
            AgentState::Connected => {
                inner.last_connected = Some(Utc::now());
                inner.connection_attempts = 0;
            }
            AgentState::Connecting | AgentState::Reconnecting => {
                inner.connection_attempts += 1;
            }
            _ => {}
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            attempts = inner.connection_attempts,
            reason = reason.unwrap_or(""),
            "Agent state transition"
        );

        true
    }

    fn is_valid_transition(from: AgentState, to: AgentState) -> bool {
        if from == to {
            return true;
        }
        // ShuttingDown is terminal; everything else may reach it.
        matches!(
            (from, to),
            (AgentState::Disconnected, AgentState::Connecting)
                | (AgentState::Connecting, AgentState::Connected)
                | (AgentState::Connecting, AgentState::Disconnected)
                | (AgentState::Connected, AgentState::Disconnected)
                | (AgentState::Connected, AgentState::Reconnecting)
                | (AgentState::Disconnected, AgentState::Reconnecting)
                | (AgentState::Reconnecting, AgentState::Connecting)
                | (AgentState::Reconnecting, AgentState::Connected)
                | (AgentState::Reconnecting, AgentState::Disconnected)
                | (_, AgentState::ShuttingDown)
        )
    }

    pub fn set_connecting(&self) {
        self.transition_to(AgentState::Connecting, Some("initiating connection"));
    }

    pub fn set_connected(&self) {
        self.transition_to(AgentState::Connected, Some("connection established"));
    }

    pub fn set_disconnected(&self, reason: Option<&str>) {
        self.transition_to(AgentState::Disconnected, reason);
    }

    pub fn set_reconnecting(&self) {
        self.transition_to(AgentState::Reconnecting, Some("connection lost"));
    }

    pub fn set_shutting_down(&self) {
        self.transition_to(AgentState::ShuttingDown, Some("shutdown requested"));
    }

    pub fn is_connected(&self) -> bool {
        self.current_state() == AgentState::Connected
    }
}

impl Default for AgentStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_disconnected() {
        let manager = AgentStateManager::new();
        assert_eq!(manager.current_state(), AgentState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[test]
    fn connect_cycle() {
        let manager = AgentStateManager::new();

        manager.set_connecting();
        assert_eq!(manager.current_state(), AgentState::Connecting);

        manager.set_connected();
        assert!(manager.is_connected());
        assert!(manager.last_connected().is_some());

        manager.set_disconnected(Some("read timed out"));
        assert_eq!(manager.current_state(), AgentState::Disconnected);
    }

    #[test]
    fn invalid_transition_is_ignored() {
        let manager = AgentStateManager::new();
        assert!(!manager.transition_to(AgentState::Connected, None));
        assert_eq!(manager.current_state(), AgentState::Disconnected);
    }

    #[test]
    fn shutting_down_is_terminal() {
        let manager = AgentStateManager::new();
        manager.set_connecting();
        manager.set_connected();

        manager.set_shutting_down();
        assert_eq!(manager.current_state(), AgentState::ShuttingDown);

        manager.set_connecting();
        assert_eq!(manager.current_state(), AgentState::ShuttingDown);
    }

    #[test]
    fn attempts_reset_on_connect() {
        let manager = AgentStateManager::new();

        manager.set_connecting();
        manager.set_disconnected(None);
        manager.set_reconnecting();
        assert_eq!(manager.connection_attempts(), 2);

        manager.set_connected();
        assert_eq!(manager.connection_attempts(), 0);
    }
}
