//! Action Dispatcher
//!
//! Turns a control plane action into a container engine lifecycle call and
//! reports exactly one result per action, success or failure. Engine
//! failures never propagate past the result message.

use anyhow::{bail, Result};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::connection::protocol::{ActionRequest, ActionStatus, OutboundMessage};
use crate::connection::session::OutboundSender;
use crate::runtime::adapter::RuntimeAdapter;

/// Lifecycle verbs the control plane may issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionVerb {
    Start,
    Stop,
    Restart,
}

impl FromStr for ActionVerb {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "START" => Ok(ActionVerb::Start),
            "STOP" => Ok(ActionVerb::Stop),
            "RESTART" => Ok(ActionVerb::Restart),
            _ => bail!("unknown action verb: {s}"),
        }
    }
}

/// Executes actions against the container engine.
///
/// The enqueue capability is injected at construction; the dispatcher never
/// reaches for shared session state.
pub struct ActionDispatcher<R: RuntimeAdapter + 'static> {
    runtime: Arc<R>,
    outbound: OutboundSender,
}

impl<R: RuntimeAdapter + 'static> ActionDispatcher<R> {
    pub fn new(runtime: Arc<R>, outbound: OutboundSender) -> Self {
        Self { runtime, outbound }
    }

    /// Hand an action to its own task so the caller never waits on the
    /// engine.
    pub fn dispatch(self: &Arc<Self>, request: ActionRequest) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.execute(request).await;
        });
    }

    /// Run one action to completion and enqueue its single result.
    pub async fn execute(&self, request: ActionRequest) {
        info!(
            action_id = %request.action_id,
            container_id = %request.container_id,
            verb = %request.action,
            "executing action"
        );

        let result = match self.apply(&request).await {
            Ok(()) => OutboundMessage::ActionResult {
                action_id: request.action_id,
                status: ActionStatus::Success,
                error: String::new(),
            },
            Err(e) => {
                warn!(
                    action_id = %request.action_id,
                    container_id = %request.container_id,
                    error = %format!("{e:#}"),
                    "action failed"
                );
                OutboundMessage::ActionResult {
                    action_id: request.action_id,
                    status: ActionStatus::Failure,
                    error: format!("{e:#}"),
                }
            }
        };

        self.outbound.send(result).await;
    }

    async fn apply(&self, request: &ActionRequest) -> Result<()> {
        // Verb validation precedes any engine call.
        let verb: ActionVerb = request.action.parse()?;
        match verb {
            ActionVerb::Start => self.runtime.start_container(&request.container_id).await,
            ActionVerb::Stop => self.runtime.stop_container(&request.container_id).await,
            ActionVerb::Restart => self.runtime.restart_container(&request.container_id).await,
        }
    }
}
