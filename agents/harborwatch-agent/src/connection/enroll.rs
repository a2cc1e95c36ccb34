//! Control Plane REST Client
//!
//! Enrollment, heartbeats, and container inventory sync go over plain HTTP.
//! The streaming telemetry path lives in [`super::session`].

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::runtime::adapter::ContainerSummary;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fields the agent presents when enrolling with the control plane.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub token: String,
    pub name: String,
    pub hostname: String,
    pub os: String,
    pub architecture: String,
    pub docker_version: String,
}

/// Identity the control plane assigns on successful enrollment.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub agent_token: String,
    pub host_id: String,
    pub organization_id: String,
}

/// HTTP client for the control plane's agent endpoints.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    agent_token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_token: RwLock::new(None),
        })
    }

    /// Exchange an enrollment token for this host's agent identity. The
    /// returned agent token authenticates every later call.
    pub async fn enroll(&self, request: &EnrollRequest) -> Result<EnrollResponse> {
        let url = format!("{}/api/agent/enroll", self.base_url);
        debug!(url = %url, name = %request.name, "enrolling agent");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("enroll request failed")?;

        if !response.status().is_success() {
            bail!("enroll rejected with status {}", response.status());
        }

        let enrolled: EnrollResponse = response
            .json()
            .await
            .context("failed to decode enroll response")?;

        *self.agent_token.write() = Some(enrolled.agent_token.clone());
        info!(host_id = %enrolled.host_id, "agent enrolled");
        Ok(enrolled)
    }

    /// Liveness ping; requires a prior successful enroll.
    pub async fn heartbeat(&self) -> Result<()> {
        let token = self.bearer_token()?;
        let url = format!("{}/api/agent/heartbeat", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .send()
            .await
            .context("heartbeat request failed")?;

        if !response.status().is_success() {
            bail!("heartbeat rejected with status {}", response.status());
        }
        Ok(())
    }

    /// Push the full container inventory observed on this host.
    pub async fn sync_containers(&self, containers: &[ContainerSummary]) -> Result<()> {
        let token = self.bearer_token()?;
        let url = format!("{}/api/agent/containers", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(containers)
            .send()
            .await
            .context("container sync request failed")?;

        if !response.status().is_success() {
            bail!("container sync rejected with status {}", response.status());
        }
        debug!(count = containers.len(), "container inventory synced");
        Ok(())
    }

    pub fn token(&self) -> Option<String> {
        self.agent_token.read().clone()
    }

    fn bearer_token(&self) -> Result<String> {
        match self.token() {
            Some(token) => Ok(token),
            None => bail!("agent is not enrolled"),
        }
    }
}
