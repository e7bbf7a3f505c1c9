use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::filter::{Diagnostic, FilterSource};
use crate::state::AgentState;

/// Acknowledgment for a correlated command (filter test/apply), keyed by
/// the originating event id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CommandAck {
    pub success: bool,

    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,

    /// Canonicalized source on success, for UI round-tripping.
    #[serde(default)]
    pub filter_source: Option<FilterSource>,
}

/// HTTP client for the manager's agent-facing endpoints.
pub struct ManagerClient {
    base_url: String,
    agent_id: String,
    client: reqwest::Client,
}

impl ManagerClient {
    pub fn new(base_url: &str, agent_id: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building manager HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent_id: agent_id.to_string(),
            client,
        })
    }

    /// URL of the agent's command stream, consumed by the control connector.
    pub fn commands_url(&self) -> String {
        format!("{}/agents/{}/commands", self.base_url, self.agent_id)
    }

    /// Pushes a full state snapshot to the manager.
    pub async fn post_state(&self, state: &AgentState) -> Result<()> {
        let url = format!("{}/agents/{}/state", self.base_url, self.agent_id);
        self.post_json(&url, state).await?;
        debug!(running = state.running, "state report sent");
        Ok(())
    }

    /// Posts a correlated acknowledgment for `event_id`.
    pub async fn post_ack(&self, event_id: &str, ack: &CommandAck) -> Result<()> {
        let url = format!(
            "{}/agents/{}/acks/{}",
            self.base_url, self.agent_id, event_id
        );
        self.post_json(&url, ack).await?;
        debug!(event_id, success = ack.success, "command acknowledged");
        Ok(())
    }

    async fn post_json<T: Serialize>(&self, url: &str, body: &T) -> Result<()> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("posting to {url}"))?;

        let status = resp.status();
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("unexpected status {status} from {url}");
        }
        Ok(())
    }
}
