use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::filter::FilterSource;
use crate::sink::profile::EventSinkProfile;
use crate::sink::{SinkHealth, SinkStatus};
use crate::trace::ProviderSettings;

/// Filter configuration carried inside the session state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessingState {
    #[serde(default)]
    pub filter_source: FilterSource,
}

/// Live-view streaming options; the profile is present while a live view
/// is attached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LiveViewOptions {
    #[serde(default)]
    pub profile: Option<EventSinkProfile>,
}

/// Durable session configuration the agent resumes from after a restart.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventSessionState {
    #[serde(default)]
    pub provider_settings: Vec<ProviderSettings>,

    #[serde(default)]
    pub processing_state: ProcessingState,

    #[serde(default)]
    pub live_view_options: LiveViewOptions,
}

/// Runtime status of one sink as reported to the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventSinkState {
    pub name: String,
    pub health: SinkHealth,
    pub status: SinkStatus,

    /// Events dropped by the channel due to queue overflow.
    pub dropped_events: u64,
}

/// Outcome category of the most recent certificate install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CertInstallOutcome {
    Success,
    Crypto,
    InvalidChain,
    InstallFailure,
    Other,
}

/// Result of the last InstallCert command; surfaced in every state report
/// until superseded by the next install.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CertInstallResult {
    pub outcome: CertInstallOutcome,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Snapshot of the agent's configuration and runtime status.
///
/// Rebuilt fresh for every report from the persisted configuration plus the
/// live session's channel and sink status; never persisted as one object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AgentState {
    pub agent_id: String,
    pub host_name: String,
    pub running: bool,
    pub stopped: bool,

    #[serde(default)]
    pub enabled_providers: Vec<ProviderSettings>,

    #[serde(default)]
    pub processing_state: ProcessingState,

    #[serde(default)]
    pub event_sink_states: Vec<EventSinkState>,

    #[serde(default)]
    pub live_view_options: LiveViewOptions,

    #[serde(default)]
    pub cert_thumbprint: Option<String>,

    #[serde(default)]
    pub cert_days_remaining: Option<i64>,

    #[serde(default)]
    pub last_cert_install: Option<CertInstallResult>,

    pub reported_at: DateTime<Utc>,
}
