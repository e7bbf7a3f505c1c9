use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::control::connector::ConnectorConfig;
use crate::retry::RetryPolicy;

/// Agent configuration, loaded from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Unique agent identifier the manager knows this host by.
    pub agent_id: String,

    /// Base URL of the manager's agent endpoints.
    pub manager_url: String,

    /// Host name reported in state snapshots.
    #[serde(default = "default_host_name")]
    pub host_name: String,

    /// Directory for persisted configuration and channel journals.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Timeout for state reports and acknowledgments.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Queue capacity of each event channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Sink write retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Control-stream transport tuning.
    #[serde(default)]
    pub connector: ConnectorConfig,
}

fn default_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_channel_capacity() -> usize {
    8192
}

impl Config {
    /// Loads and validates a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            bail!("agent_id must not be empty");
        }
        if self.manager_url.is_empty() {
            bail!("manager_url must not be empty");
        }
        if !self.manager_url.starts_with("http://") && !self.manager_url.starts_with("https://") {
            bail!("manager_url must be an http(s) URL");
        }
        if self.channel_capacity == 0 {
            bail!("channel_capacity must be greater than zero");
        }
        Ok(())
    }

    /// Directory for persistent channel journals.
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }
}
