pub mod file;
pub mod http;
pub mod memory;
pub mod profile;
pub mod proxy;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::trace::TraceEvent;

use self::file::FileSink;
use self::http::HttpSink;
use self::memory::MemorySink;
use self::profile::EventSinkProfile;

/// Kind discriminator for sink profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkType {
    File,
    Http,
    Memory,
}

impl SinkType {
    /// Returns the canonical label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Http => "http",
            Self::Memory => "memory",
        }
    }
}

/// Health of a sink as tracked by its retry proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkHealth {
    Ok,
    Retrying,
    Failed,
}

/// Mutable status fields surfaced in state reports.
///
/// Written by the retry loop and read concurrently by the state-reporting
/// path, so it lives behind a lock inside the proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SinkStatus {
    pub last_error: Option<String>,
    pub num_retries: u32,
    pub retry_start: Option<DateTime<Utc>>,
}

/// Statically linked sink registry.
///
/// Uses enum dispatch rather than trait objects for zero-cost async dispatch;
/// adding a sink backend means adding a variant here and a constructor arm in
/// `create`. Construction failure is terminal: the sink never existed and no
/// channel is created for it.
pub enum SinkKind {
    File(FileSink),
    Http(HttpSink),
    Memory(MemorySink),
}

impl SinkKind {
    /// Builds a sink instance from a profile. `credentials` is the
    /// decrypted, in-memory credential string (never the protected blob).
    pub fn create(profile: &EventSinkProfile, credentials: &str) -> Result<Self> {
        match profile.sink_type {
            SinkType::File => Ok(Self::File(
                FileSink::from_options(&profile.options)
                    .with_context(|| format!("creating file sink {:?}", profile.name))?,
            )),
            SinkType::Http => Ok(Self::Http(
                HttpSink::from_options(&profile.options, credentials)
                    .with_context(|| format!("creating http sink {:?}", profile.name))?,
            )),
            SinkType::Memory => Ok(Self::Memory(MemorySink::from_options(&profile.options))),
        }
    }

    /// Returns the sink type label for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::File(s) => s.name(),
            Self::Http(s) => s.name(),
            Self::Memory(s) => s.name(),
        }
    }

    /// Acquires whatever resources the sink needs before the first write.
    pub async fn open(&mut self) -> Result<()> {
        match self {
            Self::File(s) => s.open().await,
            Self::Http(s) => s.open().await,
            Self::Memory(s) => s.open().await,
        }
    }

    /// Writes one batch; any error is treated as transient by the caller.
    pub async fn write_batch(&mut self, events: &[TraceEvent]) -> Result<()> {
        match self {
            Self::File(s) => s.write_batch(events).await,
            Self::Http(s) => s.write_batch(events).await,
            Self::Memory(s) => s.write_batch(events).await,
        }
    }

    /// Releases sink resources; must tolerate being called more than once.
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Self::File(s) => s.close().await,
            Self::Http(s) => s.close().await,
            Self::Memory(s) => s.close().await,
        }
    }
}
