use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Severity level of a trace event, mirroring kernel trace levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Info = 4,
    Verbose = 5,
}

impl TraceLevel {
    /// Returns the canonical label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Verbose => "verbose",
        }
    }

    /// Convert from a raw u8 value.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Critical),
            2 => Some(Self::Error),
            3 => Some(Self::Warning),
            4 => Some(Self::Info),
            5 => Some(Self::Verbose),
            _ => None,
        }
    }
}

/// A single trace event as delivered by the OS trace provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub name: String,
    pub level: TraceLevel,
    pub pid: u32,
    pub tid: u32,
    /// Provider-specific fields.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Configuration for one enabled trace provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProviderSettings {
    pub name: String,
    pub level: TraceLevel,
    /// Keyword bitmask; 0 means all keywords.
    #[serde(default)]
    pub match_any_keyword: u64,
}

/// Enable/disable surface of the underlying OS trace API.
///
/// The real kernel provider lives outside this crate; implementations here
/// only need to honor the enable/disable contract.
pub trait ProviderControl: Send {
    /// Enables (or re-enables with new settings) a provider.
    fn enable(&mut self, settings: &ProviderSettings) -> Result<()>;

    /// Disables a previously enabled provider.
    fn disable(&mut self, name: &str) -> Result<()>;
}

/// A live trace session: the event stream plus the provider control surface
/// and the session's view of which providers are currently enabled.
pub struct TraceSession {
    control: Box<dyn ProviderControl>,
    events: mpsc::Receiver<TraceEvent>,
    enabled: HashMap<String, ProviderSettings>,
}

impl TraceSession {
    pub fn new(control: Box<dyn ProviderControl>, events: mpsc::Receiver<TraceEvent>) -> Self {
        Self {
            control,
            events,
            enabled: HashMap::new(),
        }
    }

    /// Reconciles the enabled-provider set against `desired`: providers no
    /// longer present are disabled, new or changed ones are (re)enabled.
    pub fn apply_providers(&mut self, desired: &[ProviderSettings]) -> Result<()> {
        let desired_by_name: HashMap<&str, &ProviderSettings> =
            desired.iter().map(|p| (p.name.as_str(), p)).collect();

        let to_disable: Vec<String> = self
            .enabled
            .keys()
            .filter(|name| !desired_by_name.contains_key(name.as_str()))
            .cloned()
            .collect();

        for name in to_disable {
            self.control.disable(&name)?;
            self.enabled.remove(&name);
            tracing::debug!(provider = %name, "provider disabled");
        }

        for settings in desired {
            match self.enabled.get(&settings.name) {
                Some(current) if current == settings => {}
                _ => {
                    self.control.enable(settings)?;
                    self.enabled
                        .insert(settings.name.clone(), settings.clone());
                    tracing::debug!(
                        provider = %settings.name,
                        level = settings.level.as_str(),
                        "provider enabled",
                    );
                }
            }
        }

        Ok(())
    }

    /// Names of currently enabled providers, sorted for stable reporting.
    pub fn enabled_providers(&self) -> Vec<ProviderSettings> {
        let mut out: Vec<ProviderSettings> = self.enabled.values().cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Awaits the next trace event; `None` when the provider stream closed.
    pub async fn next_event(&mut self) -> Option<TraceEvent> {
        self.events.recv().await
    }
}

/// In-process loopback provider for tests and the binary's demo mode.
pub mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Handle for injecting events and inspecting the enabled set.
    #[derive(Clone)]
    pub struct LoopbackHandle {
        tx: mpsc::Sender<TraceEvent>,
        enabled: Arc<Mutex<HashMap<String, ProviderSettings>>>,
    }

    impl LoopbackHandle {
        /// Injects a synthetic event into the session stream.
        pub async fn emit(&self, event: TraceEvent) -> Result<()> {
            self.tx
                .send(event)
                .await
                .map_err(|_| anyhow::anyhow!("trace session closed"))
        }

        /// Currently enabled provider names.
        pub fn enabled_names(&self) -> Vec<String> {
            let mut names: Vec<String> = self
                .enabled
                .lock()
                .expect("loopback enabled lock")
                .keys()
                .cloned()
                .collect();
            names.sort();
            names
        }
    }

    struct LoopbackControl {
        enabled: Arc<Mutex<HashMap<String, ProviderSettings>>>,
    }

    impl ProviderControl for LoopbackControl {
        fn enable(&mut self, settings: &ProviderSettings) -> Result<()> {
            self.enabled
                .lock()
                .expect("loopback enabled lock")
                .insert(settings.name.clone(), settings.clone());
            Ok(())
        }

        fn disable(&mut self, name: &str) -> Result<()> {
            self.enabled
                .lock()
                .expect("loopback enabled lock")
                .remove(name);
            Ok(())
        }
    }

    /// Creates a loopback trace session and its injection handle.
    pub fn loopback(capacity: usize) -> (TraceSession, LoopbackHandle) {
        let (tx, rx) = mpsc::channel(capacity);
        let enabled = Arc::new(Mutex::new(HashMap::new()));

        let session = TraceSession::new(
            Box::new(LoopbackControl {
                enabled: Arc::clone(&enabled),
            }),
            rx,
        );

        (session, LoopbackHandle { tx, enabled })
    }

    /// Convenience constructor for a synthetic event.
    pub fn event(provider: &str, name: &str, level: TraceLevel) -> TraceEvent {
        TraceEvent {
            timestamp: chrono::Utc::now(),
            provider: provider.to_string(),
            name: name.to_string(),
            level,
            pid: 1000,
            tid: 1000,
            payload: serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_roundtrip() {
        assert_eq!(TraceLevel::from_u8(2), Some(TraceLevel::Error));
        assert_eq!(TraceLevel::from_u8(9), None);
        assert_eq!(TraceLevel::Warning.as_str(), "warning");
    }

    #[tokio::test]
    async fn test_apply_providers_diffs_enable_and_disable() {
        let (mut session, handle) = testing::loopback(8);

        let a = ProviderSettings {
            name: "Kernel-Process".to_string(),
            level: TraceLevel::Info,
            match_any_keyword: 0,
        };
        let b = ProviderSettings {
            name: "Kernel-Network".to_string(),
            level: TraceLevel::Verbose,
            match_any_keyword: 0x10,
        };

        session
            .apply_providers(&[a.clone(), b.clone()])
            .expect("apply");
        assert_eq!(
            handle.enabled_names(),
            vec!["Kernel-Network".to_string(), "Kernel-Process".to_string()]
        );

        // Drop one, change the other's level.
        let a2 = ProviderSettings {
            level: TraceLevel::Error,
            ..a
        };
        session.apply_providers(&[a2.clone()]).expect("apply");
        assert_eq!(handle.enabled_names(), vec!["Kernel-Process".to_string()]);
        assert_eq!(session.enabled_providers(), vec![a2]);
    }

    #[tokio::test]
    async fn test_loopback_delivers_events_in_order() {
        let (mut session, handle) = testing::loopback(8);

        for i in 0..3 {
            let mut ev = testing::event("P", "op", TraceLevel::Info);
            ev.pid = i;
            handle.emit(ev).await.expect("emit");
        }

        for i in 0..3 {
            let ev = session.next_event().await.expect("event");
            assert_eq!(ev.pid, i);
        }
    }
}
