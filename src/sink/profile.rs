use serde::{Deserialize, Serialize};

use super::SinkType;

/// Reserved profile name for the manager-facing live-view channel.
pub const LIVE_VIEW_SINK_NAME: &str = "$liveview";

/// Durable configuration for one named event sink.
///
/// Profiles travel over the control channel as PascalCase JSON and are
/// persisted verbatim by the session store. `name` is the unique key across
/// an agent's profiles and compares case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EventSinkProfile {
    pub name: String,

    pub sink_type: SinkType,

    /// Event-count flush threshold.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Time flush threshold in milliseconds since the first buffered event.
    #[serde(default = "default_max_write_delay_msecs")]
    pub max_write_delay_m_secs: u64,

    /// Whether the channel spills to a durable local queue.
    #[serde(default)]
    pub persistent_channel: bool,

    /// Opaque credential string; carries the protection marker when
    /// encrypted at rest.
    #[serde(default)]
    pub credentials: String,

    /// Sink-type-specific options.
    #[serde(default)]
    pub options: serde_json::Value,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_write_delay_msecs() -> u64 {
    1000
}

impl EventSinkProfile {
    /// Case-insensitive unique key for this profile.
    pub fn key(&self) -> String {
        self.name.to_lowercase()
    }

    /// Whether this profile names the reserved live-view channel.
    pub fn is_live_view(&self) -> bool {
        self.name.eq_ignore_ascii_case(LIVE_VIEW_SINK_NAME)
    }

    /// Two profiles match when everything except the runtime-mutable batch
    /// size and write delay is equal. A matching profile can be applied to a
    /// running channel in place; a non-matching one forces the channel to be
    /// torn down and recreated.
    pub fn matches(&self, other: &EventSinkProfile) -> bool {
        self.name.eq_ignore_ascii_case(&other.name)
            && self.sink_type == other.sink_type
            && self.persistent_channel == other.persistent_channel
            && self.credentials == other.credentials
            && self.options == other.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> EventSinkProfile {
        EventSinkProfile {
            name: name.to_string(),
            sink_type: SinkType::File,
            batch_size: 100,
            max_write_delay_m_secs: 1000,
            persistent_channel: false,
            credentials: String::new(),
            options: serde_json::json!({"path": "/tmp/out.ndjson"}),
        }
    }

    #[test]
    fn test_matches_ignores_batch_and_delay() {
        let a = profile("s1");
        let mut b = profile("s1");
        b.batch_size = 1;
        b.max_write_delay_m_secs = 50;
        assert!(a.matches(&b));
    }

    #[test]
    fn test_matches_name_case_insensitive() {
        let a = profile("S1");
        let b = profile("s1");
        assert!(a.matches(&b));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_mismatch_forces_recreate() {
        let a = profile("s1");

        let mut b = profile("s1");
        b.sink_type = SinkType::Http;
        assert!(!a.matches(&b));

        let mut c = profile("s1");
        c.persistent_channel = true;
        assert!(!a.matches(&c));

        let mut d = profile("s1");
        d.credentials = "secret".to_string();
        assert!(!a.matches(&d));

        let mut e = profile("s1");
        e.options = serde_json::json!({"path": "/elsewhere"});
        assert!(!a.matches(&e));
    }

    #[test]
    fn test_wire_format_is_pascal_case() {
        let p = profile("s1");
        let json = serde_json::to_value(&p).expect("serialize");
        assert!(json.get("Name").is_some());
        assert!(json.get("SinkType").is_some());
        assert!(json.get("MaxWriteDelayMSecs").is_some());
        assert!(json.get("PersistentChannel").is_some());
    }

    #[test]
    fn test_live_view_name_reserved() {
        let mut p = profile(LIVE_VIEW_SINK_NAME);
        assert!(p.is_live_view());
        p.name = "$LIVEVIEW".to_string();
        assert!(p.is_live_view());
    }
}
