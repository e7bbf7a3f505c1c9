pub mod connector;
pub mod worker;

use serde::{Deserialize, Serialize};

/// Command names accepted from the manager, case-sensitive.
pub mod commands {
    pub const START: &str = "Start";
    pub const STOP: &str = "Stop";
    pub const RESET: &str = "Reset";
    pub const GET_STATE: &str = "GetState";
    pub const SET_EMPTY_FILTER: &str = "SetEmptyFilter";
    pub const TEST_FILTER: &str = "TestFilter";
    pub const APPLY_AGENT_OPTIONS: &str = "ApplyAgentOptions";
    pub const START_LIVE_VIEW_SINK: &str = "StartLiveViewSink";
    pub const STOP_LIVE_VIEW_SINK: &str = "StopLiveViewSink";
    pub const INSTALL_CERT: &str = "InstallCert";
    pub const CLOSE: &str = "Close";
}

/// One control command as delivered by the push transport. Immutable;
/// consumed exactly once by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlEvent {
    /// Command name.
    pub event: String,
    /// Correlation id for acknowledged commands; empty when uncorrelated.
    #[serde(default)]
    pub id: String,
    /// Command-specific payload, usually JSON.
    #[serde(default)]
    pub data: String,
}

impl ControlEvent {
    pub fn new(event: impl Into<String>, id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            id: id.into(),
            data: data.into(),
        }
    }
}

/// Incremental parser for the `event:`/`id:`/`data:` line protocol.
///
/// Fields accumulate until a blank line dispatches the frame; multiple
/// `data:` lines are joined with newlines; `:`-prefixed lines are comments
/// (keep-alives) and ignored.
#[derive(Debug, Default)]
pub struct FrameParser {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator). Returns a completed event
    /// on the blank line closing a frame.
    pub fn push_line(&mut self, line: &str) -> Option<ControlEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.take_frame();
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn take_frame(&mut self) -> Option<ControlEvent> {
        let event = self.event.take();
        let id = self.id.take();
        let data = std::mem::take(&mut self.data);

        // A frame without an event name carries nothing actionable.
        let event = event?;
        Some(ControlEvent {
            event,
            id: id.unwrap_or_default(),
            data: data.join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut FrameParser, text: &str) -> Vec<ControlEvent> {
        let mut out = Vec::new();
        for line in text.split('\n') {
            if let Some(event) = parser.push_line(line) {
                out.push(event);
            }
        }
        out
    }

    #[test]
    fn test_single_frame() {
        let mut parser = FrameParser::new();
        let events = feed(&mut parser, "event: Start\nid: 42\ndata: {}\n\n");

        assert_eq!(events, vec![ControlEvent::new("Start", "42", "{}")]);
    }

    #[test]
    fn test_multiline_data_joined_with_newlines() {
        let mut parser = FrameParser::new();
        let events = feed(
            &mut parser,
            "event: TestFilter\ndata: line one\ndata: line two\n\n",
        );

        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_comment_lines_and_crlf_tolerated() {
        let mut parser = FrameParser::new();
        let events = feed(
            &mut parser,
            ": keep-alive\r\nevent: GetState\r\n\r\n: another\r\n",
        );

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "GetState");
        assert_eq!(events[0].id, "");
    }

    #[test]
    fn test_blank_line_without_event_dispatches_nothing() {
        let mut parser = FrameParser::new();
        let events = feed(&mut parser, "data: orphan\n\nevent: Stop\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "Stop");
        // The orphaned data did not leak into the next frame.
        assert_eq!(events[0].data, "");
    }

    #[test]
    fn test_frames_are_independent() {
        let mut parser = FrameParser::new();
        let events = feed(
            &mut parser,
            "event: Start\nid: 1\n\nevent: Stop\n\n",
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, "Stop");
        // The id does not carry over between frames.
        assert_eq!(events[1].id, "");
    }
}
