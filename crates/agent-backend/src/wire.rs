//! Line-delimited JSON protocol spoken with agent child processes
//!
//! Outbound (stdin), one object per line:
//!   {"type":"user","content":"..."}
//!   {"type":"abort"}
//!
//! Inbound (stdout), one object per line, tagged by `type`:
//!   session_start, message_delta, message, reasoning, tool_start,
//!   tool_complete, usage, title, model, idle, error

use serde::{Deserialize, Serialize};

use crate::classify::classify_message;
use crate::error::{Error, ErrorKind};
use crate::event::{BackendEvent, Usage};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Command<'a> {
    User { content: &'a str },
    Abort,
}

impl Command<'_> {
    /// Serialize as one protocol line, newline included.
    pub(crate) fn to_line(&self) -> String {
        // Serializing a plain enum of strings cannot fail.
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum Inbound {
    SessionStart {
        session_id: String,
        #[serde(default)]
        model: Option<String>,
    },
    MessageDelta {
        content: String,
    },
    Message {
        content: String,
    },
    Reasoning {
        content: String,
    },
    ToolStart {
        name: String,
    },
    ToolComplete {
        name: String,
    },
    Usage(Usage),
    Title {
        title: String,
    },
    Model {
        model: String,
    },
    Idle,
    Error {
        message: String,
        #[serde(default)]
        kind: Option<ErrorKind>,
    },
}

/// Parse one stdout line. Blank lines yield None.
pub(crate) fn parse_line(line: &str) -> Option<serde_json::Result<Inbound>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str(trimmed))
}

impl Inbound {
    /// Convert to a session event. `SessionStart` is handled by the process
    /// reader itself and has no event form.
    pub(crate) fn into_event(self) -> Option<BackendEvent> {
        let event = match self {
            Inbound::SessionStart { .. } => return None,
            Inbound::MessageDelta { content } => BackendEvent::MessageDelta { content },
            Inbound::Message { content } => BackendEvent::Message { content },
            Inbound::Reasoning { content } => BackendEvent::Reasoning { content },
            Inbound::ToolStart { name } => BackendEvent::ToolStart { name },
            Inbound::ToolComplete { name } => BackendEvent::ToolComplete { name },
            Inbound::Usage(usage) => BackendEvent::Usage(usage),
            Inbound::Title { title } => BackendEvent::TitleChanged { title },
            Inbound::Model { model } => BackendEvent::ModelChanged { model },
            Inbound::Idle => BackendEvent::Idle,
            Inbound::Error { message, kind } => {
                let kind = kind.unwrap_or_else(|| classify_message(&message));
                BackendEvent::Error(Error::reported(kind, message))
            }
        };
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Inbound {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn commands_serialize_as_tagged_lines() {
        assert_eq!(
            Command::User { content: "hi" }.to_line(),
            "{\"type\":\"user\",\"content\":\"hi\"}\n"
        );
        assert_eq!(Command::Abort.to_line(), "{\"type\":\"abort\"}\n");
    }

    #[test]
    fn parses_session_start() {
        match parse(r#"{"type":"session_start","session_id":"s-1","model":"opus"}"#) {
            Inbound::SessionStart { session_id, model } => {
                assert_eq!(session_id, "s-1");
                assert_eq!(model.as_deref(), Some("opus"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_usage_with_missing_fields() {
        let event = parse(r#"{"type":"usage","input_tokens":12,"output_tokens":3}"#)
            .into_event()
            .unwrap();
        assert_eq!(
            event,
            BackendEvent::Usage(Usage {
                input_tokens: 12,
                output_tokens: 3,
                ..Default::default()
            })
        );
    }

    #[test]
    fn error_without_kind_is_classified_from_message() {
        let event = parse(r#"{"type":"error","message":"429 rate limit"}"#)
            .into_event()
            .unwrap();
        match event {
            BackendEvent::Error(err) => assert_eq!(err.kind(), ErrorKind::RateLimited),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn explicit_error_kind_wins() {
        let event = parse(r#"{"type":"error","message":"429 rate limit","kind":"other"}"#)
            .into_event()
            .unwrap();
        match event {
            BackendEvent::Error(err) => assert_eq!(err.kind(), ErrorKind::Other),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn blank_and_malformed_lines() {
        assert!(parse_line("   ").is_none());
        assert!(parse_line("not json").unwrap().is_err());
        assert!(parse_line(r#"{"type":"unknown_event"}"#).unwrap().is_err());
    }

    #[test]
    fn session_start_has_no_event_form() {
        let inbound = parse(r#"{"type":"session_start","session_id":"s"}"#);
        assert!(inbound.into_event().is_none());
    }
}
