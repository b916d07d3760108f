//! Decoding of gateway SSE lines into typed events
//!
//! Every line coming out of the [`LineBuffer`](crate::sse::LineBuffer) goes through
//! [`decode_line`] exactly once. Blank lines, comments and keep-alives are skipped, the
//! `[DONE]` sentinel ends the stream, and anything that fails to parse is logged and skipped
//! without touching the lines around it.

use serde::Deserialize;
use serde_json::Value;
use tracing::{trace, warn};

/// Prefix that marks a data line in the gateway's event stream.
pub const DATA_PREFIX: &str = "data: ";

/// Payload the gateway (and this service) use to mark the end of a stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Outcome of decoding a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Nothing to act on: blank, non-data, or malformed line.
    Skip,
    /// The upstream signalled the end of the stream.
    Done,
    Event(UpstreamEvent),
}

/// A gateway event. `task_id` can ride along on any kind of event.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamEvent {
    pub task_id: Option<String>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// A piece of the answer text.
    Message {
        #[serde(default)]
        answer: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// A file produced by the workflow.
    MessageFile {
        #[serde(default)]
        id: Option<String>,
        #[serde(default, rename = "type")]
        file_type: Option<String>,
        #[serde(default)]
        url: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// End of the assistant turn.
    MessageEnd {
        #[serde(default)]
        conversation_id: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    WorkflowStarted,
    NodeStarted,
    NodeFinished,
    WorkflowFinished,
    TtsMessage,
    TtsMessageEnd,
    MessageReplace,
    Ping,
    /// Event names this service does not know about.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    /// Progress and keep-alive events that neither change state nor reach the client.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowStarted
                | EventKind::NodeStarted
                | EventKind::NodeFinished
                | EventKind::WorkflowFinished
                | EventKind::TtsMessage
                | EventKind::TtsMessageEnd
                | EventKind::MessageReplace
                | EventKind::Ping
                | EventKind::Unknown
        )
    }
}

/// Decode one complete line of the gateway stream.
pub fn decode_line(line: &str) -> Decoded {
    if line.trim().is_empty() {
        return Decoded::Skip;
    }
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        trace!(line = %line, "Ignoring non-data line");
        return Decoded::Skip;
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Decoded::Skip;
    }
    if payload == DONE_SENTINEL {
        return Decoded::Done;
    }

    match decode_payload(payload) {
        Ok(event) => Decoded::Event(event),
        Err(e) => {
            warn!(error = %e, payload = %truncate(payload, 200), "Skipping malformed gateway frame");
            Decoded::Skip
        }
    }
}

fn decode_payload(payload: &str) -> Result<UpstreamEvent, serde_json::Error> {
    let value: Value = serde_json::from_str(payload)?;
    let task_id = value
        .get("task_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_owned);

    // An `error` field wins over whatever the event tag says
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| error_text(error));
        return Ok(UpstreamEvent {
            task_id,
            kind: EventKind::Error {
                message: Some(message),
            },
        });
    }

    // Error events keep their meaning whatever shape the message has
    if value.get("event").and_then(Value::as_str) == Some("error") {
        let message = value
            .get("message")
            .filter(|m| !m.is_null())
            .map(error_text);
        return Ok(UpstreamEvent {
            task_id,
            kind: EventKind::Error { message },
        });
    }

    let kind = EventKind::deserialize(value)?;
    Ok(UpstreamEvent { task_id, kind })
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn event(line: &str) -> UpstreamEvent {
        match decode_line(line) {
            Decoded::Event(event) => event,
            other => panic!("expected an event, got {other:?}"),
        }
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case(": keep-alive")]
    #[case("event: message")]
    #[case("data:")]
    #[case("data: ")]
    #[case("data: {not json")]
    #[case("data: [1, 2, 3]")]
    #[case("data: {\"answer\":\"no tag\"}")]
    fn test_lines_that_are_skipped(#[case] line: &str) {
        assert_eq!(decode_line(line), Decoded::Skip);
    }

    #[rstest]
    #[case("data: [DONE]")]
    #[case("data:  [DONE]  ")]
    fn test_done_sentinel(#[case] line: &str) {
        assert_eq!(decode_line(line), Decoded::Done);
    }

    #[test]
    fn test_message_event() {
        let decoded = event(
            r#"data: {"event":"message","task_id":"t1","answer":"Hel","conversation_id":"up1"}"#,
        );
        assert_eq!(decoded.task_id.as_deref(), Some("t1"));
        assert_eq!(
            decoded.kind,
            EventKind::Message {
                answer: Some("Hel".into()),
                conversation_id: Some("up1".into()),
            }
        );
    }

    #[test]
    fn test_message_file_event() {
        let decoded = event(
            r#"data: {"event":"message_file","id":"f1","type":"image","url":"https://cdn/x.png"}"#,
        );
        assert_eq!(
            decoded.kind,
            EventKind::MessageFile {
                id: Some("f1".into()),
                file_type: Some("image".into()),
                url: Some("https://cdn/x.png".into()),
                conversation_id: None,
            }
        );
    }

    #[test]
    fn test_lifecycle_and_unknown_events() {
        for name in ["workflow_started", "node_finished", "ping", "agent_thought"] {
            let line = format!(r#"data: {{"event":"{name}","data":{{"id":"n1"}}}}"#);
            assert!(event(&line).kind.is_lifecycle(), "{name} should be lifecycle");
        }
        assert!(!event(r#"data: {"event":"message_end"}"#).kind.is_lifecycle());
    }

    #[test]
    fn test_error_field_overrides_event_tag() {
        let decoded = event(r#"data: {"event":"message","error":"quota exceeded"}"#);
        assert_eq!(
            decoded.kind,
            EventKind::Error {
                message: Some("quota exceeded".into())
            }
        );

        let decoded = event(r#"data: {"error":{"message":"bad key","code":401}}"#);
        assert_eq!(
            decoded.kind,
            EventKind::Error {
                message: Some("bad key".into())
            }
        );
    }

    #[test]
    fn test_error_event_with_message() {
        let decoded = event(r#"data: {"event":"error","status":400,"message":"quota exceeded"}"#);
        assert_eq!(
            decoded.kind,
            EventKind::Error {
                message: Some("quota exceeded".into())
            }
        );
    }

    #[test]
    fn test_error_event_with_structured_message() {
        let decoded = event(
            r#"data: {"event":"error","status":500,"message":{"detail":"quota exceeded"}}"#,
        );
        match decoded.kind {
            EventKind::Error { message: Some(message) } => {
                assert!(message.contains("quota exceeded"), "{message}")
            }
            other => panic!("expected an error event, got {other:?}"),
        }

        let decoded = event(r#"data: {"event":"error","message":{"message":"bad key"}}"#);
        assert_eq!(
            decoded.kind,
            EventKind::Error {
                message: Some("bad key".into())
            }
        );

        let decoded = event(r#"data: {"event":"error","code":"overloaded"}"#);
        assert_eq!(decoded.kind, EventKind::Error { message: None });
    }

    #[test]
    fn test_null_error_is_not_an_error() {
        let decoded = event(r#"data: {"event":"message_end","error":null}"#);
        assert_eq!(
            decoded.kind,
            EventKind::MessageEnd {
                conversation_id: None
            }
        );
    }

    #[test]
    fn test_empty_task_id_is_ignored() {
        let decoded = event(r#"data: {"event":"ping","task_id":""}"#);
        assert_eq!(decoded.task_id, None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }
}
