//! Per-request interpreter state for one relayed answer
//!
//! A [`StreamSession`] consumes decoded gateway events in arrival order, keeps the running
//! answer text, the gateway task id and the gateway conversation id, and produces the client
//! frames each event maps to. It never performs I/O; the driver in [`crate::relay`] feeds it and
//! writes whatever it returns.

use super::decoder::{Decoded, EventKind, UpstreamEvent};
use super::frames::{ClientFrame, FileBlock};
use tracing::{debug, info, trace, warn};

const UPSTREAM_FILE_MIME: &str = "application/octet-stream";

/// What the driver should do after a line has been interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Keep reading lines.
    Continue,
    /// The gateway signalled the end of the stream.
    Finish,
    /// The gateway reported an error; the error frame has already been produced.
    Abort(String),
}

#[derive(Debug, Clone)]
pub struct StreamSession {
    conversation_id: String,
    upstream_conversation_id: String,
    task_id: Option<String>,
    accumulated: String,
    deltas: usize,
    turn_ended: bool,
    terminated: bool,
}

impl StreamSession {
    /// Start a session for a local conversation. Until the gateway reports its own id the
    /// upstream id is the one the client sent, or the local id.
    pub fn new(conversation_id: impl Into<String>, upstream_conversation_id: Option<String>) -> Self {
        let conversation_id = conversation_id.into();
        let upstream_conversation_id = upstream_conversation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| conversation_id.clone());
        Self {
            conversation_id,
            upstream_conversation_id,
            task_id: None,
            accumulated: String::new(),
            deltas: 0,
            turn_ended: false,
            terminated: false,
        }
    }

    /// Interpret one decoded line, pushing any resulting client frames onto `out`.
    pub fn apply(&mut self, decoded: Decoded, out: &mut Vec<ClientFrame>) -> Step {
        if self.terminated {
            trace!("Ignoring line after session terminated");
            return Step::Finish;
        }
        match decoded {
            Decoded::Skip => Step::Continue,
            Decoded::Done => {
                debug!(conversation_id = %self.conversation_id, "Gateway sent done sentinel");
                Step::Finish
            }
            Decoded::Event(event) => self.handle_event(event, out),
        }
    }

    pub fn handle_event(&mut self, event: UpstreamEvent, out: &mut Vec<ClientFrame>) -> Step {
        let UpstreamEvent { task_id, kind } = event;

        // Hand the task id out before anything else so the client can stop generation early
        if let Some(task_id) = task_id {
            if self.task_id.as_deref() != Some(task_id.as_str()) {
                debug!(task_id = %task_id, "Gateway assigned task id");
                self.task_id = Some(task_id.clone());
                out.push(ClientFrame::Task { task_id });
            }
        }

        match kind {
            EventKind::Message {
                answer,
                conversation_id,
            } => {
                if let Some(delta) = answer.filter(|a| !a.is_empty()) {
                    self.accumulated.push_str(&delta);
                    self.deltas += 1;
                    out.push(ClientFrame::Delta {
                        content: delta,
                        task_id: self.task_id.clone(),
                    });
                }
                self.adopt_upstream_id(conversation_id);
                Step::Continue
            }
            EventKind::MessageFile {
                id,
                file_type,
                url,
                conversation_id,
            } => {
                self.adopt_upstream_id(conversation_id);
                let file_type = file_type.unwrap_or_else(|| "file".to_string());
                let id = id.unwrap_or_default();
                out.push(ClientFrame::File(FileBlock {
                    filename: format!("{file_type}-{id}"),
                    url: url.unwrap_or_default(),
                    mime_type: UPSTREAM_FILE_MIME.to_string(),
                    conversation_id: self.upstream_conversation_id.clone(),
                }));
                Step::Continue
            }
            EventKind::MessageEnd { conversation_id } => {
                self.adopt_upstream_id(conversation_id);
                self.turn_ended = true;
                info!(
                    conversation_id = %self.conversation_id,
                    upstream_conversation_id = %self.upstream_conversation_id,
                    chars = self.accumulated.chars().count(),
                    "Gateway turn ended"
                );
                Step::Continue
            }
            EventKind::Error { message } => {
                let message = message.unwrap_or_else(|| "unknown error".to_string());
                warn!(conversation_id = %self.conversation_id, error = %message, "Gateway reported an error");
                self.terminated = true;
                let message = format!("upstream error: {message}");
                out.push(ClientFrame::Error {
                    message: message.clone(),
                });
                Step::Abort(message)
            }
            lifecycle => {
                trace!(event = ?lifecycle, "Ignoring lifecycle event");
                Step::Continue
            }
        }
    }

    fn adopt_upstream_id(&mut self, conversation_id: Option<String>) {
        if let Some(id) = conversation_id.filter(|id| !id.is_empty()) {
            if id != self.upstream_conversation_id {
                debug!(upstream_conversation_id = %id, "Adopting gateway conversation id");
                self.upstream_conversation_id = id;
            }
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn upstream_conversation_id(&self) -> &str {
        &self.upstream_conversation_id
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Number of non-empty deltas forwarded so far.
    pub fn deltas(&self) -> usize {
        self.deltas
    }

    /// Whether the gateway has already closed the assistant turn.
    pub fn turn_ended(&self) -> bool {
        self.turn_ended
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}
