//! Client-facing frames and the emitter that writes them
//!
//! The client only ever sees six kinds of frame. The [`FrameEmitter`] writes them to the
//! response channel in the order they are produced and makes sure `data: [DONE]` is written
//! exactly once and last.

use super::decoder::DONE_SENTINEL;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Chunks of the SSE response body as they leave this service.
pub type FrameChunk = Result<Bytes, Infallible>;

/// A file block as the client renders it: either a file the workflow produced or a
/// document generated from the final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileBlock {
    pub filename: String,
    pub url: String,
    pub mime_type: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// A raw piece of answer text.
    Delta {
        content: String,
        task_id: Option<String>,
    },
    /// The gateway assigned a task id; the client can use it to stop generation.
    Task { task_id: String },
    File(FileBlock),
    /// The local conversation id plus the id the gateway knows the conversation by.
    Conversation {
        conversation_id: String,
        upstream_conversation_id: String,
    },
    Error { message: String },
    Done,
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Delta { .. } => "delta",
            ClientFrame::Task { .. } => "task",
            ClientFrame::File(_) => "file",
            ClientFrame::Conversation { .. } => "conversation",
            ClientFrame::Error { .. } => "error",
            ClientFrame::Done => "done",
        }
    }

    /// JSON payload of the frame; `None` for the done sentinel.
    pub fn payload(&self) -> Option<serde_json::Value> {
        let value = match self {
            ClientFrame::Delta { content, task_id } => {
                let mut value = json!({ "choices": [{ "delta": { "content": content } }] });
                if let Some(task_id) = task_id {
                    value["task_id"] = json!(task_id);
                }
                value
            }
            ClientFrame::Task { task_id } => json!({ "type": "task", "task_id": task_id }),
            ClientFrame::File(block) => json!({
                "type": "file",
                "filename": block.filename,
                "url": block.url,
                "mime_type": block.mime_type,
                "conversation_id": block.conversation_id,
            }),
            ClientFrame::Conversation {
                conversation_id,
                upstream_conversation_id,
            } => json!({
                "type": "conversation",
                "conversation_id": conversation_id,
                "upstream_conversation_id": upstream_conversation_id,
            }),
            ClientFrame::Error { message } => json!({ "error": { "message": message } }),
            ClientFrame::Done => return None,
        };
        Some(value)
    }

    /// Format as an SSE frame.
    pub fn to_sse(&self) -> String {
        match self.payload() {
            Some(value) => format!("data: {value}\n\n"),
            None => format!("data: {DONE_SENTINEL}\n\n"),
        }
    }
}

/// Writes frames to one client connection.
///
/// Once the receiving side is gone every further write is dropped, and once `done` has been
/// written nothing else goes out.
#[derive(Debug)]
pub struct FrameEmitter {
    tx: mpsc::Sender<FrameChunk>,
    connected: bool,
    done_sent: bool,
    emitted: usize,
}

impl FrameEmitter {
    pub fn new(tx: mpsc::Sender<FrameChunk>) -> Self {
        Self {
            tx,
            connected: true,
            done_sent: false,
            emitted: 0,
        }
    }

    /// Write one frame. Returns `false` if the client is no longer listening.
    pub async fn emit(&mut self, frame: ClientFrame) -> bool {
        if self.done_sent {
            warn!(kind = frame.kind(), "Dropping frame written after done");
            return self.connected;
        }
        if matches!(frame, ClientFrame::Done) {
            self.done_sent = true;
        }
        if !self.connected {
            return false;
        }

        trace!(kind = frame.kind(), "Emitting client frame");
        if self.tx.send(Ok(Bytes::from(frame.to_sse()))).await.is_err() {
            debug!("Client disconnected, no further frames will be written");
            self.connected = false;
            return false;
        }
        self.emitted += 1;
        true
    }

    /// Write several frames in order, stopping at the first failed write.
    pub async fn emit_all(&mut self, frames: impl IntoIterator<Item = ClientFrame>) -> bool {
        for frame in frames {
            if !self.emit(frame).await {
                return false;
            }
        }
        true
    }

    /// Terminate the stream. Safe to call more than once.
    pub async fn finish(&mut self) {
        if !self.done_sent {
            self.emit(ClientFrame::Done).await;
        }
    }

    /// Resolves once the client side of the channel has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_connected(&self) -> bool {
        self.connected && !self.tx.is_closed()
    }

    pub fn done_sent(&self) -> bool {
        self.done_sent
    }

    /// Number of frames that actually reached the channel.
    pub fn emitted(&self) -> usize {
        self.emitted
    }
}
