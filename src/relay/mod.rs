//! The streaming relay
//!
//! Drives one exchange with the gateway: the upstream body goes through the
//! [`LineBufferedStream`], every line through [`decoder::decode_line`] and the
//! [`StreamSession`], and the resulting frames out through the [`FrameEmitter`]. However the
//! upstream side ends, the [`Finalizer`] runs once and `done` is written last.
//!
//! Streaming exchanges run on their own task and talk to the HTTP response through a channel,
//! so a client that goes away stops the emission without cancelling the bookkeeping.

pub mod decoder;
pub mod finalizer;
pub mod frames;
pub mod session;

use crate::client::HttpClient;
use crate::errors::RelayError;
use crate::gateway::{GatewayConfig, ResponseMode};
use crate::render::{OutputFormat, Renderer};
use crate::sse::LineBufferedStream;
use crate::store::ChatStore;
use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use decoder::decode_line;
use finalizer::{Finalizer, Termination};
use frames::{ClientFrame, FileBlock, FrameEmitter};
use futures_util::StreamExt;
use serde_json::Value;
use session::{Step, StreamSession};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout_at};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Frames buffered between the relay task and the HTTP response.
const FRAME_BUFFER: usize = 64;

/// Upper bound on an error body read back from the gateway.
const MAX_ERROR_BODY: usize = 64 * 1024;

/// Upper bound on a blocking answer read back from the gateway.
pub(crate) const MAX_BLOCKING_BODY: usize = 16 * 1024 * 1024;

/// Everything an exchange needs from the application.
#[derive(Clone)]
pub struct RelayContext<T> {
    pub client: T,
    pub gateway: Arc<GatewayConfig>,
    pub store: Arc<dyn ChatStore>,
    pub renderer: Arc<dyn Renderer>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for RelayContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayContext")
            .field("client", &self.client)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

/// One question to relay.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayRequest {
    pub query: String,
    /// Local conversation the answer is stored under.
    pub conversation_id: String,
    /// Conversation id the gateway knows, if the client has one.
    pub upstream_conversation_id: Option<String>,
    pub output_format: OutputFormat,
}

/// How a streamed exchange ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Turn end, done sentinel, or the gateway closing the stream.
    Completed,
    /// The gateway sent an error event.
    UpstreamError(String),
    /// The gateway could not be reached, refused the request, dropped the connection or timed out.
    Failed(String),
    /// The client went away before the exchange ended.
    ClientGone,
}

/// What a finished streamed exchange did.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySummary {
    pub outcome: Outcome,
    pub answer: String,
    pub upstream_conversation_id: String,
    pub task_id: Option<String>,
    pub message_id: Option<String>,
    /// Frames that reached the client, `done` included.
    pub frames_emitted: usize,
}

/// Start relaying on a background task and return the SSE response that carries its frames.
pub fn spawn_relay<T>(ctx: RelayContext<T>, request: RelayRequest) -> Response
where
    T: HttpClient + Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(FRAME_BUFFER);
    let span = info_span!("relay", conversation_id = %request.conversation_id);
    tokio::spawn(
        async move {
            let summary = run_relay(&ctx, request, FrameEmitter::new(tx)).await;
            debug!(outcome = ?summary.outcome, frames = summary.frames_emitted, "Relay finished");
        }
        .instrument(span),
    );

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

/// Relay one exchange to completion, writing frames through `emitter`.
pub async fn run_relay<T: HttpClient>(
    ctx: &RelayContext<T>,
    request: RelayRequest,
    mut emitter: FrameEmitter,
) -> RelaySummary {
    let mut session = StreamSession::new(
        request.conversation_id.clone(),
        request.upstream_conversation_id.clone(),
    );
    let mut finalizer = Finalizer::new(
        ctx.store.clone(),
        ctx.renderer.clone(),
        request.conversation_id.clone(),
        request.output_format,
    );

    let outcome = pump(ctx, &request, &mut session, &mut emitter).await;

    let termination = match &outcome {
        Outcome::Completed => Termination::Completed,
        Outcome::UpstreamError(_) | Outcome::ClientGone => Termination::Failed,
        Outcome::Failed(message) => {
            emitter
                .emit(ClientFrame::Error {
                    message: message.clone(),
                })
                .await;
            Termination::Failed
        }
    };

    let completion = finalizer
        .finalize(
            session.accumulated(),
            session.upstream_conversation_id(),
            termination,
        )
        .await;
    let message_id = match completion {
        Some(completion) => {
            emitter.emit_all(completion.frames).await;
            completion.message_id
        }
        None => None,
    };
    emitter.finish().await;

    info!(
        outcome = ?outcome,
        deltas = session.deltas(),
        upstream_conversation_id = %session.upstream_conversation_id(),
        "Exchange finished"
    );

    RelaySummary {
        outcome,
        answer: session.accumulated().to_string(),
        upstream_conversation_id: session.upstream_conversation_id().to_string(),
        task_id: session.task_id().map(str::to_owned),
        message_id,
        frames_emitted: emitter.emitted(),
    }
}

/// Read the gateway stream until it ends one way or another.
async fn pump<T: HttpClient>(
    ctx: &RelayContext<T>,
    request: &RelayRequest,
    session: &mut StreamSession,
    emitter: &mut FrameEmitter,
) -> Outcome {
    let deadline = Instant::now() + ctx.gateway.timeout;
    let payload = ctx.gateway.payload(
        &request.query,
        request.upstream_conversation_id.as_deref(),
        ResponseMode::Streaming,
    );
    let upstream_request = match ctx.gateway.chat_request(&payload) {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "Could not build gateway request");
            return Outcome::Failed(e.to_string());
        }
    };

    let response = tokio::select! {
        biased;
        _ = emitter.closed() => return Outcome::ClientGone,
        result = timeout_at(deadline, ctx.client.request(upstream_request)) => match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(error = %e, "Gateway unreachable");
                return Outcome::Failed(RelayError::UpstreamUnavailable(e.to_string()).to_string());
            }
            Err(_) => {
                warn!("Gateway did not answer in time");
                return Outcome::Failed(RelayError::UpstreamTimeout(ctx.gateway.timeout).to_string());
            }
        },
    };

    let status = response.status();
    if !status.is_success() {
        let body = match timeout_at(
            deadline,
            axum::body::to_bytes(response.into_body(), MAX_ERROR_BODY),
        )
        .await
        {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => String::new(),
        };
        warn!(status = %status, body = %body, "Gateway refused the request");
        return Outcome::Failed(RelayError::UpstreamStatus { status, body }.to_string());
    }

    let mut lines = LineBufferedStream::new(response.into_body().into_data_stream());
    let mut frames = Vec::new();

    loop {
        let next = tokio::select! {
            biased;
            _ = emitter.closed() => None,
            next = timeout_at(deadline, lines.next()) => Some(next),
        };

        let line = match next {
            None => {
                info!(chars = session.accumulated().len(), "Client disconnected mid-stream");
                return Outcome::ClientGone;
            }
            Some(Err(_)) => {
                return connection_lost(
                    session,
                    RelayError::UpstreamTimeout(ctx.gateway.timeout).to_string(),
                );
            }
            Some(Ok(None)) => {
                debug!("Gateway closed the stream");
                return Outcome::Completed;
            }
            Some(Ok(Some(Err(e)))) => {
                return connection_lost(
                    session,
                    RelayError::UpstreamUnavailable(format!("connection lost: {e}")).to_string(),
                );
            }
            Some(Ok(Some(Ok(line)))) => line,
        };

        let step = session.apply(decode_line(&line), &mut frames);
        if !emitter.emit_all(frames.drain(..)).await {
            return Outcome::ClientGone;
        }
        match step {
            Step::Continue => {}
            Step::Finish => return Outcome::Completed,
            Step::Abort(message) => return Outcome::UpstreamError(message),
        }
    }
}

/// A broken stream after the turn already ended still counts as a completed answer.
fn connection_lost(session: &StreamSession, message: String) -> Outcome {
    if session.turn_ended() {
        warn!(error = %message, "Gateway stream broke after the turn ended");
        Outcome::Completed
    } else {
        warn!(error = %message, "Gateway stream broke mid-answer");
        Outcome::Failed(message)
    }
}

/// The answer to a non-streaming exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockingAnswer {
    pub answer: String,
    pub upstream_conversation_id: String,
    /// The gateway's id for the answer, if it reported one.
    pub upstream_message_id: Option<String>,
    pub usage: Option<Value>,
    pub message_id: Option<String>,
    pub file: Option<FileBlock>,
}

/// Relay one exchange in blocking mode and finalize it.
pub async fn complete_blocking<T: HttpClient>(
    ctx: &RelayContext<T>,
    request: RelayRequest,
) -> Result<BlockingAnswer, RelayError> {
    let payload = ctx.gateway.payload(
        &request.query,
        request.upstream_conversation_id.as_deref(),
        ResponseMode::Blocking,
    );
    let upstream_request = ctx.gateway.chat_request(&payload)?;
    let deadline = Instant::now() + ctx.gateway.timeout;

    let response = timeout_at(deadline, ctx.client.request(upstream_request))
        .await
        .map_err(|_| RelayError::UpstreamTimeout(ctx.gateway.timeout))?
        .map_err(|e| RelayError::UpstreamUnavailable(e.to_string()))?;

    let status = response.status();
    let bytes = timeout_at(
        deadline,
        axum::body::to_bytes(response.into_body(), MAX_BLOCKING_BODY),
    )
    .await
    .map_err(|_| RelayError::UpstreamTimeout(ctx.gateway.timeout))?
    .map_err(|e| {
        RelayError::UpstreamUnavailable(format!(
            "could not read response (limit {MAX_BLOCKING_BODY} bytes): {e}"
        ))
    })?;

    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes).into_owned();
        warn!(status = %status, body = %body, "Gateway refused the blocking request");
        return Err(RelayError::UpstreamStatus { status, body });
    }

    let value: Value = serde_json::from_slice(&bytes)
        .map_err(|e| RelayError::UpstreamProtocol(format!("response is not JSON: {e}")))?;

    let answer = blocking_answer_text(&value).to_string();
    let upstream_conversation_id = non_empty_str(&value, "conversation_id")
        .map(str::to_owned)
        .or_else(|| request.upstream_conversation_id.clone().filter(|id| !id.is_empty()))
        .unwrap_or_else(|| request.conversation_id.clone());
    let upstream_message_id = non_empty_str(&value, "message_id")
        .or_else(|| non_empty_str(&value, "id"))
        .or_else(|| non_empty_str(&value, "workflow_run_id"))
        .map(str::to_owned);
    let usage = value
        .pointer("/metadata/usage")
        .filter(|u| !u.is_null())
        .cloned();

    let mut finalizer = Finalizer::new(
        ctx.store.clone(),
        ctx.renderer.clone(),
        request.conversation_id.clone(),
        request.output_format,
    );
    let completion = finalizer
        .finalize(&answer, &upstream_conversation_id, Termination::Completed)
        .await
        .unwrap_or_default();

    info!(
        chars = answer.len(),
        upstream_conversation_id = %upstream_conversation_id,
        "Blocking exchange finished"
    );

    Ok(BlockingAnswer {
        answer,
        upstream_conversation_id,
        upstream_message_id,
        usage,
        message_id: completion.message_id,
        file: completion.file,
    })
}

/// Chat responses carry `answer` at the top level; workflow runs nest it under `data.outputs`.
fn blocking_answer_text(value: &Value) -> &str {
    ["/answer", "/data/outputs/answer", "/data/outputs/text"]
        .iter()
        .find_map(|pointer| value.pointer(pointer).and_then(Value::as_str))
        .unwrap_or_default()
}

fn non_empty_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}
