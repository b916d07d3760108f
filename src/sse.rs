//! SSE (Server-Sent Events) line buffering
//!
//! The gateway delivers its event stream in arbitrarily sized network chunks, so a single
//! `data: {...}` line can be split across several packets. This module accumulates bytes and
//! only hands out complete, newline-terminated lines. Whatever is left when the upstream closes
//! is returned as one final line, even without a trailing newline.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Carry-over buffer that turns arbitrary chunks into complete lines.
///
/// Lines are split on `\n`; a trailing `\r` is stripped so CRLF streams behave the same.
/// Splitting happens on raw bytes, so a multi-byte UTF-8 character cut by a chunk boundary
/// is reassembled before it is decoded.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line) = self.next_line() {
            lines.push(line);
        }
        lines
    }

    /// Pop one complete line off the front of the buffer, if there is one.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.iter().position(|b| *b == b'\n')?;
        let line = self.buffer.split_to(pos + 1);
        Some(decode_line(&line[..pos]))
    }

    /// Flush the residual partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let rest = self.buffer.split();
        Some(decode_line(&rest))
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// A stream wrapper that yields complete lines out of a chunked byte stream.
pub struct LineBufferedStream<S> {
    inner: S,
    lines: LineBuffer,
    exhausted: bool,
}

impl<S> LineBufferedStream<S> {
    /// Wrap an existing byte stream with line buffering.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            lines: LineBuffer::new(),
            exhausted: false,
        }
    }
}

impl<S, E> Stream for LineBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<String, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(line) = this.lines.next_line() {
                return Poll::Ready(Some(Ok(line)));
            }

            if this.exhausted {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.lines.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    this.exhausted = true;
                    // Upstream ended without a final newline
                    return Poll::Ready(this.lines.finish().map(Ok));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}
