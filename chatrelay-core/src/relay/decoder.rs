//! Client-side framing: an arbitrarily chunked byte stream in, relay events out.
//!
//! Reads may split a frame anywhere, including inside a UTF-8 sequence or in
//! the middle of the `\n\n` terminator, so bytes are buffered until a complete
//! frame is present. Frames without a `data:` line, with malformed JSON or with
//! an unknown payload shape are keepalives or noise and are dropped silently.

use std::collections::VecDeque;
use std::fmt::Display;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::http_client::error_message_of;
use crate::stream::{EventStream, RelayEvent};

/// Message of the failure synthesized when the transport closes early.
pub const UNEXPECTED_END: &str = "stream ended unexpectedly";

/// Incremental frame decoder.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    /// Buffer offset already known not to start a terminator.
    scanned: usize,
    finished: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a terminal event has been produced (or `finish` was called).
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes currently held as an incomplete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Feed one chunk; returns the events completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buf.extend_from_slice(chunk);

        while let Some((end, term_len)) = self.find_terminator() {
            let frame: Vec<u8> = self.buf.drain(..end + term_len).collect();
            self.scanned = 0;
            let text = String::from_utf8_lossy(&frame[..end]);
            if let Some(event) = classify(&text) {
                let terminal = event.is_terminal();
                out.push(event);
                if terminal {
                    self.finished = true;
                    self.buf.clear();
                    break;
                }
            }
        }
        out
    }

    /// Signal that the transport closed. Returns a synthesized `Failed` if no
    /// terminal event was seen. An unterminated trailing frame is discarded.
    pub fn finish(&mut self) -> Option<RelayEvent> {
        if self.finished {
            return None;
        }
        self.finished = true;
        if !self.buf.is_empty() {
            tracing::debug!(bytes = self.buf.len(), "discarding unterminated frame");
            self.buf.clear();
        }
        Some(RelayEvent::Failed(UNEXPECTED_END.to_string()))
    }

    /// Clean end of input: a trailing bare `\r` can no longer start a `\r\n`,
    /// so frames it terminates are released before `finish`.
    pub fn close(&mut self) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        if self.buf.ends_with(b"\r") {
            out = self.push(b"\n");
        }
        out.extend(self.finish());
        out
    }

    /// Locate the first frame terminator: two consecutive line breaks, each
    /// one of `\r\n`, `\n` or `\r`. Returns the frame length and the
    /// terminator length.
    fn find_terminator(&mut self) -> Option<(usize, usize)> {
        let buf = &self.buf;
        let mut i = self.scanned;
        while i < buf.len() {
            let first = match line_break_at(buf, i) {
                Break::No => {
                    i += 1;
                    continue;
                }
                Break::More => break,
                Break::Len(n) => n,
            };
            match line_break_at(buf, i + first) {
                Break::Len(second) => return Some((i, first + second)),
                Break::More => break,
                Break::No => i += first,
            }
        }
        self.scanned = i;
        None
    }
}

enum Break {
    No,
    /// Undecidable until more bytes arrive.
    More,
    Len(usize),
}

fn line_break_at(buf: &[u8], i: usize) -> Break {
    match buf.get(i) {
        None => Break::More,
        Some(b'\n') => Break::Len(1),
        Some(b'\r') => match buf.get(i + 1) {
            Some(b'\n') => Break::Len(2),
            Some(_) => Break::Len(1),
            None => Break::More,
        },
        Some(_) => Break::No,
    }
}

/// Classify one complete frame (terminator already removed).
fn classify(frame: &str) -> Option<RelayEvent> {
    let mut event_name: Option<&str> = None;
    let mut data: Vec<&str> = Vec::new();
    for line in frame.split(['\r', '\n']) {
        if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim());
        }
    }
    if data.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(&data.join("\n")).ok()?;

    let delta = value.get("delta");
    let done = value.get("done").and_then(Value::as_bool) == Some(true);
    match (delta, done) {
        // Ambiguous frame: never produced by the encoder.
        (Some(_), true) => None,
        (Some(d), false) => d
            .as_str()
            .filter(|s| !s.is_empty())
            .map(|s| RelayEvent::Delta(s.to_string())),
        (None, true) => Some(RelayEvent::Completed),
        (None, false) => {
            if let Some(message) = error_message_of(&value) {
                return Some(RelayEvent::Failed(message));
            }
            // Older gateways sent `event: error` with a bare `{"message":..}`.
            if event_name == Some("error") {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("stream failed");
                return Some(RelayEvent::Failed(message.to_string()));
            }
            None
        }
    }
}

struct DecodeState<S> {
    inner: Option<S>,
    decoder: FrameDecoder,
    queue: VecDeque<RelayEvent>,
}

/// Decode a byte stream into relay events.
///
/// The resulting stream always ends with exactly one terminal event: a
/// transport error or an early close become `Failed`. Once a terminal event is
/// decoded the byte stream is dropped, closing the connection.
pub fn decode_stream<S, E>(bytes: S) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Display,
{
    let state = DecodeState {
        inner: Some(bytes),
        decoder: FrameDecoder::new(),
        queue: VecDeque::new(),
    };
    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.queue.pop_front() {
                return Some((event, st));
            }
            let inner = st.inner.as_mut()?;
            match inner.next().await {
                Some(Ok(chunk)) => {
                    st.queue.extend(st.decoder.push(&chunk));
                    if st.decoder.is_finished() {
                        st.inner = None;
                    }
                }
                Some(Err(e)) => {
                    st.inner = None;
                    if st.decoder.finish().is_some() {
                        st.queue.push_back(RelayEvent::Failed(e.to_string()));
                    }
                }
                None => {
                    st.inner = None;
                    st.queue.extend(st.decoder.close());
                }
            }
        }
    })
    .fuse()
    .boxed()
}
