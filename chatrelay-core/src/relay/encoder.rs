//! Gateway-side framing: upstream text fragments in, event-stream frames out.
//!
//! Every event becomes one frame, `data: <compact JSON>\n\n`:
//! - `{"delta":"<text>"}` per non-empty fragment, in upstream order
//! - `{"done":true}` once, as the last frame of a successful stream
//! - `{"error":{"message":"<text>"}}` as the last frame of a failed stream
//!
//! Frames are produced lazily, one per poll, so the HTTP layer writes each
//! frame as soon as it exists.

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::Serialize;

use crate::error::{CoreResult, RelayError};
use crate::model::ErrorDetail;
use crate::stream::{RelayEvent, TextStream};
use crate::telemetry::{self, ExchangeLog, Outcome};

/// Encoded frames, ready to be used as a response body.
pub type FrameStream = BoxStream<'static, Bytes>;

#[derive(Serialize)]
#[serde(untagged)]
enum WireFrame<'a> {
    Delta { delta: &'a str },
    Done { done: bool },
    Error { error: ErrorDetail },
}

/// Serialize one event as a complete frame.
pub fn encode_frame(event: &RelayEvent) -> String {
    let wire = match event {
        RelayEvent::Delta(text) => WireFrame::Delta { delta: text },
        RelayEvent::Completed => WireFrame::Done { done: true },
        RelayEvent::Failed(message) => WireFrame::Error {
            error: ErrorDetail {
                message: message.clone(),
            },
        },
    };
    // Serializing these shapes to a String cannot fail.
    let json = serde_json::to_string(&wire).unwrap_or_default();
    format!("data: {json}\n\n")
}

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Cap on total stream duration; expiry ends the stream with a failure frame.
    pub max_duration: Duration,
    /// Route label for telemetry.
    pub route: &'static str,
    pub model: String,
}

impl RelayOptions {
    pub fn new(model: impl Into<String>, max_duration: Duration) -> Self {
        Self {
            max_duration,
            route: "/api/chat/stream",
            model: model.into(),
        }
    }
}

struct EncoderState {
    /// Provider open still in progress; counts against the deadline.
    opening: Option<BoxFuture<'static, CoreResult<TextStream>>>,
    upstream: Option<TextStream>,
    deadline: tokio::time::Instant,
    opts: RelayOptions,
    started: Instant,
    deltas: u32,
    chars: u64,
    /// Set once the terminal frame has been produced.
    outcome: Option<Outcome>,
}

impl EncoderState {
    /// Build the terminal frame, drop upstream and record the exchange.
    fn terminate(&mut self, event: RelayEvent, outcome: Outcome, error: Option<&RelayError>) -> Bytes {
        self.opening = None;
        self.upstream = None;
        self.outcome = Some(outcome);
        let mut log = ExchangeLog::new(self.opts.route, outcome)
            .model(&self.opts.model)
            .deltas(self.deltas, self.chars)
            .latency_ms(self.started.elapsed().as_millis() as u64);
        if let Some(e) = error {
            tracing::warn!(error = %e, deltas = self.deltas, "relay failed");
            log = log.error(e.kind(), &e.client_message());
        }
        telemetry::emit(log);
        Bytes::from(encode_frame(&event))
    }
}

impl Drop for EncoderState {
    fn drop(&mut self) {
        if self.outcome.is_none() {
            // Body dropped before the terminal frame: the client went away.
            // Dropping `upstream` here cancels the provider call.
            tracing::info!(deltas = self.deltas, "client disconnected mid-stream");
            telemetry::emit(
                ExchangeLog::new(self.opts.route, Outcome::ClientDisconnected)
                    .model(&self.opts.model)
                    .deltas(self.deltas, self.chars)
                    .latency_ms(self.started.elapsed().as_millis() as u64)
                    .error("transport", "client disconnected"),
            );
        }
    }
}

/// Relay an already opened upstream fragment stream as frames.
///
/// `upstream` is the result of opening the provider stream; an `Err` still
/// produces a well-formed stream consisting of a single error frame.
pub fn relay(upstream: CoreResult<TextStream>, opts: RelayOptions) -> FrameStream {
    relay_opening(futures::future::ready(upstream), opts)
}

/// Relay a provider stream that is still being opened.
///
/// The duration cap starts now and covers the open, so an upstream that never
/// answers still ends with a timeout frame. Nothing is polled until the first
/// frame is requested.
pub fn relay_opening<F>(open: F, opts: RelayOptions) -> FrameStream
where
    F: Future<Output = CoreResult<TextStream>> + Send + 'static,
{
    let state = EncoderState {
        opening: Some(open.boxed()),
        upstream: None,
        deadline: tokio::time::Instant::now() + opts.max_duration,
        opts,
        started: Instant::now(),
        deltas: 0,
        chars: 0,
        outcome: None,
    };

    futures::stream::unfold(state, |mut st| async move {
        if st.outcome.is_some() {
            return None;
        }
        if let Some(open) = st.opening.take() {
            match tokio::time::timeout_at(st.deadline, open).await {
                Ok(Ok(upstream)) => st.upstream = Some(upstream),
                Ok(Err(e)) => {
                    let frame = st.terminate(
                        RelayEvent::Failed(e.client_message()),
                        Outcome::Failed,
                        Some(&e),
                    );
                    return Some((frame, st));
                }
                Err(_elapsed) => {
                    let e = RelayError::Timeout(st.opts.max_duration.as_secs());
                    let frame =
                        st.terminate(RelayEvent::Failed(e.client_message()), Outcome::TimedOut, Some(&e));
                    return Some((frame, st));
                }
            }
        }

        loop {
            let deadline = st.deadline;
            let next = match st.upstream.as_mut() {
                Some(up) => tokio::time::timeout_at(deadline, up.next()).await,
                None => return None,
            };
            let frame = match next {
                Err(_elapsed) => {
                    let e = RelayError::Timeout(st.opts.max_duration.as_secs());
                    st.terminate(RelayEvent::Failed(e.client_message()), Outcome::TimedOut, Some(&e))
                }
                Ok(None) => st.terminate(RelayEvent::Completed, Outcome::Completed, None),
                Ok(Some(Err(e))) => {
                    st.terminate(RelayEvent::Failed(e.client_message()), Outcome::Failed, Some(&e))
                }
                Ok(Some(Ok(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    st.deltas += 1;
                    st.chars += text.chars().count() as u64;
                    Bytes::from(encode_frame(&RelayEvent::Delta(text)))
                }
            };
            return Some((frame, st));
        }
    })
    .fuse()
    .boxed()
}
