//! Shared test doubles: a scripted upstream and an in-process transport that
//! runs the real encoder and decoder with awkward chunking in between.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::config::UpstreamCfg;
use crate::error::{CoreResult, RelayError};
use crate::model::{ChatRequest, ChatResult, ResolvedRequest, Usage};
use crate::provider::ChatProvider;
use crate::relay::{RelayOptions, decode_stream, relay, relay_opening};
use crate::session::ChatTransport;
use crate::stream::{EventStream, TextStream};
use crate::validator::{resolve, validate};

/// How a scripted upstream ends after its fragments.
#[derive(Debug, Clone)]
pub enum Ending {
    Complete,
    /// In-band provider error after the fragments.
    Upstream(String),
    /// Connection lost after the fragments.
    Transport(String),
    /// Never ends.
    Hang,
    /// Accepts the request but never answers, not even to open the stream.
    Silent,
    /// Provider refuses the request before streaming anything.
    Reject(String),
}

impl Ending {
    fn error(&self) -> Option<RelayError> {
        match self {
            Ending::Upstream(m) => Some(RelayError::Upstream {
                status: None,
                message: m.clone(),
            }),
            Ending::Transport(m) => Some(RelayError::Transport(m.clone())),
            Ending::Reject(m) => Some(RelayError::Upstream {
                status: Some(400),
                message: m.clone(),
            }),
            Ending::Complete | Ending::Hang | Ending::Silent => None,
        }
    }
}

#[derive(Debug)]
pub struct ScriptedProvider {
    fragments: Vec<String>,
    ending: Ending,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new<I, S>(fragments: I, ending: Ending) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            fragments: fragments.into_iter().map(Into::into).collect(),
            ending,
            calls: AtomicUsize::new(0),
        })
    }

    /// Number of upstream calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, req: ResolvedRequest) -> CoreResult<ChatResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ending::Hang | Ending::Silent = self.ending {
            futures::future::pending::<()>().await;
        }
        if let Some(e) = self.ending.error() {
            return Err(e);
        }
        let content = self.fragments.concat();
        let completion = self.fragments.len() as u32;
        Ok(ChatResult {
            id: "scripted-1".into(),
            created: 1_700_000_000,
            model: req.model,
            content,
            usage: Some(Usage {
                prompt_tokens: Some(req.messages.len() as u32),
                completion_tokens: Some(completion),
                total_tokens: Some(req.messages.len() as u32 + completion),
            }),
        })
    }

    async fn stream_complete(&self, _req: ResolvedRequest) -> CoreResult<TextStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ending::Silent = self.ending {
            futures::future::pending::<()>().await;
        }
        if let Ending::Reject(_) = self.ending
            && let Some(e) = self.ending.error()
        {
            return Err(e);
        }
        let head = futures::stream::iter(
            self.fragments
                .iter()
                .cloned()
                .map(Ok::<_, RelayError>)
                .collect::<Vec<_>>(),
        );
        let tail: TextStream = match (&self.ending, self.ending.error()) {
            (Ending::Hang, _) => futures::stream::pending().boxed(),
            (_, Some(e)) => futures::stream::iter(vec![Err(e)]).boxed(),
            (_, None) => futures::stream::empty().boxed(),
        };
        Ok(head.chain(tail).boxed())
    }
}

/// In-process gateway: validates like the HTTP handlers, encodes frames,
/// re-chunks the bytes into `chunk`-sized reads and decodes them again.
pub struct Loopback {
    provider: Arc<dyn ChatProvider>,
    upstream: UpstreamCfg,
    chunk: usize,
}

impl Loopback {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self {
            provider,
            upstream: UpstreamCfg::default(),
            chunk: 5,
        }
    }

    fn resolve(&self, req: &ChatRequest) -> CoreResult<ResolvedRequest> {
        let value = serde_json::to_value(req).map_err(|e| RelayError::Other(e.into()))?;
        let req = validate(&value)?;
        Ok(resolve(&req, &self.upstream))
    }
}

#[async_trait]
impl ChatTransport for Loopback {
    async fn send(&self, req: &ChatRequest) -> CoreResult<ChatResult> {
        let resolved = self.resolve(req)?;
        self.provider.complete(resolved).await
    }

    async fn stream(&self, req: &ChatRequest) -> CoreResult<EventStream> {
        let opts = RelayOptions::new(self.upstream.default_model.clone(), Duration::from_secs(600));
        let frames = match self.resolve(req) {
            Ok(resolved) => {
                let provider = self.provider.clone();
                relay_opening(async move { provider.stream_complete(resolved).await }, opts)
            }
            Err(e) => relay(Err(e), opts),
        };
        let chunk = self.chunk.max(1);
        let bytes = frames.flat_map(move |frame| {
            let pieces: Vec<Result<Bytes, Infallible>> = frame
                .chunks(chunk)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            futures::stream::iter(pieces)
        });
        Ok(decode_stream(bytes.boxed()))
    }
}
