use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::Stream;
use reqwest::{Client, StatusCode};
use serde::{Serialize, de::DeserializeOwned};

use crate::config::HttpCfg;
use crate::error::{CoreResult, RelayError};

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
///
/// The client itself has no total timeout so long-lived event streams are not
/// cut off; `post_json` applies `request_timeout` per call instead.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("chatrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout: Duration::from_millis(cfg.request_timeout_ms),
        })
    }

    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default())
    }

    pub async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<(R, Option<String>, u32)> {
        let start = Instant::now();
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .timeout(self.request_timeout)
            .header("User-Agent", &self.user_agent);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        let resp = req.send().await.map_err(map_send_error)?;

        let latency = start.elapsed().as_millis() as u32;
        let status = resp.status();
        let headers = resp.headers().clone();
        let provider_request_id = extract_request_id(&headers);

        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let ra = parse_retry_after(&headers);
            return Err(map_http_error(status, ra, &text));
        }

        let parsed = resp.json::<R>().await.map_err(|e| {
            if e.is_decode() {
                RelayError::Upstream {
                    status: Some(status.as_u16()),
                    message: format!("json decode error: {e}"),
                }
            } else {
                RelayError::Transport(format!("reading response body failed: {e}"))
            }
        })?;
        tracing::debug!(url, status = status.as_u16(), latency_ms = latency, "upstream json call");
        Ok((parsed, provider_request_id, latency))
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line (trim not applied) from the SSE channel.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
    ) -> CoreResult<SseStream> {
        let byte_stream = self.post_stream(url, body, headers, "text/event-stream").await?;
        Ok(Box::pin(LineStream::new(byte_stream)))
    }

    /// POST JSON and return the raw response body as a byte stream, after
    /// mapping a non-2xx status to an error. `request_timeout` bounds the wait
    /// for response headers.
    pub async fn post_stream<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        accept: &str,
    ) -> CoreResult<Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>> {
        use futures_util::StreamExt;

        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", accept);
        for (k, v) in headers {
            req = req.header(*k, *v);
        }

        // Only the wait for response headers is bounded; the body may run long.
        let resp = tokio::time::timeout(self.request_timeout, req.send())
            .await
            .map_err(|_| {
                RelayError::Transport(format!(
                    "no response headers within {}ms",
                    self.request_timeout.as_millis()
                ))
            })?
            .map_err(map_send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, ra, &body));
        }
        tracing::debug!(url, status = status.as_u16(), "stream opened");

        let stream = resp.bytes_stream().map(|chunk| {
            chunk.map_err(|e| RelayError::Transport(format!("connection lost mid-stream: {e}")))
        });
        Ok(Box::pin(stream))
    }

    pub async fn get_json<R: DeserializeOwned>(&self, url: &str) -> CoreResult<R> {
        let resp = self
            .inner
            .get(url)
            .timeout(self.request_timeout)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(map_send_error)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, None, &text));
        }
        resp.json::<R>()
            .await
            .map_err(|e| RelayError::Transport(format!("reading response body failed: {e}")))
    }
}

fn map_send_error(e: reqwest::Error) -> RelayError {
    if e.is_timeout() {
        RelayError::Transport("request timed out".into())
    } else {
        RelayError::Transport(format!("request failed: {e}"))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "openai-request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

/// Turn a non-2xx upstream response into `RelayError::Upstream`, preferring the
/// provider's own `{"error":{"message":..}}` text over the raw body.
pub(crate) fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> RelayError {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| error_message_of(&v))
        .unwrap_or_else(|| truncate(body.trim(), 300));
    let detail = if detail.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request rejected")
            .to_string()
    } else {
        detail
    };
    let message = match retry_after {
        Some(secs) => format!("{detail} (retry after {secs}s)"),
        None => detail,
    };
    RelayError::Upstream {
        status: Some(status.as_u16()),
        message,
    }
}

/// Extract `error.message` (or a bare string `error`) from a JSON payload.
pub(crate) fn error_message_of(v: &serde_json::Value) -> Option<String> {
    match v.get("error")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(o) => o
            .get("message")
            .and_then(|m| m.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut t = s[..cut].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Internal line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
/// Bytes are buffered until a full line is present, so a multi-byte character
/// split across chunks is decoded intact.
struct LineStream {
    inner: Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>,
    buf: Vec<u8>,
    done: bool,
}

impl LineStream {
    fn new(inner: Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            done: false,
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(idx) = self.buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buf.drain(..=idx).collect();
                let mut end = raw.len() - 1;
                if end > 0 && raw[end - 1] == b'\r' {
                    end -= 1;
                }
                let line = String::from_utf8_lossy(&raw[..end]).into_owned();
                return Poll::Ready(Some(Ok(SseLine { line })));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.buf.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    self.buf.clear();
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    if !self.buf.is_empty() {
                        let line = String::from_utf8_lossy(&std::mem::take(&mut self.buf)).into_owned();
                        return Poll::Ready(Some(Ok(SseLine { line })));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
