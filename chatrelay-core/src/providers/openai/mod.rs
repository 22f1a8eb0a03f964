use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, SseLine, SseStream, error_message_of};
use crate::model::{ChatMessage, ChatResult, ResolvedRequest, Usage};
use crate::provider::ChatProvider;
use crate::stream::TextStream;

#[derive(Debug, Clone)]
pub struct OpenAI {
    http: HttpClient,
    base: String,
    org: Option<String>,
    name: String, // usually "openai"
    api_key: SecretString,
}

impl OpenAI {
    pub fn new(http: HttpClient, api_key: SecretString, base: String, org: Option<String>) -> Self {
        Self {
            http,
            api_key,
            base: base.trim_end_matches('/').to_string(),
            org,
            name: "openai".into(),
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAI::new(
            HttpClient::new_default().unwrap(),
            SecretString::new("test-key".into()),
            server_base.to_string(),
            None,
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        let mut h = vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ];
        if let Some(org) = &self.org {
            h.push(("OpenAI-Organization".into(), org.clone()));
        }
        h
    }

    fn url(&self) -> String {
        format!("{}/v1/chat/completions", self.base)
    }

    fn now_secs() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default()
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OAChatReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Deserialize)]
struct OAChatResp {
    id: String,
    #[serde(default)]
    created: Option<i64>,
    #[serde(default)]
    model: Option<String>,
    choices: Vec<OAChoice>,
    usage: Option<OAUsage>,
}

#[derive(Deserialize)]
struct OAChoice {
    message: OAMessage,
}

#[derive(Deserialize)]
struct OAMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct OAUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct OAStreamChunk {
    #[serde(default)]
    choices: Vec<OAStreamChoice>,
}

#[derive(Deserialize)]
struct OAStreamChoice {
    #[serde(default)]
    delta: OADelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

/// One upstream SSE line, classified.
#[derive(Debug, PartialEq)]
enum Parsed {
    Skip,
    Done,
    Error(String),
    Chunk { text: Option<String>, finished: bool },
}

fn parse_line(line: &str) -> Parsed {
    let Some(data) = line.strip_prefix("data:") else {
        // blank separators, `event:`/`id:` fields and `:` comments
        return Parsed::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Parsed::Done;
    }
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        tracing::debug!(data, "skipping non-json upstream line");
        return Parsed::Skip;
    };
    if let Some(message) = error_message_of(&value) {
        return Parsed::Error(message);
    }
    match serde_json::from_value::<OAStreamChunk>(value) {
        Ok(chunk) => {
            let first = chunk.choices.into_iter().next();
            let finished = first.as_ref().is_some_and(|c| c.finish_reason.is_some());
            let text = first
                .and_then(|c| c.delta.content)
                .filter(|t| !t.is_empty());
            Parsed::Chunk { text, finished }
        }
        Err(_) => Parsed::Skip,
    }
}

struct DeltaState {
    lines: SseStream,
    finished: bool,
    saw_finish: bool,
}

/// Turn the raw upstream SSE line stream into text fragments. The stream always
/// terminates: a connection that closes before `[DONE]` (and without a
/// `finish_reason`) yields a final transport error.
fn text_deltas(lines: SseStream) -> TextStream {
    let state = DeltaState {
        lines,
        finished: false,
        saw_finish: false,
    };
    let stream = futures::stream::unfold(state, |mut st| async move {
        if st.finished {
            return None;
        }
        loop {
            match st.lines.next().await {
                None => {
                    st.finished = true;
                    if st.saw_finish {
                        return None;
                    }
                    let err = RelayError::Transport("upstream closed before completion".into());
                    return Some((Err(err), st));
                }
                Some(Err(e)) => {
                    st.finished = true;
                    return Some((Err(e), st));
                }
                Some(Ok(SseLine { line })) => match parse_line(&line) {
                    Parsed::Skip => continue,
                    Parsed::Done => {
                        st.finished = true;
                        return None;
                    }
                    Parsed::Error(message) => {
                        st.finished = true;
                        let err = RelayError::Upstream {
                            status: None,
                            message,
                        };
                        return Some((Err(err), st));
                    }
                    Parsed::Chunk { text, finished } => {
                        st.saw_finish |= finished;
                        if let Some(text) = text {
                            return Some((Ok(text), st));
                        }
                    }
                },
            }
        }
    });
    Box::pin(stream)
}

#[async_trait]
impl ChatProvider for OpenAI {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, req: ResolvedRequest) -> CoreResult<ChatResult> {
        let payload = OAChatReq {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            stream: false,
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let (resp, provider_id, latency_ms) = self
            .http
            .post_json::<_, OAChatResp>(&self.url(), &payload, &hdrs)
            .await?;
        tracing::debug!(
            provider = %self.name,
            model = %req.model,
            provider_request_id = ?provider_id,
            latency_ms,
            "completion received"
        );

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();
        let usage = resp.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(ChatResult {
            id: resp.id,
            created: resp.created.unwrap_or_else(Self::now_secs),
            model: resp.model.unwrap_or(req.model),
            content,
            usage,
        })
    }

    async fn stream_complete(&self, req: ResolvedRequest) -> CoreResult<TextStream> {
        let payload = OAChatReq {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            stream: true,
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let lines = self.http.post_sse_lines(&self.url(), &payload, &hdrs).await?;
        tracing::debug!(provider = %self.name, model = %req.model, "upstream stream opened");
        Ok(text_deltas(lines))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use crate::model::Role;

    fn req() -> ResolvedRequest {
        ResolvedRequest {
            model: "gpt-4o-mini".into(),
            messages: vec![ChatMessage::new(Role::User, "Hi")],
            temperature: 0.4,
        }
    }

    async fn collect(stream: TextStream) -> Vec<CoreResult<String>> {
        stream.collect().await
    }

    #[tokio::test]
    async fn complete_200_maps_fields() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());

        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("Authorization", "Bearer test-key")
                .json_body(json!({
                    "model": "gpt-4o-mini",
                    "messages": [{"role": "user", "content": "Hi"}],
                    "temperature": 0.4
                }));
            then.status(200).json_body(json!({
                "id": "cmpl_123",
                "created": 1_700_000_000,
                "model": "gpt-4o-mini-2024",
                "choices": [{
                    "message": {"role":"assistant", "content":"Hello!"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
            }));
        });

        let resp = provider.complete(req()).await.expect("chat ok");
        m.assert();
        assert_eq!(resp.id, "cmpl_123");
        assert_eq!(resp.created, 1_700_000_000);
        assert_eq!(resp.model, "gpt-4o-mini-2024");
        assert_eq!(resp.content, "Hello!");
        let usage = resp.usage.expect("usage");
        assert_eq!(usage.prompt_tokens, Some(10));
        assert_eq!(usage.total_tokens, Some(15));
    }

    #[tokio::test]
    async fn complete_empty_choices_yields_empty_content() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({"id": "cmpl_empty", "choices": []}));
        });
        let resp = provider.complete(req()).await.expect("chat ok");
        assert_eq!(resp.content, "");
        assert_eq!(resp.model, "gpt-4o-mini");
        assert!(resp.usage.is_none());
    }

    #[tokio::test]
    async fn complete_401_is_upstream_error() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(401)
                .json_body(json!({"error": {"message": "Incorrect API key provided"}}));
        });
        let err = provider.complete(req()).await.unwrap_err();
        match err {
            RelayError::Upstream { status, message } => {
                assert_eq!(status, Some(401));
                assert_eq!(message, "Incorrect API key provided");
            }
            other => panic!("expected Upstream, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn complete_network_error_is_transport() {
        let provider = OpenAI::new_for_tests("http://127.0.0.1:9");
        let err = provider.complete(req()).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
    }

    #[tokio::test]
    async fn stream_yields_content_deltas_in_order() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let body = concat!(
            ": keepalive\n\n",
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .json_body_partial(r#"{"stream": true}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        });

        let items = collect(provider.stream_complete(req()).await.unwrap()).await;
        m.assert();
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn stream_truncated_before_done_ends_with_transport_error() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .body("data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n");
        });

        let items = collect(provider.stream_complete(req()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "Hel");
        assert!(matches!(items[1], Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn stream_finish_reason_without_done_is_success() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"},\"finish_reason\":\"stop\"}]}\n\n",
            ));
        });
        let items = collect(provider.stream_complete(req()).await.unwrap()).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "ok");
    }

    #[tokio::test]
    async fn stream_in_band_error_is_upstream() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).body(concat!(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"error\":{\"message\":\"overloaded\"}}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n",
            ));
        });
        let items = collect(provider.stream_complete(req()).await.unwrap()).await;
        assert_eq!(items.len(), 2);
        match &items[1] {
            Err(RelayError::Upstream { status, message }) => {
                assert_eq!(*status, None);
                assert_eq!(message, "overloaded");
            }
            other => panic!("expected Upstream, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_rejected_before_start_is_error() {
        let server = MockServer::start();
        let provider = OpenAI::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(404)
                .json_body(json!({"error": {"message": "The model `nope` does not exist"}}));
        });
        let err = match provider.stream_complete(req()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, RelayError::Upstream { status: Some(404), .. }));
    }

    #[test]
    fn parse_line_classification() {
        assert_eq!(parse_line(""), Parsed::Skip);
        assert_eq!(parse_line(": ping"), Parsed::Skip);
        assert_eq!(parse_line("event: message"), Parsed::Skip);
        assert_eq!(parse_line("data: [DONE]"), Parsed::Done);
        assert_eq!(parse_line("data: {not json"), Parsed::Skip);
        assert_eq!(
            parse_line(r#"data:{"choices":[{"delta":{"content":"x"}}]}"#),
            Parsed::Chunk {
                text: Some("x".into()),
                finished: false
            }
        );
    }
}
