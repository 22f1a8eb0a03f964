use async_trait::async_trait;
use serde::Deserialize;

use crate::config::HttpCfg;
use crate::error::CoreResult;
use crate::http_client::HttpClient;
use crate::model::{ChatRequest, ChatResult};
use crate::relay::decode_stream;
use crate::session::ChatTransport;
use crate::stream::EventStream;

/// HTTP client for a running gateway.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: HttpClient,
    base: String,
}

#[derive(Debug, Deserialize)]
struct Health {
    #[serde(default)]
    ok: bool,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, http: &HttpCfg) -> CoreResult<Self> {
        let base = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http: HttpClient::new(http)?,
            base,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    /// `GET /health`.
    pub async fn health(&self) -> CoreResult<bool> {
        let url = format!("{}/health", self.base);
        let h: Health = self.http.get_json(&url).await?;
        Ok(h.ok)
    }
}

#[async_trait]
impl ChatTransport for RelayClient {
    async fn send(&self, req: &ChatRequest) -> CoreResult<ChatResult> {
        let url = format!("{}/api/chat", self.base);
        let (result, _, latency_ms) = self.http.post_json::<_, ChatResult>(&url, req, &[]).await?;
        tracing::debug!(latency_ms, model = %result.model, "chat reply received");
        Ok(result)
    }

    async fn stream(&self, req: &ChatRequest) -> CoreResult<EventStream> {
        let url = format!("{}/api/chat/stream", self.base);
        let bytes = self
            .http
            .post_stream(&url, req, &[], "text/event-stream")
            .await?;
        Ok(decode_stream(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use crate::model::{ChatMessage, Role};
    use crate::stream::RelayEvent;
    use futures::StreamExt;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    fn client(server: &MockServer) -> RelayClient {
        RelayClient::new(format!("{}/", server.base_url()), &HttpCfg::default()).unwrap()
    }

    fn req() -> ChatRequest {
        ChatRequest::new(vec![ChatMessage::new(Role::User, "hi")])
    }

    #[tokio::test]
    async fn send_posts_request_and_parses_result() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .json_body(json!({"messages": [{"role": "user", "content": "hi"}]}));
            then.status(200).json_body(json!({
                "id": "cmpl_1",
                "created": 1_700_000_000,
                "model": "gpt-4o-mini",
                "content": "Hello",
                "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
            }));
        });

        let res = client(&server).send(&req()).await.unwrap();
        m.assert();
        assert_eq!(res.content, "Hello");
        assert_eq!(res.usage.and_then(|u| u.total_tokens), Some(4));
    }

    #[tokio::test]
    async fn send_maps_error_body_to_upstream() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(400)
                .json_body(json!({"error": {"message": "validation failed: temperature: must be within [0, 2]"}}));
        });

        match client(&server).send(&req()).await.unwrap_err() {
            RelayError::Upstream { status, message } => {
                assert_eq!(status, Some(400));
                assert!(message.contains("temperature"));
            }
            other => panic!("expected Upstream, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_decodes_frames() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/api/chat/stream")
                .header("accept", "text/event-stream");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    ": keepalive\n\n",
                    "data: {\"delta\":\"Hel\"}\n\n",
                    "data: {\"delta\":\"lo\"}\n\n",
                    "data: {\"done\":true}\n\n",
                ));
        });

        let events: Vec<RelayEvent> = client(&server).stream(&req()).await.unwrap().collect().await;
        m.assert();
        assert_eq!(
            events,
            vec![
                RelayEvent::Delta("Hel".into()),
                RelayEvent::Delta("lo".into()),
                RelayEvent::Completed
            ]
        );
    }

    #[tokio::test]
    async fn stream_cut_short_ends_failed() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/chat/stream");
            then.status(200).body("data: {\"delta\":\"Hel\"}\n\ndata: {\"del");
        });

        let events: Vec<RelayEvent> = client(&server).stream(&req()).await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], RelayEvent::Delta("Hel".into()));
        assert!(matches!(events[1], RelayEvent::Failed(_)));
    }

    #[tokio::test]
    async fn stream_rejected_status_is_error() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/chat/stream");
            then.status(429)
                .header("retry-after", "30")
                .json_body(json!({"error": {"message": "too many requests"}}));
        });

        let err = match client(&server).stream(&req()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        match err {
            RelayError::Upstream { status, message } => {
                assert_eq!(status, Some(429));
                assert_eq!(message, "too many requests (retry after 30s)");
            }
            other => panic!("expected Upstream, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_gives_up_when_headers_never_arrive() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/api/chat/stream");
            then.status(200)
                .delay(std::time::Duration::from_secs(3))
                .body("data: {\"done\":true}\n\n");
        });
        let cfg = HttpCfg {
            request_timeout_ms: 200,
            ..HttpCfg::default()
        };
        let c = RelayClient::new(server.base_url(), &cfg).unwrap();

        match c.stream(&req()).await {
            Err(RelayError::Transport(m)) => assert!(m.contains("200ms"), "{m}"),
            Err(other) => panic!("expected Transport, got: {:?}", other),
            Ok(_) => panic!("expected header timeout"),
        }
    }

    #[tokio::test]
    async fn unreachable_gateway_is_transport() {
        let c = RelayClient::new("http://127.0.0.1:9", &HttpCfg::default()).unwrap();
        assert!(matches!(c.send(&req()).await, Err(RelayError::Transport(_))));
        assert!(matches!(c.health().await, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn health_reads_ok_flag() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).json_body(json!({"ok": true}));
        });
        assert!(client(&server).health().await.unwrap());
    }
}
