use std::convert::Infallible;
use std::time::Instant;

use axum::Json;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use serde_json::{Value, json};
use tracing_futures::Instrument;

use super::AppState;
use crate::error::{CoreResult, RelayError};
use crate::model::{ChatRequest, ChatResult, ErrorBody};
use crate::relay::{RelayOptions, relay, relay_opening};
use crate::telemetry::{self, ExchangeLog, Outcome};
use crate::validator::{resolve, validate};

pub(crate) const CHAT_ROUTE: &str = "/api/chat";
pub(crate) const STREAM_ROUTE: &str = "/api/chat/stream";

/// Error returned from JSON handlers; rendered as `ErrorBody`.
#[derive(Debug)]
pub struct ApiError(pub RelayError);

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Io(_) | RelayError::Other(_) | RelayError::Config(_) => {
                tracing::error!(error = %self.0, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorBody::new(self.0.client_message()))).into_response()
    }
}

/// Parse and validate a raw request body. Malformed JSON is a validation error.
fn parse_request(body: &[u8]) -> CoreResult<ChatRequest> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::validation("body", format!("malformed JSON: {e}")))?;
    validate(&value)
}

pub async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

pub async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Json<ChatResult>, ApiError> {
    let started = Instant::now();
    let mut model = None;
    let result = async {
        let req = parse_request(&body)?;
        let resolved = resolve(&req, &state.upstream);
        model = Some(resolved.model.clone());
        state.provider.complete(resolved).await
    }
    .await;

    let latency_ms = started.elapsed().as_millis() as u64;
    match result {
        Ok(res) => {
            let usage = res.usage.unwrap_or_default();
            telemetry::emit(
                ExchangeLog::new(CHAT_ROUTE, Outcome::Completed)
                    .model(&res.model)
                    .chars(res.content.chars().count() as u64)
                    .latency_ms(latency_ms)
                    .tokens(usage.prompt_tokens, usage.completion_tokens, usage.total_tokens),
            );
            Ok(Json(res))
        }
        Err(e) => {
            tracing::warn!(error = %e, kind = e.kind(), "chat failed");
            let mut log = ExchangeLog::new(CHAT_ROUTE, Outcome::Failed)
                .latency_ms(latency_ms)
                .error(e.kind(), &e.client_message());
            if let Some(m) = &model {
                log = log.model(m);
            }
            telemetry::emit(log);
            Err(ApiError(e))
        }
    }
}

/// Streaming endpoint. Always answers 200 with an event stream; failures before
/// the first delta (validation included) arrive as a single error frame.
pub async fn chat_stream(State(state): State<AppState>, body: Bytes) -> Response {
    let opts = |model: String| RelayOptions::new(model, state.upstream.max_stream_duration());
    let (model, frames) = match parse_request(&body) {
        Ok(req) => {
            let resolved = resolve(&req, &state.upstream);
            let model = resolved.model.clone();
            let provider = state.provider.clone();
            let open = async move { provider.stream_complete(resolved).await };
            (model.clone(), relay_opening(open, opts(model)))
        }
        Err(e) => {
            let model = state.upstream.default_model.clone();
            (model.clone(), relay(Err(e), opts(model)))
        }
    };

    let span = tracing::info_span!("relay", provider = state.provider.name(), model = %model);
    let frames = frames.map(Ok::<_, Infallible>).instrument(span);

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(frames),
    )
        .into_response()
}
