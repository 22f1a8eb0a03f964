//! Request validation shared by the JSON and streaming entry points.

use serde_json::{Map, Value};

use crate::config::UpstreamCfg;
use crate::error::{CoreResult, RelayError};
use crate::model::{ChatMessage, ChatRequest, ResolvedRequest, Role};
use crate::normalizer::{clean_text, is_blank};

pub const MIN_TEMPERATURE: f64 = 0.0;
pub const MAX_TEMPERATURE: f64 = 2.0;

/// Validate an arbitrary JSON value into a well-formed [`ChatRequest`].
///
/// Message content is normalized (NFC, BOM, CRLF) before the emptiness check.
/// The error names the first offending field.
pub fn validate(value: &Value) -> CoreResult<ChatRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| RelayError::validation("body", "expected a JSON object"))?;

    let messages = validate_messages(obj)?;

    let model = match present(obj, "model") {
        None => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(RelayError::validation("model", "expected a string")),
    };

    let temperature = match present(obj, "temperature") {
        None => None,
        Some(v) => {
            let t = v
                .as_f64()
                .ok_or_else(|| RelayError::validation("temperature", "expected a number"))?;
            if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&t) {
                return Err(RelayError::validation(
                    "temperature",
                    format!("must be within [{MIN_TEMPERATURE}, {MAX_TEMPERATURE}], got {t}"),
                ));
            }
            Some(t as f32)
        }
    };

    let stream = match present(obj, "stream") {
        None => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(_) => return Err(RelayError::validation("stream", "expected a boolean")),
    };

    Ok(ChatRequest {
        messages,
        model,
        temperature,
        stream,
    })
}

/// Fill in the configured defaults for model and temperature.
pub fn resolve(req: &ChatRequest, upstream: &UpstreamCfg) -> ResolvedRequest {
    ResolvedRequest {
        model: req
            .model
            .clone()
            .unwrap_or_else(|| upstream.default_model.clone()),
        messages: req.messages.clone(),
        temperature: req.temperature.unwrap_or(upstream.default_temperature),
    }
}

/// Treats an explicit `null` the same as an absent field.
fn present<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    obj.get(key).filter(|v| !v.is_null())
}

fn validate_messages(obj: &Map<String, Value>) -> CoreResult<Vec<ChatMessage>> {
    let raw = present(obj, "messages")
        .ok_or_else(|| RelayError::validation("messages", "is required"))?
        .as_array()
        .ok_or_else(|| RelayError::validation("messages", "expected an array"))?;
    if raw.is_empty() {
        return Err(RelayError::validation(
            "messages",
            "must contain at least one message",
        ));
    }

    let mut out = Vec::with_capacity(raw.len());
    for (i, entry) in raw.iter().enumerate() {
        let entry = entry
            .as_object()
            .ok_or_else(|| RelayError::validation(format!("messages[{i}]"), "expected an object"))?;

        let role = match entry.get("role") {
            Some(Value::String(s)) => Role::parse(s).ok_or_else(|| {
                RelayError::validation(
                    format!("messages[{i}].role"),
                    format!("unknown role '{s}' (expected system, user or assistant)"),
                )
            })?,
            _ => {
                return Err(RelayError::validation(
                    format!("messages[{i}].role"),
                    "expected one of system, user, assistant",
                ));
            }
        };

        let content = match entry.get("content") {
            Some(Value::String(s)) => clean_text(s),
            _ => {
                return Err(RelayError::validation(
                    format!("messages[{i}].content"),
                    "expected a string",
                ));
            }
        };
        if is_blank(&content) {
            return Err(RelayError::validation(
                format!("messages[{i}].content"),
                "must not be empty",
            ));
        }

        out.push(ChatMessage { role, content });
    }
    Ok(out)
}
