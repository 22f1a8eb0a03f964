use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Client-supplied request, as accepted by both gateway entry points.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: None,
            temperature: None,
            stream: None,
        }
    }
}

/// A request with every default filled in. This is what upstream adapters receive.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
}

/// Non-streaming completion result.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatResult {
    pub id: String,
    /// Unix timestamp in seconds.
    pub created: i64,
    pub model: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Error payload shared by the JSON endpoint and the stream's error frame.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_json_lowercase() {
        let json = r#"{"role":"assistant","content":"ok"}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.role, Role::Assistant);
        let back = serde_json::to_string(&msg).unwrap();
        assert!(back.contains("\"assistant\""));
        assert_eq!(Role::parse("tool"), None);
    }

    #[test]
    fn chat_result_omits_missing_usage() {
        let res = ChatResult {
            id: "cmpl_1".into(),
            created: 1_700_000_000,
            model: "gpt-4o-mini".into(),
            content: "hi".into(),
            usage: None,
        };
        let v = serde_json::to_value(&res).unwrap();
        assert!(v.get("usage").is_none());
        assert_eq!(v["created"], 1_700_000_000);
    }

    #[test]
    fn request_skips_unset_options() {
        let req = ChatRequest::new(vec![ChatMessage::new(Role::User, "hi")]);
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(s, r#"{"messages":[{"role":"user","content":"hi"}]}"#);
    }

    #[test]
    fn error_body_shape() {
        let v = serde_json::to_value(ErrorBody::new("nope")).unwrap();
        assert_eq!(v, serde_json::json!({"error": {"message": "nope"}}));
    }
}
