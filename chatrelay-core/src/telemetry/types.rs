use serde::{Deserialize, Serialize};

/// How a relayed exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Failed,
    TimedOut,
    /// The client went away before a terminal frame was written.
    ClientDisconnected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::ClientDisconnected => "client_disconnected",
        }
    }
}

/// Structured, provider-agnostic record of one gateway exchange
/// (one `/api/chat` call or one relayed stream).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeLog {
    pub route: String,
    pub model: Option<String>,
    pub outcome: Outcome,
    /// Delta frames written (streaming only).
    pub deltas: u32,
    /// Characters of assistant text delivered.
    pub chars: u64,
    pub latency_ms: u64,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,
}

impl ExchangeLog {
    pub fn new(route: &str, outcome: Outcome) -> Self {
        Self {
            route: route.to_string(),
            model: None,
            outcome,
            deltas: 0,
            chars: 0,
            latency_ms: 0,
            error_kind: None,
            error_message: None,
            tokens_prompt: None,
            tokens_completion: None,
            tokens_total: None,
        }
    }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn deltas(mut self, n: u32, chars: u64) -> Self { self.deltas = n; self.chars = chars; self }
    pub fn chars(mut self, chars: u64) -> Self { self.chars = chars; self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = v; self }
    pub fn error(mut self, kind: &str, message: &str) -> Self {
        self.error_kind = Some(kind.to_string());
        self.error_message = Some(message.to_string());
        self
    }
    pub fn tokens(mut self, p: Option<u32>, c: Option<u32>, t: Option<u32>) -> Self {
        self.tokens_prompt = p; self.tokens_completion = c; self.tokens_total = t; self
    }
}
