use thiserror::Error;

/// Core error type for chatrelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or out-of-range client input. `field` is a path like `messages[1].content`.
    #[error("validation failed: {field}: {message}")]
    Validation { field: String, message: String },

    /// The provider rejected the request or reported an error mid-stream.
    #[error("upstream error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Upstream {
        status: Option<u16>,
        message: String,
    },

    /// Network to the provider (or to the gateway) was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// A submission arrived while another exchange is still pending.
    #[error("an exchange is already in flight for this conversation")]
    Busy,

    #[error("stream timed out after {0}s")]
    Timeout(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Short label used for log fields and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::Upstream { .. } => "upstream",
            Self::Transport(_) => "transport",
            Self::Busy => "busy",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }

    /// Text placed in the `{"error":{"message":..}}` payload sent to clients.
    /// Internal failures are not described beyond a generic message.
    pub fn client_message(&self) -> String {
        match self {
            Self::Io(_) | Self::Other(_) | Self::Config(_) => "request failed".to_string(),
            other => other.to_string(),
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;
