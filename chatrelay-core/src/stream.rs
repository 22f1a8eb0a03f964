//! Streaming primitives shared by the relay encoder, decoder and session.
//!
//! Contract:
//! - A relay stream carries 0..n `Delta` events followed by exactly one terminal
//!   event: `Completed` or `Failed`.
//! - `Delta` payloads are non-empty; their concatenation is the assistant message.
//! - After a terminal event, no further events are emitted.

use crate::error::CoreResult;

/// One semantic event of a relayed chat stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// Incremental assistant text. Never empty.
    Delta(String),
    /// Successful end of stream.
    Completed,
    /// Abnormal end of stream; replaces `Completed`.
    Failed(String),
}

impl RelayEvent {
    /// Returns true if this event terminates the stream (`Completed` or `Failed`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    /// Convenience accessor for `Delta` contents.
    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::Delta(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Text fragments from an upstream adapter. Ends with `None` on success or a
/// final `Err` item on failure.
pub type TextStream = futures::stream::BoxStream<'static, CoreResult<String>>;

/// Decoded relay events as seen by client code.
pub type EventStream = futures::stream::BoxStream<'static, RelayEvent>;
