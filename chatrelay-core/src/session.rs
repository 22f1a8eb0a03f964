//! Client-side conversation state and the one-exchange-at-a-time controller.
//!
//! A `Session` owns the conversation. `submit` appends the user turn (and, when
//! streaming, an empty assistant placeholder) and hands back an `Exchange`;
//! running the exchange merges relay events into the placeholder. Only one
//! exchange may be pending at a time.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::{AbortHandle, AbortRegistration, Abortable};

use crate::error::{CoreResult, RelayError};
use crate::model::{ChatMessage, ChatRequest, ChatResult, Role, Usage};
use crate::relay::decoder::UNEXPECTED_END;
use crate::stream::{EventStream, RelayEvent};

/// How the session talks to a gateway.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// One-shot completion (`POST /api/chat`).
    async fn send(&self, req: &ChatRequest) -> CoreResult<ChatResult>;

    /// Streaming completion (`POST /api/chat/stream`), already decoded.
    async fn stream(&self, req: &ChatRequest) -> CoreResult<EventStream>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Streaming,
    Blocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStatus {
    Complete,
    /// Assistant reply still arriving.
    Pending,
    /// Assistant reply cut short by a failure or a cancel; content is partial.
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub message: ChatMessage,
    pub status: TurnStatus,
}

impl Turn {
    fn complete(role: Role, content: impl Into<String>) -> Self {
        Self {
            message: ChatMessage::new(role, content),
            status: TurnStatus::Complete,
        }
    }
}

#[derive(Debug, Default)]
struct SessionState {
    turns: Vec<Turn>,
    pending: bool,
    last_usage: Option<Usage>,
}

impl SessionState {
    fn placeholder_mut(&mut self) -> Option<&mut Turn> {
        self.turns
            .iter_mut()
            .rev()
            .find(|t| t.status == TurnStatus::Pending)
    }
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// One conversation against one transport.
pub struct Session<T> {
    transport: Arc<T>,
    state: Arc<Mutex<SessionState>>,
    mode: Mode,
    model: Option<String>,
    temperature: Option<f32>,
}

impl<T: ChatTransport + 'static> Session<T> {
    pub fn new(transport: T, system_prompt: Option<String>) -> Self {
        let mut state = SessionState::default();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            state.turns.push(Turn::complete(Role::System, prompt));
        }
        Self {
            transport: Arc::new(transport),
            state: Arc::new(Mutex::new(state)),
            mode: Mode::default(),
            model: None,
            temperature: None,
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    /// Model override; `None` lets the gateway pick its default.
    pub fn set_model(&mut self, model: Option<String>) {
        self.model = model;
    }

    pub fn set_temperature(&mut self, temperature: Option<f32>) {
        self.temperature = temperature;
    }

    /// Snapshot of the conversation, system prompt included.
    pub fn turns(&self) -> Vec<Turn> {
        lock(&self.state).turns.clone()
    }

    /// Turns shown to a reader: everything but the system prompt.
    pub fn visible_turns(&self) -> Vec<Turn> {
        lock(&self.state)
            .turns
            .iter()
            .filter(|t| t.message.role != Role::System)
            .cloned()
            .collect()
    }

    /// Messages that would be sent upstream now. Empty placeholders are left out.
    pub fn request_messages(&self) -> Vec<ChatMessage> {
        request_messages_of(&lock(&self.state))
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.state).pending
    }

    /// Usage reported by the last successful blocking exchange.
    pub fn last_usage(&self) -> Option<Usage> {
        lock(&self.state).last_usage
    }

    /// Start a new exchange for `user_text`.
    ///
    /// Fails with `Validation` for blank input and with `Busy` while another
    /// exchange is pending; in both cases the conversation is left untouched.
    pub fn submit(&self, user_text: &str) -> CoreResult<Exchange<T>> {
        let content = user_text.trim();
        if content.is_empty() {
            return Err(RelayError::validation("content", "must not be empty"));
        }

        let mut state = lock(&self.state);
        if state.pending {
            tracing::debug!("submit rejected: exchange in flight");
            return Err(RelayError::Busy);
        }
        state.turns.push(Turn::complete(Role::User, content));
        let request = ChatRequest {
            messages: request_messages_of(&state),
            model: self.model.clone(),
            temperature: self.temperature,
            stream: Some(self.mode == Mode::Streaming),
        };
        if self.mode == Mode::Streaming {
            state.turns.push(Turn {
                message: ChatMessage::new(Role::Assistant, ""),
                status: TurnStatus::Pending,
            });
        }
        state.pending = true;
        state.last_usage = None;
        drop(state);

        let (abort, registration) = AbortHandle::new_pair();
        Ok(Exchange {
            transport: self.transport.clone(),
            state: self.state.clone(),
            request,
            mode: self.mode,
            abort,
            registration: Some(registration),
            settled: false,
        })
    }
}

fn request_messages_of(state: &SessionState) -> Vec<ChatMessage> {
    state
        .turns
        .iter()
        .filter(|t| !t.message.content.is_empty())
        .map(|t| t.message.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// Full assistant reply.
    Completed(String),
    /// Cancelled via the abort handle; partial content stays marked incomplete.
    Cancelled,
}

enum Settle {
    Completed(String),
    Failed,
    Cancelled,
}

/// One in-flight request/response cycle of a `Session`.
///
/// Dropping an exchange before it finishes settles it as cancelled.
pub struct Exchange<T> {
    transport: Arc<T>,
    state: Arc<Mutex<SessionState>>,
    request: ChatRequest,
    mode: Mode,
    abort: AbortHandle,
    registration: Option<AbortRegistration>,
    settled: bool,
}

impl<T: ChatTransport + 'static> Exchange<T> {
    /// The request this exchange sends.
    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    /// Handle that cancels this exchange from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn cancel(&self) {
        self.abort.abort();
    }

    /// Drive the exchange to its end, calling `on_delta` for each streamed
    /// fragment as it is merged into the conversation.
    pub async fn run<F>(mut self, mut on_delta: F) -> CoreResult<ExchangeOutcome>
    where
        F: FnMut(&str) + Send,
    {
        let Some(registration) = self.registration.take() else {
            return Err(RelayError::Other(anyhow::anyhow!("exchange already started")));
        };
        let result = Abortable::new(self.drive(&mut on_delta), registration).await;
        match result {
            Ok(Ok(content)) => {
                self.settle(Settle::Completed(content.clone()));
                Ok(ExchangeOutcome::Completed(content))
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "exchange failed");
                self.settle(Settle::Failed);
                Err(e)
            }
            Err(_aborted) => {
                tracing::debug!("exchange cancelled");
                self.settle(Settle::Cancelled);
                Ok(ExchangeOutcome::Cancelled)
            }
        }
    }

    async fn drive<F>(&self, on_delta: &mut F) -> CoreResult<String>
    where
        F: FnMut(&str) + Send,
    {
        match self.mode {
            Mode::Blocking => {
                let result = self.transport.send(&self.request).await?;
                lock(&self.state).last_usage = result.usage;
                Ok(result.content)
            }
            Mode::Streaming => {
                let mut events = self.transport.stream(&self.request).await?;
                while let Some(event) = events.next().await {
                    match event {
                        RelayEvent::Delta(text) => {
                            if let Some(turn) = lock(&self.state).placeholder_mut() {
                                turn.message.content.push_str(&text);
                            }
                            on_delta(&text);
                        }
                        RelayEvent::Completed => {
                            let mut state = lock(&self.state);
                            let content = state
                                .placeholder_mut()
                                .map(|t| t.message.content.clone())
                                .unwrap_or_default();
                            return Ok(content);
                        }
                        RelayEvent::Failed(message) => return Err(stream_failure(message)),
                    }
                }
                Err(RelayError::Transport(UNEXPECTED_END.to_string()))
            }
        }
    }
}

/// Recover the error kind from a failure frame's message. Messages that match
/// no known form are reported as upstream errors.
fn stream_failure(message: String) -> RelayError {
    if message == UNEXPECTED_END {
        return RelayError::Transport(message);
    }
    if let Some(rest) = message.strip_prefix("transport error: ") {
        return RelayError::Transport(rest.to_string());
    }
    if let Some(secs) = message
        .strip_prefix("stream timed out after ")
        .and_then(|rest| rest.strip_suffix('s'))
        .and_then(|n| n.parse().ok())
    {
        return RelayError::Timeout(secs);
    }
    RelayError::Upstream {
        status: None,
        message,
    }
}

impl<T> Exchange<T> {
    fn settle(&mut self, how: Settle) {
        if self.settled {
            return;
        }
        self.settled = true;
        let mut state = lock(&self.state);
        state.pending = false;
        match self.mode {
            Mode::Streaming => {
                let Some(idx) = state
                    .turns
                    .iter()
                    .rposition(|t| t.status == TurnStatus::Pending)
                else {
                    return;
                };
                if state.turns[idx].message.content.is_empty() {
                    state.turns.remove(idx);
                } else {
                    state.turns[idx].status = match how {
                        Settle::Completed(_) => TurnStatus::Complete,
                        Settle::Failed | Settle::Cancelled => TurnStatus::Incomplete,
                    };
                }
            }
            Mode::Blocking => {
                if let Settle::Completed(content) = how
                    && !content.is_empty()
                {
                    state.turns.push(Turn::complete(Role::Assistant, content));
                }
            }
        }
    }
}

impl<T> Drop for Exchange<T> {
    fn drop(&mut self) {
        // Not run to completion: release the conversation and keep any partial text.
        self.settle(Settle::Cancelled);
    }
}
