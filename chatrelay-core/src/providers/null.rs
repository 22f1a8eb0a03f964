use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::{ChatResult, ResolvedRequest, Role, Usage};
use crate::provider::ChatProvider;
use crate::stream::TextStream;

/// Offline provider that echoes the last user message back.
/// Handy for local development and for exercising the relay without credentials.
#[derive(Debug, Clone, Default)]
pub struct NullProvider;

impl NullProvider {
    fn reply_for(req: &ResolvedRequest) -> String {
        let last_user = req
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        format!("You said: {last_user}")
    }

    fn words(s: &str) -> u32 {
        s.split_whitespace().count() as u32
    }
}

#[async_trait]
impl ChatProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn complete(&self, req: ResolvedRequest) -> CoreResult<ChatResult> {
        let content = Self::reply_for(&req);
        let prompt = req.messages.iter().map(|m| Self::words(&m.content)).sum::<u32>();
        let completion = Self::words(&content);
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        Ok(ChatResult {
            id: format!("null-{created}"),
            created,
            model: req.model,
            content,
            usage: Some(Usage {
                prompt_tokens: Some(prompt),
                completion_tokens: Some(completion),
                total_tokens: Some(prompt + completion),
            }),
        })
    }

    async fn stream_complete(&self, req: ResolvedRequest) -> CoreResult<TextStream> {
        let fragments: Vec<CoreResult<String>> = Self::reply_for(&req)
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(futures::stream::iter(fragments)))
    }
}
