use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::{ChatResult, ResolvedRequest};
use crate::stream::TextStream;

/// Upstream completion adapter. The only component that holds provider credentials.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    /// One-shot completion.
    async fn complete(&self, req: ResolvedRequest) -> CoreResult<ChatResult>;

    /// Streaming completion: a finite, non-restartable sequence of text
    /// fragments. Once the stream yields, it always ends either with `None`
    /// (normal completion) or with a final `Err` item.
    async fn stream_complete(&self, req: ResolvedRequest) -> CoreResult<TextStream> {
        // default: call complete once and emit its content as a single fragment
        let single = self.complete(req).await?;
        let items = if single.content.is_empty() {
            vec![]
        } else {
            vec![Ok(single.content)]
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChatMessage, Role};
    use futures::StreamExt;

    struct Fixed;

    #[async_trait]
    impl ChatProvider for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn complete(&self, req: ResolvedRequest) -> CoreResult<ChatResult> {
            Ok(ChatResult {
                id: "fixed-1".into(),
                created: 0,
                model: req.model,
                content: "whole answer".into(),
                usage: None,
            })
        }
    }

    #[tokio::test]
    async fn default_stream_wraps_complete() {
        let req = ResolvedRequest {
            model: "m".into(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            temperature: 0.4,
        };
        let items: Vec<String> = Fixed
            .stream_complete(req)
            .await
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(items, vec!["whole answer".to_string()]);
    }
}
