use async_trait::async_trait;

use crate::model::MessageRef;

/// A message ready for the wire: plain text plus transport-specific extras
/// (entity offsets, reply markup) carried as a JSON object.
#[derive(Debug, Clone, Default)]
pub struct RenderedMessage {
    pub text: String,
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RenderedMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: serde_json::Value) -> Self {
        self.extra.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub reply_to: Option<MessageRef>,
    pub notify: bool,
    pub thread_id: Option<i64>,
}

impl SendOptions {
    pub fn reply(reply_to: MessageRef, thread_id: Option<i64>) -> Self {
        Self {
            reply_to: Some(reply_to),
            notify: true,
            thread_id,
        }
    }
}

/// Outbound side of the chat service, as seen by the run orchestrator.
///
/// Implementations suppress transient wire errors: a failed call returns
/// `None` after logging, and the caller decides whether that matters.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        channel_id: i64,
        message: &RenderedMessage,
        options: Option<&SendOptions>,
    ) -> Option<MessageRef>;

    /// Edit a previously sent message. With `wait == false` the
    /// implementation may fire the request without awaiting the response;
    /// it then returns the original ref.
    async fn edit(
        &self,
        message_ref: MessageRef,
        message: &RenderedMessage,
        wait: bool,
    ) -> Option<MessageRef>;

    async fn delete(&self, message_ref: MessageRef) -> bool;

    async fn send_document(
        &self,
        channel_id: i64,
        filename: &str,
        content: Vec<u8>,
        reply_to: Option<MessageRef>,
        thread_id: Option<i64>,
    ) -> Option<MessageRef>;

    async fn close(&self);
}
