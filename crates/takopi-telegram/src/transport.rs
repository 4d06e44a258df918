//! [`Transport`] implementation over the Bot API client.

use async_trait::async_trait;

use takopi_core::model::MessageRef;
use takopi_core::transport::{RenderedMessage, SendOptions, Transport};

use crate::api::BotClient;

pub struct TelegramTransport {
    bot: BotClient,
}

impl TelegramTransport {
    pub fn new(bot: BotClient) -> Self {
        Self { bot }
    }
}

fn message_ref_from(chat_id: i64, payload: &serde_json::Value) -> Option<MessageRef> {
    let message_id = payload.get("message_id")?.as_i64()?;
    Some(MessageRef::new(chat_id, message_id))
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(
        &self,
        channel_id: i64,
        message: &RenderedMessage,
        options: Option<&SendOptions>,
    ) -> Option<MessageRef> {
        let reply_to = options.and_then(|o| o.reply_to).map(|r| r.message_id);
        let disable_notification = options.map(|o| !o.notify);
        let thread_id = options.and_then(|o| o.thread_id);
        let sent = self
            .bot
            .send_message(
                channel_id,
                &message.text,
                reply_to,
                disable_notification,
                thread_id,
                message.extra.get("entities"),
                message.extra.get("reply_markup"),
            )
            .await?;
        message_ref_from(channel_id, &sent)
    }

    async fn edit(
        &self,
        message_ref: MessageRef,
        message: &RenderedMessage,
        wait: bool,
    ) -> Option<MessageRef> {
        let edited = self
            .bot
            .edit_message_text(
                message_ref.channel_id,
                message_ref.message_id,
                &message.text,
                message.extra.get("entities"),
                message.extra.get("reply_markup"),
                wait,
            )
            .await;
        match edited {
            Some(payload) => message_ref_from(message_ref.channel_id, &payload)
                .or(Some(message_ref)),
            // Elided round trip (wait == false) keeps the original ref.
            None if !wait => Some(message_ref),
            None => None,
        }
    }

    async fn delete(&self, message_ref: MessageRef) -> bool {
        self.bot
            .delete_message(message_ref.channel_id, message_ref.message_id)
            .await
    }

    async fn send_document(
        &self,
        channel_id: i64,
        filename: &str,
        content: Vec<u8>,
        reply_to: Option<MessageRef>,
        thread_id: Option<i64>,
    ) -> Option<MessageRef> {
        let sent = self
            .bot
            .send_document(
                channel_id,
                filename,
                content,
                reply_to.map(|r| r.message_id),
                thread_id,
            )
            .await?;
        message_ref_from(channel_id, &sent)
    }

    async fn close(&self) {}
}
