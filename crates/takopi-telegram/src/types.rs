//! Incoming update model.
//!
//! Raw `getUpdates` payloads are kept as `serde_json::Value` and narrowed
//! into [`TelegramIncomingMessage`] / [`TelegramCallbackQuery`] here. Only
//! message and callback_query updates survive; everything else is dropped
//! by the poller.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramVoice {
    pub file_id: String,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramDocument {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub file_size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramIncomingMessage {
    pub chat_id: i64,
    pub message_id: i64,
    pub thread_id: Option<i64>,
    pub is_topic_message: Option<bool>,
    pub text: String,
    pub reply_to_message_id: Option<i64>,
    pub reply_to_text: Option<String>,
    pub sender_id: Option<i64>,
    pub chat_type: Option<String>,
    pub is_forum: Option<bool>,
    pub media_group_id: Option<String>,
    pub voice: Option<TelegramVoice>,
    pub document: Option<TelegramDocument>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelegramCallbackQuery {
    pub chat_id: i64,
    pub message_id: i64,
    pub callback_query_id: String,
    pub data: Option<String>,
    pub sender_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelegramIncomingUpdate {
    Message(TelegramIncomingMessage),
    CallbackQuery(TelegramCallbackQuery),
}

fn as_i64(value: Option<&Value>) -> Option<i64> {
    value.and_then(Value::as_i64)
}

fn as_str(value: Option<&Value>) -> Option<String> {
    value.and_then(Value::as_str).map(str::to_string)
}

fn parse_voice(message: &Value) -> Option<TelegramVoice> {
    let voice = message.get("voice")?;
    Some(TelegramVoice {
        file_id: as_str(voice.get("file_id"))?,
        mime_type: as_str(voice.get("mime_type")),
        file_size: voice.get("file_size").and_then(Value::as_u64),
        duration: voice.get("duration").and_then(Value::as_u64),
    })
}

fn parse_document(message: &Value) -> Option<TelegramDocument> {
    let document = message.get("document")?;
    Some(TelegramDocument {
        file_id: as_str(document.get("file_id"))?,
        file_name: as_str(document.get("file_name")),
        mime_type: as_str(document.get("mime_type")),
        file_size: document.get("file_size").and_then(Value::as_u64),
    })
}

/// The largest `photo` size stands in for a document when photos arrive in a
/// media group.
fn parse_photo_as_document(message: &Value) -> Option<TelegramDocument> {
    let sizes = message.get("photo")?.as_array()?;
    let best = sizes.iter().max_by_key(|s| {
        s.get("file_size").and_then(Value::as_u64).unwrap_or(0)
    })?;
    Some(TelegramDocument {
        file_id: as_str(best.get("file_id"))?,
        file_name: None,
        mime_type: Some("image/jpeg".to_string()),
        file_size: best.get("file_size").and_then(Value::as_u64),
    })
}

/// Narrow one raw update. `allowed` filters by chat id; `None` means the
/// update is irrelevant (wrong chat, unsupported kind, no content).
pub fn parse_incoming_update(
    update: &Value,
    allowed: impl Fn(i64) -> bool,
) -> Option<TelegramIncomingUpdate> {
    if let Some(query) = update.get("callback_query") {
        let message = query.get("message")?;
        let chat_id = as_i64(message.get("chat").and_then(|c| c.get("id")))?;
        if !allowed(chat_id) {
            return None;
        }
        return Some(TelegramIncomingUpdate::CallbackQuery(TelegramCallbackQuery {
            chat_id,
            message_id: as_i64(message.get("message_id"))?,
            callback_query_id: as_str(query.get("id"))?,
            data: as_str(query.get("data")),
            sender_id: as_i64(query.get("from").and_then(|f| f.get("id"))),
        }));
    }

    let message = update.get("message")?;
    let chat = message.get("chat")?;
    let chat_id = as_i64(chat.get("id"))?;
    if !allowed(chat_id) {
        return None;
    }

    let text = as_str(message.get("text"))
        .or_else(|| as_str(message.get("caption")))
        .unwrap_or_default();
    let voice = parse_voice(message);
    let document = parse_document(message).or_else(|| parse_photo_as_document(message));
    if text.is_empty() && voice.is_none() && document.is_none() {
        return None;
    }

    let reply = message.get("reply_to_message");
    Some(TelegramIncomingUpdate::Message(TelegramIncomingMessage {
        chat_id,
        message_id: as_i64(message.get("message_id"))?,
        thread_id: as_i64(message.get("message_thread_id")),
        is_topic_message: message
            .get("is_topic_message")
            .and_then(Value::as_bool),
        text,
        reply_to_message_id: reply.and_then(|r| as_i64(r.get("message_id"))),
        reply_to_text: reply.and_then(|r| {
            as_str(r.get("text")).or_else(|| as_str(r.get("caption")))
        }),
        sender_id: as_i64(message.get("from").and_then(|f| f.get("id"))),
        chat_type: as_str(chat.get("type")),
        is_forum: chat.get("is_forum").and_then(Value::as_bool),
        media_group_id: as_str(message.get("media_group_id")),
        voice,
        document,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_chat(_: i64) -> bool {
        true
    }

    #[test]
    fn maps_message_fields() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "text": "hello",
                "chat": {"id": 123, "type": "supergroup", "is_forum": true},
                "from": {"id": 99},
                "reply_to_message": {"message_id": 5, "text": "prev"}
            }
        });
        let TelegramIncomingUpdate::Message(msg) =
            parse_incoming_update(&update, any_chat).unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(msg.chat_id, 123);
        assert_eq!(msg.message_id, 10);
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.reply_to_message_id, Some(5));
        assert_eq!(msg.reply_to_text.as_deref(), Some("prev"));
        assert_eq!(msg.sender_id, Some(99));
        assert_eq!(msg.thread_id, None);
        assert_eq!(msg.chat_type.as_deref(), Some("supergroup"));
        assert_eq!(msg.is_forum, Some(true));
        assert!(msg.voice.is_none());
        assert!(msg.document.is_none());
    }

    #[test]
    fn filters_non_matching_chat() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {"message_id": 10, "text": "hi", "chat": {"id": 123}}
        });
        assert!(parse_incoming_update(&update, |id| id == 999).is_none());
    }

    #[test]
    fn filters_contentless_messages() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": {"id": 123},
                "location": {"latitude": 1.0, "longitude": 2.0}
            }
        });
        assert!(parse_incoming_update(&update, any_chat).is_none());
    }

    #[test]
    fn voice_message() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": {"id": 123},
                "voice": {
                    "file_id": "voice-id",
                    "duration": 3,
                    "mime_type": "audio/ogg",
                    "file_size": 1234
                }
            }
        });
        let TelegramIncomingUpdate::Message(msg) =
            parse_incoming_update(&update, any_chat).unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(msg.text, "");
        let voice = msg.voice.unwrap();
        assert_eq!(voice.file_id, "voice-id");
        assert_eq!(voice.file_size, Some(1234));
    }

    #[test]
    fn document_with_caption() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "caption": "/file put incoming/doc.txt",
                "chat": {"id": 123},
                "document": {
                    "file_id": "doc-id",
                    "file_name": "doc.txt",
                    "mime_type": "text/plain",
                    "file_size": 4321
                }
            }
        });
        let TelegramIncomingUpdate::Message(msg) =
            parse_incoming_update(&update, any_chat).unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(msg.text, "/file put incoming/doc.txt");
        let document = msg.document.unwrap();
        assert_eq!(document.file_name.as_deref(), Some("doc.txt"));
    }

    #[test]
    fn photo_picks_largest_size() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "chat": {"id": 123},
                "media_group_id": "g1",
                "photo": [
                    {"file_id": "small", "file_size": 100},
                    {"file_id": "large", "file_size": 5000}
                ]
            }
        });
        let TelegramIncomingUpdate::Message(msg) =
            parse_incoming_update(&update, any_chat).unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(msg.media_group_id.as_deref(), Some("g1"));
        assert_eq!(msg.document.unwrap().file_id, "large");
    }

    #[test]
    fn callback_query() {
        let update = serde_json::json!({
            "update_id": 1,
            "callback_query": {
                "id": "q1",
                "data": "takopi:cancel",
                "from": {"id": 7},
                "message": {"message_id": 44, "chat": {"id": 123}}
            }
        });
        let TelegramIncomingUpdate::CallbackQuery(query) =
            parse_incoming_update(&update, any_chat).unwrap()
        else {
            panic!("expected callback query");
        };
        assert_eq!(query.message_id, 44);
        assert_eq!(query.data.as_deref(), Some("takopi:cancel"));
        assert_eq!(query.sender_id, Some(7));
    }

    #[test]
    fn forum_thread_id() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "message_thread_id": 77,
                "is_topic_message": true,
                "text": "hi",
                "chat": {"id": 123, "type": "supergroup", "is_forum": true}
            }
        });
        let TelegramIncomingUpdate::Message(msg) =
            parse_incoming_update(&update, any_chat).unwrap()
        else {
            panic!("expected message");
        };
        assert_eq!(msg.thread_id, Some(77));
        assert_eq!(msg.is_topic_message, Some(true));
    }
}
