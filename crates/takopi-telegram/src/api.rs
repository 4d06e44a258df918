//! Telegram Bot API client.
//!
//! Thin typed wrapper over the HTTP API. Calls return the raw `result`
//! payload as JSON; transient wire errors are logged and surface as `None`
//! so callers can decide what a lost call means. `get_updates` is the one
//! method that reports errors, because the poll loop backs off on them.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// `{ ok, result?, description? }` envelope every method returns.
#[derive(Debug, serde::Deserialize)]
struct ApiResponse {
    ok: bool,
    result: Option<Value>,
    description: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("telegram request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("telegram api error: {0}")]
    Api(String),
}

/// Extra seconds on top of the long-poll timeout before reqwest gives up.
const POLL_TIMEOUT_SLACK_S: u64 = 10;
const REQUEST_TIMEOUT_S: u64 = 60;

#[derive(Clone)]
pub struct BotClient {
    inner: Arc<BotClientInner>,
}

struct BotClientInner {
    http: Client,
    base_url: String,
    file_base_url: String,
}

impl BotClient {
    pub fn new(token: &str) -> Self {
        Self::with_base_url(token, "https://api.telegram.org")
    }

    /// Point at a different server (tests).
    pub fn with_base_url(token: &str, server: &str) -> Self {
        Self {
            inner: Arc::new(BotClientInner {
                http: Client::new(),
                base_url: format!("{server}/bot{token}"),
                file_base_url: format!("{server}/file/bot{token}"),
            }),
        }
    }

    async fn call_raw(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ApiError> {
        let url = format!("{}/{method}", self.inner.base_url);
        let response = self
            .inner
            .http
            .post(&url)
            .timeout(timeout)
            .json(&params)
            .send()
            .await?;
        let body: ApiResponse = response.json().await?;
        if !body.ok {
            return Err(ApiError::Api(
                body.description
                    .unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    /// Call a method, suppressing errors to `None`.
    async fn call(&self, method: &str, params: Value) -> Option<Value> {
        match self
            .call_raw(method, params, Duration::from_secs(REQUEST_TIMEOUT_S))
            .await
        {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(method, error = %e, "telegram call failed");
                None
            }
        }
    }

    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout_s: u64,
        allowed_updates: &[&str],
    ) -> Result<Vec<Value>, ApiError> {
        let mut params = json!({
            "timeout": timeout_s,
            "allowed_updates": allowed_updates,
        });
        if let Some(offset) = offset {
            params["offset"] = json!(offset);
        }
        let result = self
            .call_raw(
                "getUpdates",
                params,
                Duration::from_secs(timeout_s + POLL_TIMEOUT_SLACK_S),
            )
            .await?;
        match result {
            Value::Array(updates) => Ok(updates),
            other => {
                debug!(?other, "unexpected getUpdates payload");
                Ok(Vec::new())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
        disable_notification: Option<bool>,
        message_thread_id: Option<i64>,
        entities: Option<&Value>,
        reply_markup: Option<&Value>,
    ) -> Option<Value> {
        let mut params = json!({"chat_id": chat_id, "text": text});
        if let Some(reply_to) = reply_to_message_id {
            params["reply_parameters"] = json!({
                "message_id": reply_to,
                "allow_sending_without_reply": true,
            });
        }
        if let Some(disable) = disable_notification {
            params["disable_notification"] = json!(disable);
        }
        if let Some(thread_id) = message_thread_id {
            params["message_thread_id"] = json!(thread_id);
        }
        if let Some(entities) = entities {
            params["entities"] = entities.clone();
        }
        if let Some(markup) = reply_markup {
            params["reply_markup"] = markup.clone();
        }
        self.call("sendMessage", params).await
    }

    /// Edit a message. With `wait == false` the request is fired from a
    /// detached task and the call returns immediately with `None`.
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        entities: Option<&Value>,
        reply_markup: Option<&Value>,
        wait: bool,
    ) -> Option<Value> {
        let mut params = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
        });
        if let Some(entities) = entities {
            params["entities"] = entities.clone();
        }
        if let Some(markup) = reply_markup {
            params["reply_markup"] = markup.clone();
        }
        if !wait {
            let client = self.clone();
            tokio::spawn(async move {
                client.call("editMessageText", params).await;
            });
            return None;
        }
        self.call("editMessageText", params).await
    }

    pub async fn delete_message(&self, chat_id: i64, message_id: i64) -> bool {
        self.call(
            "deleteMessage",
            json!({"chat_id": chat_id, "message_id": message_id}),
        )
        .await
        .is_some()
    }

    pub async fn answer_callback_query(
        &self,
        callback_query_id: &str,
        text: Option<&str>,
    ) -> Option<Value> {
        let mut params = json!({"callback_query_id": callback_query_id});
        if let Some(text) = text {
            params["text"] = json!(text);
        }
        self.call("answerCallbackQuery", params).await
    }

    pub async fn send_document(
        &self,
        chat_id: i64,
        filename: &str,
        content: Vec<u8>,
        reply_to_message_id: Option<i64>,
        message_thread_id: Option<i64>,
    ) -> Option<Value> {
        let part = reqwest::multipart::Part::bytes(content).file_name(filename.to_string());
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if let Some(reply_to) = reply_to_message_id {
            form = form.text(
                "reply_parameters",
                json!({"message_id": reply_to, "allow_sending_without_reply": true})
                    .to_string(),
            );
        }
        if let Some(thread_id) = message_thread_id {
            form = form.text("message_thread_id", thread_id.to_string());
        }
        let url = format!("{}/sendDocument", self.inner.base_url);
        let result = async {
            let response = self
                .inner
                .http
                .post(&url)
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
                .multipart(form)
                .send()
                .await?;
            let body: ApiResponse = response.json().await?;
            if !body.ok {
                return Err(ApiError::Api(
                    body.description
                        .unwrap_or_else(|| "unknown error".to_string()),
                ));
            }
            Ok::<_, ApiError>(body.result.unwrap_or(Value::Null))
        }
        .await;
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(error = %e, "sendDocument failed");
                None
            }
        }
    }

    pub async fn get_file(&self, file_id: &str) -> Option<Value> {
        self.call("getFile", json!({"file_id": file_id})).await
    }

    /// Download a file previously located via `get_file`.
    pub async fn download_file(&self, file_path: &str) -> Option<Vec<u8>> {
        let url = format!("{}/{file_path}", self.inner.file_base_url);
        let result = async {
            let response = self
                .inner
                .http
                .get(&url)
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_S))
                .send()
                .await?
                .error_for_status()?;
            Ok::<_, reqwest::Error>(response.bytes().await?.to_vec())
        }
        .await;
        match result {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "file download failed");
                None
            }
        }
    }

    pub async fn get_chat(&self, chat_id: i64) -> Option<Value> {
        self.call("getChat", json!({"chat_id": chat_id})).await
    }

    pub async fn get_chat_member(&self, chat_id: i64, user_id: i64) -> Option<Value> {
        self.call(
            "getChatMember",
            json!({"chat_id": chat_id, "user_id": user_id}),
        )
        .await
    }

    pub async fn get_me(&self) -> Option<Value> {
        self.call("getMe", json!({})).await
    }

    pub async fn set_my_commands(&self, commands: &[Value]) -> bool {
        self.call("setMyCommands", json!({"commands": commands}))
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub async fn create_forum_topic(&self, chat_id: i64, name: &str) -> Option<Value> {
        self.call(
            "createForumTopic",
            json!({"chat_id": chat_id, "name": name}),
        )
        .await
    }

    pub async fn edit_forum_topic(
        &self,
        chat_id: i64,
        message_thread_id: i64,
        name: &str,
    ) -> bool {
        self.call(
            "editForumTopic",
            json!({
                "chat_id": chat_id,
                "message_thread_id": message_thread_id,
                "name": name,
            }),
        )
        .await
        .is_some()
    }
}
