//! Long-poll update source.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::BotClient;
use crate::types::{parse_incoming_update, TelegramIncomingUpdate};

const POLL_TIMEOUT_S: u64 = 50;
const ERROR_BACKOFF_S: u64 = 5;
const ALLOWED_UPDATES: &[&str] = &["message", "callback_query"];

/// Pulls updates with `getUpdates`, tracking the offset across reconnects
/// and narrowing raw payloads to [`TelegramIncomingUpdate`]s for the chats
/// the bridge accepts.
pub struct UpdatePoller<F> {
    bot: BotClient,
    allowed: F,
    offset: Option<i64>,
    buffer: std::collections::VecDeque<TelegramIncomingUpdate>,
    cancel: CancellationToken,
}

impl<F> UpdatePoller<F>
where
    F: Fn(i64) -> bool,
{
    pub fn new(bot: BotClient, allowed: F, cancel: CancellationToken) -> Self {
        Self {
            bot,
            allowed,
            offset: None,
            buffer: std::collections::VecDeque::new(),
            cancel,
        }
    }

    /// Discard every update queued before startup, so old messages are not
    /// replayed into the new process.
    pub async fn drain_backlog(&mut self) {
        let mut drained = 0usize;
        loop {
            match self
                .bot
                .get_updates(self.offset, 0, ALLOWED_UPDATES)
                .await
            {
                Ok(updates) => {
                    if updates.is_empty() {
                        if drained > 0 {
                            info!(count = drained, "startup backlog drained");
                        }
                        return;
                    }
                    drained += updates.len();
                    self.advance_offset(&updates);
                }
                Err(e) => {
                    warn!(error = %e, "backlog drain failed");
                    return;
                }
            }
        }
    }

    fn advance_offset(&mut self, updates: &[serde_json::Value]) {
        if let Some(last) = updates.last() {
            if let Some(id) = last.get("update_id").and_then(|v| v.as_i64()) {
                self.offset = Some(id + 1);
            }
        }
    }

    /// Next relevant update, or `None` once cancelled.
    pub async fn next(&mut self) -> Option<TelegramIncomingUpdate> {
        loop {
            if let Some(update) = self.buffer.pop_front() {
                return Some(update);
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            let poll = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.bot.get_updates(self.offset, POLL_TIMEOUT_S, ALLOWED_UPDATES) => result,
            };
            match poll {
                Ok(updates) => {
                    debug!(count = updates.len(), "poll cycle");
                    self.advance_offset(&updates);
                    for raw in &updates {
                        if let Some(update) = parse_incoming_update(raw, &self.allowed) {
                            self.buffer.push_back(update);
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "getUpdates failed, backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(Duration::from_secs(ERROR_BACKOFF_S)) => {}
                    }
                }
            }
        }
    }
}
