use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use takopi_core::context::RunContext;
use takopi_core::model::{EngineId, ResumeToken};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read state file: {0}")]
    Read(std::io::Error),

    #[error("failed to write state file: {0}")]
    Write(std::io::Error),

    #[error("corrupt state file: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("unsupported state file version {0}")]
    Version(u32),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// State of one forum thread.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopicThreadSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<RunContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_title: Option<String>,
    /// Newest resume token per engine.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sessions: HashMap<EngineId, String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub created_by_bot: bool,
}

impl TopicThreadSnapshot {
    pub fn is_empty(&self) -> bool {
        self.context.is_none()
            && self.topic_title.is_none()
            && self.sessions.is_empty()
            && !self.created_by_bot
    }

    pub fn session_resume(&self, engine: &str) -> Option<ResumeToken> {
        self.sessions
            .get(engine)
            .map(|value| ResumeToken::new(engine, value.clone()))
    }
}

pub(crate) const STATE_VERSION: u32 = 1;

/// On-disk document. `chats` maps `chat_id → thread_id → snapshot`, both
/// keys stringified for JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StateFile {
    pub version: u32,
    #[serde(default)]
    pub chats: HashMap<String, HashMap<String, TopicThreadSnapshot>>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            chats: HashMap::new(),
        }
    }
}
