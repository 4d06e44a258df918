//! User plugin commands.
//!
//! A plugin is a [`CommandBackend`] registered under a slash-command id. The
//! registry is built at startup and passed into the bridge; there is no
//! process-global command table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RunContext;
use crate::error::{Result, TakopiError};
use crate::ids::{is_reserved, is_valid_id};
use crate::model::{EngineId, MessageRef};
use crate::transport::RenderedMessage;

/// Split command arguments on whitespace, dropping empty tokens.
pub fn split_command_args(args_text: &str) -> Vec<String> {
    args_text
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Everything a command backend gets to see about the triggering message.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub command: String,
    /// Full original message text.
    pub text: String,
    /// Text after the command token.
    pub args_text: String,
    pub args: Vec<String>,
    pub message: MessageRef,
    pub reply_to: Option<MessageRef>,
    pub reply_text: Option<String>,
    pub thread_id: Option<i64>,
    /// The `plugins.<id>` config table, or `Null` when absent.
    pub plugin_config: serde_json::Value,
}

/// A run a command backend asks the bridge to perform.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub engine: Option<EngineId>,
    pub context: Option<RunContext>,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub engine: EngineId,
}

#[derive(Debug, Clone)]
pub struct CommandReply {
    pub text: String,
    pub reply_to: Option<MessageRef>,
    pub notify: bool,
}

impl CommandReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            reply_to: None,
            notify: true,
        }
    }
}

/// Bridge services exposed to command backends.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn send(
        &self,
        message: RenderedMessage,
        reply_to: Option<MessageRef>,
        notify: bool,
    ) -> Option<MessageRef>;

    /// Launch an engine run on behalf of the command. The run renders its
    /// own progress and final messages; the returned result only reports
    /// which engine was selected.
    async fn run_one(&self, request: RunRequest) -> Result<RunResult>;
}

#[async_trait]
pub trait CommandBackend: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> Option<&str> {
        None
    }
    async fn handle(
        &self,
        ctx: CommandContext,
        executor: &dyn CommandExecutor,
    ) -> Result<Option<CommandReply>>;
}

/// Registry of plugin command backends, keyed by lowercased id.
#[derive(Default)]
pub struct CommandRegistry {
    backends: HashMap<String, Arc<dyn CommandBackend>>,
    /// When set, only these ids are exposed.
    allowlist: Option<Vec<String>>,
}

impl CommandRegistry {
    pub fn new(allowlist: Option<Vec<String>>) -> Self {
        Self {
            backends: HashMap::new(),
            allowlist: allowlist
                .map(|list| list.into_iter().map(|id| id.to_lowercase()).collect()),
        }
    }

    pub fn register(&mut self, backend: Arc<dyn CommandBackend>) -> Result<()> {
        let id = backend.id().to_lowercase();
        if !is_valid_id(&id) {
            return Err(TakopiError::Config(format!(
                "Invalid command id {id:?}; use letters, digits, _ or -."
            )));
        }
        if is_reserved(&id) {
            return Err(TakopiError::Config(format!(
                "Command id {id:?} is reserved."
            )));
        }
        self.backends.insert(id, backend);
        Ok(())
    }

    fn allowed(&self, id: &str) -> bool {
        match &self.allowlist {
            Some(list) => list.iter().any(|a| a == id),
            None => true,
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn CommandBackend>> {
        let key = id.to_lowercase();
        if !self.allowed(&key) {
            return None;
        }
        self.backends.get(&key).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .backends
            .keys()
            .filter(|id| self.allowed(id))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}
