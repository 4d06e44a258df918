use serde::{Deserialize, Serialize};

use takopi_core::model::{EngineId, ResumeToken};

/// What an action line represents in the progress view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Command,
    Tool,
    WebSearch,
    FileChange,
    Note,
    Warning,
}

/// One logical step of an engine run, identified by an engine-assigned id.
/// Later events for the same id update the action in place.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: String,
    pub kind: ActionKind,
    pub title: String,
    pub detail: serde_json::Map<String, serde_json::Value>,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: ActionKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            title: title.into(),
            detail: serde_json::Map::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: serde_json::Value) -> Self {
        self.detail.insert(key.to_string(), value);
        self
    }

    pub fn exit_code(&self) -> Option<i64> {
        self.detail.get("exit_code").and_then(|v| v.as_i64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionPhase {
    Started,
    Updated,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionEvent {
    pub action: Action,
    pub phase: ActionPhase,
    /// Explicit success/failure; when absent, `detail.exit_code` decides.
    pub ok: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedEvent {
    pub engine: EngineId,
    pub title: Option<String>,
    pub resume: Option<ResumeToken>,
}

/// Translated engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Started(StartedEvent),
    Action(ActionEvent),
    /// Turn sentinel: the engine finished and `answer` is its final text.
    TurnEnd { answer: Option<String> },
    /// The engine failed; `message` is the diagnostic shown in the final frame.
    Failed { message: String },
    /// Unrecognised line, kept for debug logging only.
    Unknown { payload: serde_json::Value },
}

impl EngineEvent {
    pub fn action(action: Action, phase: ActionPhase, ok: Option<bool>) -> Self {
        EngineEvent::Action(ActionEvent { action, phase, ok })
    }
}
