//! Codex engine backend.
//!
//! Spawns `codex exec --json` (or `codex exec resume <session>` for
//! follow-ups) and translates its per-line event stream.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;

use takopi_core::error::Result;
use takopi_core::model::ResumeToken;

use crate::event::{Action, ActionKind, ActionPhase, EngineEvent, StartedEvent};
use crate::jsonl::{spawn_translated, Translator};
use crate::runner::{strip_resume_decoration, RunSpec, Runner};

pub const ENGINE: &str = "codex";

/// `engines.codex` config table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CodexConfig {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

pub struct CodexRunner {
    config: CodexConfig,
}

impl CodexRunner {
    pub fn new(config: CodexConfig) -> Self {
        Self { config }
    }

    pub fn from_table(table: &serde_json::Value) -> Result<Self> {
        let config = if table.is_null() {
            CodexConfig::default()
        } else {
            serde_json::from_value(table.clone())?
        };
        Ok(Self::new(config))
    }
}

#[async_trait]
impl Runner for CodexRunner {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn cli_cmd(&self) -> &str {
        self.config.cmd.as_deref().unwrap_or(ENGINE)
    }

    async fn run(&self, spec: RunSpec) -> Result<mpsc::Receiver<EngineEvent>> {
        let mut command = Command::new(self.cli_cmd());
        command.arg("exec");
        if let Some(resume) = &spec.resume {
            command.args(["resume", &resume.value]);
        }
        command.arg("--json");
        if let Some(model) = &self.config.model {
            command.args(["--model", model]);
        }
        command.args(&self.config.args);
        command.arg(&spec.prompt);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        spawn_translated(command, spec.cancel, Box::new(CodexTranslator::default()))
    }

    fn format_resume(&self, token: &ResumeToken) -> String {
        format!("resume: `codex exec resume {}`", token.value)
    }

    fn parse_resume_line(&self, line: &str) -> Option<ResumeToken> {
        let stripped = strip_resume_decoration(line);
        let tokens: Vec<&str> = stripped.split_whitespace().collect();
        let value = match tokens.as_slice() {
            ["codex", "exec", "resume", value] => value,
            ["codex", "resume", value] => value,
            _ => return None,
        };
        Some(ResumeToken::new(ENGINE, *value))
    }
}

#[derive(Default)]
struct CodexTranslator {
    /// call_id → (kind, title, file-change detail) so completion events can
    /// re-render the full line.
    actions: HashMap<String, (ActionKind, String, Option<serde_json::Value>)>,
    last_agent_message: Option<String>,
}

impl CodexTranslator {
    fn begin(
        &mut self,
        call_id: &str,
        kind: ActionKind,
        title: String,
        changes: Option<serde_json::Value>,
    ) -> EngineEvent {
        self.actions
            .insert(call_id.to_string(), (kind, title.clone(), changes.clone()));
        let mut action = Action::new(call_id, kind, title);
        if let Some(changes) = changes {
            action = action.with_detail("changes", changes);
        }
        EngineEvent::action(action, ActionPhase::Started, None)
    }

    fn end(
        &mut self,
        call_id: &str,
        ok: Option<bool>,
        exit_code: Option<i64>,
    ) -> EngineEvent {
        let (kind, title, changes) = self
            .actions
            .remove(call_id)
            .unwrap_or((ActionKind::Tool, call_id.to_string(), None));
        let mut action = Action::new(call_id, kind, title);
        if let Some(changes) = changes {
            action = action.with_detail("changes", changes);
        }
        if let Some(code) = exit_code {
            action = action.with_detail("exit_code", serde_json::json!(code));
        }
        EngineEvent::action(action, ActionPhase::Completed, ok)
    }
}

fn command_title(msg: &serde_json::Value) -> String {
    match msg.get("command") {
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(" "),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

/// `patch_apply_begin.changes` is a map `path → {add|update|delete: {...}}`;
/// flatten it to the `[{path, kind}]` shape the renderer expects.
fn patch_changes(msg: &serde_json::Value) -> Option<serde_json::Value> {
    let changes = msg.get("changes")?.as_object()?;
    let flattened: Vec<serde_json::Value> = changes
        .iter()
        .map(|(path, change)| {
            let kind = change
                .as_object()
                .and_then(|o| o.keys().next())
                .map(String::as_str)
                .unwrap_or("update");
            serde_json::json!({"path": path, "kind": kind})
        })
        .collect();
    Some(serde_json::Value::Array(flattened))
}

impl Translator for CodexTranslator {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn translate(&mut self, value: serde_json::Value) -> Vec<EngineEvent> {
        let Some(msg) = value.get("msg") else {
            return vec![EngineEvent::Unknown { payload: value }];
        };
        let Some(kind) = msg.get("type").and_then(|t| t.as_str()) else {
            return vec![EngineEvent::Unknown { payload: value }];
        };
        let call_id = msg
            .get("call_id")
            .and_then(|c| c.as_str())
            .unwrap_or("")
            .to_string();
        match kind {
            "session_configured" => {
                let resume = msg
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(|id| ResumeToken::new(ENGINE, id));
                vec![EngineEvent::Started(StartedEvent {
                    engine: ENGINE.to_string(),
                    title: None,
                    resume,
                })]
            }
            "agent_message" => {
                if let Some(message) = msg.get("message").and_then(|m| m.as_str()) {
                    self.last_agent_message = Some(message.to_string());
                }
                vec![]
            }
            "exec_command_begin" => {
                vec![self.begin(&call_id, ActionKind::Command, command_title(msg), None)]
            }
            "exec_command_end" => {
                let exit_code = msg.get("exit_code").and_then(|c| c.as_i64());
                vec![self.end(&call_id, None, exit_code)]
            }
            "web_search_begin" => {
                vec![self.begin(&call_id, ActionKind::WebSearch, String::new(), None)]
            }
            "web_search_end" => {
                if let Some(query) = msg.get("query").and_then(|q| q.as_str()) {
                    if let Some(entry) = self.actions.get_mut(&call_id) {
                        entry.1 = query.to_string();
                    }
                }
                vec![self.end(&call_id, Some(true), None)]
            }
            "mcp_tool_call_begin" => {
                let title = msg
                    .get("invocation")
                    .map(|inv| {
                        let server = inv.get("server").and_then(|s| s.as_str()).unwrap_or("");
                        let tool = inv.get("tool").and_then(|t| t.as_str()).unwrap_or("");
                        format!("{server}.{tool}")
                    })
                    .unwrap_or_default();
                vec![self.begin(&call_id, ActionKind::Tool, title, None)]
            }
            "mcp_tool_call_end" => {
                let ok = msg
                    .get("is_error")
                    .and_then(|e| e.as_bool())
                    .map(|is_error| !is_error);
                vec![self.end(&call_id, ok, None)]
            }
            "patch_apply_begin" => {
                let changes = patch_changes(msg);
                vec![self.begin(&call_id, ActionKind::FileChange, "apply patch".into(), changes)]
            }
            "patch_apply_end" => {
                let ok = msg.get("success").and_then(|s| s.as_bool());
                vec![self.end(&call_id, ok, None)]
            }
            "task_complete" => {
                let answer = msg
                    .get("last_agent_message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .or_else(|| self.last_agent_message.take());
                vec![EngineEvent::TurnEnd { answer }]
            }
            "error" => {
                let message = msg
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("codex reported an error")
                    .to_string();
                vec![EngineEvent::Failed { message }]
            }
            // Chatter that has no progress-line representation.
            "task_started" | "agent_reasoning" | "agent_reasoning_delta"
            | "agent_message_delta" | "exec_command_output_delta" | "token_count"
            | "turn_diff" | "background_event" | "stream_error" | "plan_update" => vec![],
            _ => vec![EngineEvent::Unknown { payload: value }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(translator: &mut CodexTranslator, line: &str) -> Vec<EngineEvent> {
        translator.translate(serde_json::from_str(line).unwrap())
    }

    #[test]
    fn session_configured_yields_started_with_resume() {
        let mut t = CodexTranslator::default();
        let events = translate(
            &mut t,
            r#"{"id":"0","msg":{"type":"session_configured","session_id":"sess-1"}}"#,
        );
        match &events[0] {
            EngineEvent::Started(started) => {
                assert_eq!(started.resume.as_ref().unwrap().value, "sess-1");
                assert_eq!(started.engine, "codex");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn exec_command_round_trip_keeps_title() {
        let mut t = CodexTranslator::default();
        let begin = translate(
            &mut t,
            r#"{"id":"1","msg":{"type":"exec_command_begin","call_id":"c1","command":["cargo","test"]}}"#,
        );
        match &begin[0] {
            EngineEvent::Action(e) => {
                assert_eq!(e.action.title, "cargo test");
                assert_eq!(e.action.kind, ActionKind::Command);
                assert_eq!(e.phase, ActionPhase::Started);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let end = translate(
            &mut t,
            r#"{"id":"2","msg":{"type":"exec_command_end","call_id":"c1","exit_code":1}}"#,
        );
        match &end[0] {
            EngineEvent::Action(e) => {
                assert_eq!(e.action.title, "cargo test");
                assert_eq!(e.phase, ActionPhase::Completed);
                assert_eq!(e.action.exit_code(), Some(1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn task_complete_carries_answer() {
        let mut t = CodexTranslator::default();
        translate(
            &mut t,
            r#"{"id":"1","msg":{"type":"agent_message","message":"working on it"}}"#,
        );
        let events = translate(&mut t, r#"{"id":"2","msg":{"type":"task_complete"}}"#);
        assert_eq!(
            events[0],
            EngineEvent::TurnEnd {
                answer: Some("working on it".into())
            }
        );
    }

    #[test]
    fn patch_apply_flattens_changes() {
        let mut t = CodexTranslator::default();
        let events = translate(
            &mut t,
            r#"{"id":"1","msg":{"type":"patch_apply_begin","call_id":"p1","changes":{"src/lib.rs":{"update":{}}}}}"#,
        );
        match &events[0] {
            EngineEvent::Action(e) => {
                let changes = e.action.detail.get("changes").unwrap().as_array().unwrap();
                assert_eq!(changes[0]["path"], "src/lib.rs");
                assert_eq!(changes[0]["kind"], "update");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn noise_is_dropped_and_unknown_is_flagged() {
        let mut t = CodexTranslator::default();
        assert!(translate(&mut t, r#"{"id":"1","msg":{"type":"token_count"}}"#).is_empty());
        let events = translate(&mut t, r#"{"id":"1","msg":{"type":"brand_new_event"}}"#);
        assert!(matches!(events[0], EngineEvent::Unknown { .. }));
    }

    #[test]
    fn resume_line_round_trip() {
        let runner = CodexRunner::new(CodexConfig::default());
        let token = ResumeToken::new("codex", "sess-9");
        let line = runner.format_resume(&token);
        assert_eq!(line, "resume: `codex exec resume sess-9`");
        assert_eq!(runner.parse_resume_line(&line), Some(token.clone()));
        assert_eq!(
            runner.parse_resume_line("codex resume sess-9"),
            Some(token)
        );
        assert_eq!(runner.parse_resume_line("codex exec sess-9"), None);
    }
}
