//! Claude Code engine backend.
//!
//! Spawns `claude -p --output-format stream-json --verbose` and translates
//! the content-block stream. Tool calls surface as actions; tool results
//! complete them.

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

pub const ENGINE: &str = "claude";

/// `engines.claude` config table.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClaudeConfig {
    #[serde(default)]
    pub cmd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

pub struct ClaudeRunner {
    config: ClaudeConfig,
}

impl ClaudeRunner {
    pub fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }

    pub fn from_table(table: &serde_json::Value) -> Result<Self> {
        let config = if table.is_null() {
            ClaudeConfig::default()
        } else {
            serde_json::from_value(table.clone())?
        };
        Ok(Self::new(config))
    }
}

#[async_trait]
impl Runner for ClaudeRunner {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn cli_cmd(&self) -> &str {
        self.config.cmd.as_deref().unwrap_or(ENGINE)
    }

    async fn run(&self, spec: RunSpec) -> Result<mpsc::Receiver<EngineEvent>> {
        let mut command = Command::new(self.cli_cmd());
        command.args(["-p", "--output-format", "stream-json", "--verbose"]);
        if let Some(model) = &self.config.model {
            command.args(["--model", model]);
        }
        if let Some(resume) = &spec.resume {
            command.args(["--resume", &resume.value]);
        }
        command.args(&self.config.args);
        command.arg(&spec.prompt);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        spawn_translated(command, spec.cancel, Box::new(ClaudeTranslator::default()))
    }

    fn format_resume(&self, token: &ResumeToken) -> String {
        format!("resume: `claude --resume {}`", token.value)
    }

    fn parse_resume_line(&self, line: &str) -> Option<ResumeToken> {
        let stripped = strip_resume_decoration(line);
        let tokens: Vec<&str> = stripped.split_whitespace().collect();
        let value = match tokens.as_slice() {
            ["claude", "--resume", value] => value,
            ["claude", "-r", value] => value,
            _ => return None,
        };
        Some(ResumeToken::new(ENGINE, *value))
    }
}

#[derive(Default)]
struct ClaudeTranslator {
    actions: HashMap<String, (ActionKind, String, Option<serde_json::Value>)>,
    last_text: Option<String>,
}

fn tool_action(name: &str, input: &serde_json::Value) -> (ActionKind, String, Option<serde_json::Value>) {
    let str_field = |key: &str| input.get(key).and_then(|v| v.as_str()).map(str::to_string);
    match name {
        "Bash" => (
            ActionKind::Command,
            str_field("command").unwrap_or_default(),
            None,
        ),
        "WebSearch" => (
            ActionKind::WebSearch,
            str_field("query").unwrap_or_default(),
            None,
        ),
        "Edit" | "MultiEdit" | "NotebookEdit" => {
            let path = str_field("file_path").unwrap_or_default();
            let changes = serde_json::json!([{"path": path, "kind": "update"}]);
            (ActionKind::FileChange, path, Some(changes))
        }
        "Write" => {
            let path = str_field("file_path").unwrap_or_default();
            let changes = serde_json::json!([{"path": path, "kind": "add"}]);
            (ActionKind::FileChange, path, Some(changes))
        }
        _ => {
            // Generic tool: show the most descriptive argument we can find.
            let arg = str_field("file_path")
                .or_else(|| str_field("pattern"))
                .or_else(|| str_field("query"))
                .or_else(|| str_field("description"));
            let title = match arg {
                Some(arg) => format!("{name} {arg}"),
                None => name.to_string(),
            };
            (ActionKind::Tool, title, None)
        }
    }
}

impl ClaudeTranslator {
    fn assistant_blocks(&mut self, message: &serde_json::Value) -> Vec<EngineEvent> {
        let Some(blocks) = message.get("content").and_then(|c| c.as_array()) else {
            return vec![];
        };
        let mut events = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("tool_use") => {
                    let id = block
                        .get("id")
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("");
                    let input = block
                        .get("input")
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let (kind, title, changes) = tool_action(name, &input);
                    self.actions
                        .insert(id.clone(), (kind, title.clone(), changes.clone()));
                    let mut action = Action::new(id, kind, title);
                    if let Some(changes) = changes {
                        action = action.with_detail("changes", changes);
                    }
                    events.push(EngineEvent::action(action, ActionPhase::Started, None));
                }
                Some("text") => {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        self.last_text = Some(text.to_string());
                    }
                }
                _ => {}
            }
        }
        events
    }

    fn tool_results(&mut self, message: &serde_json::Value) -> Vec<EngineEvent> {
        let Some(blocks) = message.get("content").and_then(|c| c.as_array()) else {
            return vec![];
        };
        let mut events = Vec::new();
        for block in blocks {
            if block.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                continue;
            }
            let Some(id) = block.get("tool_use_id").and_then(|i| i.as_str()) else {
                continue;
            };
            let ok = !block
                .get("is_error")
                .and_then(|e| e.as_bool())
                .unwrap_or(false);
            let (kind, title, changes) = self
                .actions
                .remove(id)
                .unwrap_or((ActionKind::Tool, id.to_string(), None));
            let mut action = Action::new(id, kind, title);
            if let Some(changes) = changes {
                action = action.with_detail("changes", changes);
            }
            events.push(EngineEvent::action(
                action,
                ActionPhase::Completed,
                Some(ok),
            ));
        }
        events
    }
}

impl Translator for ClaudeTranslator {
    fn engine(&self) -> &str {
        ENGINE
    }

    fn translate(&mut self, value: serde_json::Value) -> Vec<EngineEvent> {
        let kind = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
        match kind {
            "system" => {
                if value.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                    let resume = value
                        .get("session_id")
                        .and_then(|s| s.as_str())
                        .map(|id| ResumeToken::new(ENGINE, id));
                    return vec![EngineEvent::Started(StartedEvent {
                        engine: ENGINE.to_string(),
                        title: None,
                        resume,
                    })];
                }
                vec![]
            }
            "assistant" => value
                .get("message")
                .map(|m| self.assistant_blocks(m))
                .unwrap_or_default(),
            "user" => value
                .get("message")
                .map(|m| self.tool_results(m))
                .unwrap_or_default(),
            "result" => {
                let subtype = value.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
                if subtype == "success" {
                    let answer = value
                        .get("result")
                        .and_then(|r| r.as_str())
                        .map(str::to_string)
                        .or_else(|| self.last_text.take());
                    vec![EngineEvent::TurnEnd { answer }]
                } else {
                    let message = value
                        .get("result")
                        .and_then(|r| r.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("claude run failed ({subtype})"));
                    vec![EngineEvent::Failed { message }]
                }
            }
            "stream_event" => vec![],
            _ => vec![EngineEvent::Unknown { payload: value }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translate(translator: &mut ClaudeTranslator, line: &str) -> Vec<EngineEvent> {
        translator.translate(serde_json::from_str(line).unwrap())
    }

    #[test]
    fn init_yields_started_with_session() {
        let mut t = ClaudeTranslator::default();
        let events = translate(
            &mut t,
            r#"{"type":"system","subtype":"init","session_id":"abc","model":"claude"}"#,
        );
        match &events[0] {
            EngineEvent::Started(started) => {
                assert_eq!(started.resume.as_ref().unwrap().value, "abc");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn bash_tool_use_becomes_command_action() {
        let mut t = ClaudeTranslator::default();
        let events = translate(
            &mut t,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"cargo check"}}]}}"#,
        );
        match &events[0] {
            EngineEvent::Action(e) => {
                assert_eq!(e.action.kind, ActionKind::Command);
                assert_eq!(e.action.title, "cargo check");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        let done = translate(
            &mut t,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1"}]}}"#,
        );
        match &done[0] {
            EngineEvent::Action(e) => {
                assert_eq!(e.phase, ActionPhase::Completed);
                assert_eq!(e.ok, Some(true));
                assert_eq!(e.action.title, "cargo check");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn tool_result_error_marks_failure() {
        let mut t = ClaudeTranslator::default();
        translate(
            &mut t,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t2","name":"Read","input":{"file_path":"gone.txt"}}]}}"#,
        );
        let done = translate(
            &mut t,
            r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t2","is_error":true}]}}"#,
        );
        match &done[0] {
            EngineEvent::Action(e) => assert_eq!(e.ok, Some(false)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn write_tool_is_a_file_change() {
        let mut t = ClaudeTranslator::default();
        let events = translate(
            &mut t,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t3","name":"Write","input":{"file_path":"README.md"}}]}}"#,
        );
        match &events[0] {
            EngineEvent::Action(e) => {
                assert_eq!(e.action.kind, ActionKind::FileChange);
                let changes = e.action.detail.get("changes").unwrap();
                assert_eq!(changes[0]["kind"], "add");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn result_success_is_turn_end() {
        let mut t = ClaudeTranslator::default();
        let events = translate(
            &mut t,
            r#"{"type":"result","subtype":"success","result":"all done"}"#,
        );
        assert_eq!(
            events[0],
            EngineEvent::TurnEnd {
                answer: Some("all done".into())
            }
        );
    }

    #[test]
    fn result_failure_is_failed() {
        let mut t = ClaudeTranslator::default();
        let events = translate(
            &mut t,
            r#"{"type":"result","subtype":"error_max_turns"}"#,
        );
        assert!(matches!(events[0], EngineEvent::Failed { .. }));
    }

    #[test]
    fn resume_line_round_trip() {
        let runner = ClaudeRunner::new(ClaudeConfig::default());
        let token = ResumeToken::new("claude", "abc");
        let line = runner.format_resume(&token);
        assert_eq!(runner.parse_resume_line(&line), Some(token.clone()));
        assert_eq!(runner.parse_resume_line("claude -r abc"), Some(token));
        assert_eq!(runner.parse_resume_line("claude abc"), None);
    }
}
