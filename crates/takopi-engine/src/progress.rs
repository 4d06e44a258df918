//! Progress tracking and rendering for a single engine run.
//!
//! Keeps a bounded ring of recent action lines (deduplicated by action id)
//! and a step counter, and renders the progress / final message bodies the
//! presenter decorates for the wire.

use std::collections::{HashMap, VecDeque};

use takopi_core::model::{EngineId, ResumeToken};

use crate::event::{Action, ActionEvent, ActionKind, ActionPhase, EngineEvent};

pub const STATUS_RUNNING: &str = "▸";
pub const STATUS_UPDATE: &str = "↻";
pub const STATUS_DONE: &str = "✓";
pub const STATUS_FAIL: &str = "✗";
const HEADER_SEP: &str = " · ";
/// Markdown hard break between action lines.
const HARD_BREAK: &str = "  \n";

pub const MAX_RECENT_ACTIONS: usize = 5;
pub const MAX_PROGRESS_CMD_LEN: usize = 300;
const MAX_FILE_CHANGES_INLINE: usize = 3;

pub fn format_elapsed(elapsed_s: f64) -> String {
    let total = elapsed_s.max(0.0) as u64;
    let (minutes, seconds) = (total / 60, total % 60);
    let (hours, minutes) = (minutes / 60, minutes % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn format_header(elapsed_s: f64, step: Option<u32>, label: &str) -> String {
    let mut parts = vec![label.to_string(), format_elapsed(elapsed_s)];
    if let Some(step) = step {
        parts.push(format!("step {step}"));
    }
    parts.join(HEADER_SEP)
}

fn shorten(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}

fn file_change_verb(kind: Option<&str>) -> &'static str {
    match kind {
        Some("add") => "added",
        Some("delete") => "deleted",
        _ => "updated",
    }
}

fn format_file_change_title(action: &Action, width: usize) -> String {
    if let Some(changes) = action.detail.get("changes").and_then(|v| v.as_array()) {
        let mut rendered: Vec<String> = changes
            .iter()
            .filter_map(|raw| {
                let path = raw.get("path")?.as_str()?;
                if path.is_empty() {
                    return None;
                }
                let verb = file_change_verb(raw.get("kind").and_then(|k| k.as_str()));
                let path = path.strip_prefix("./").unwrap_or(path);
                Some(format!("{verb} `{path}`"))
            })
            .collect();
        if !rendered.is_empty() {
            if rendered.len() > MAX_FILE_CHANGES_INLINE {
                let remaining = rendered.len() - MAX_FILE_CHANGES_INLINE;
                rendered.truncate(MAX_FILE_CHANGES_INLINE);
                rendered.push(format!("…({remaining} more)"));
            }
            return format!("files: {}", shorten(&rendered.join(", "), width));
        }
    }
    format!("files: {}", shorten(&action.title, width))
}

pub fn format_action_title(action: &Action, width: usize) -> String {
    match action.kind {
        ActionKind::Command => format!("`{}`", shorten(&action.title, width)),
        ActionKind::Tool => format!("tool: {}", shorten(&action.title, width)),
        ActionKind::WebSearch => format!("searched: {}", shorten(&action.title, width)),
        ActionKind::FileChange => format_file_change_title(action, width),
        ActionKind::Note | ActionKind::Warning => shorten(&action.title, width),
    }
}

fn action_status_symbol(action: &Action, completed: bool, ok: Option<bool>) -> &'static str {
    if !completed {
        return STATUS_RUNNING;
    }
    match ok {
        Some(true) => STATUS_DONE,
        Some(false) => STATUS_FAIL,
        None => match action.exit_code() {
            Some(code) if code != 0 => STATUS_FAIL,
            _ => STATUS_DONE,
        },
    }
}

fn action_exit_suffix(action: &Action) -> String {
    match action.exit_code() {
        Some(code) if code != 0 => format!(" (exit {code})"),
        _ => String::new(),
    }
}

/// Snapshot handed to the presenter. Content only; no transport concerns.
#[derive(Debug, Clone, Default)]
pub struct ProgressState {
    pub engine: EngineId,
    pub session_title: Option<String>,
    pub resume: Option<ResumeToken>,
    /// Pre-rendered action lines, oldest first.
    pub recent_actions: Vec<String>,
    pub step_count: u32,
    /// Formatted resume line, when the resume token is known.
    pub resume_line: Option<String>,
    /// Canonical context header, when the run has a context.
    pub context_line: Option<String>,
}

struct RingEntry {
    action_id: String,
    completed: bool,
    line: String,
}

pub struct ProgressTracker {
    engine: EngineId,
    max_actions: usize,
    command_width: usize,
    ring: VecDeque<RingEntry>,
    action_count: u32,
    started_counts: HashMap<String, u32>,
    resume: Option<ResumeToken>,
    session_title: Option<String>,
    context_line: Option<String>,
}

impl ProgressTracker {
    pub fn new(engine: impl Into<EngineId>) -> Self {
        Self {
            engine: engine.into(),
            max_actions: MAX_RECENT_ACTIONS,
            command_width: MAX_PROGRESS_CMD_LEN,
            ring: VecDeque::new(),
            action_count: 0,
            started_counts: HashMap::new(),
            resume: None,
            session_title: None,
            context_line: None,
        }
    }

    pub fn set_resume(&mut self, resume: Option<ResumeToken>) {
        self.resume = resume;
    }

    pub fn set_context_line(&mut self, line: Option<String>) {
        self.context_line = line;
    }

    pub fn resume(&self) -> Option<&ResumeToken> {
        self.resume.as_ref()
    }

    pub fn step_count(&self) -> u32 {
        self.action_count
    }

    /// Fold one engine event in. Returns true when the visible state changed.
    pub fn note_event(&mut self, event: &EngineEvent) -> bool {
        match event {
            EngineEvent::Started(started) => {
                if started.resume.is_some() {
                    self.resume = started.resume.clone();
                }
                self.session_title = started.title.clone();
                true
            }
            EngineEvent::Action(event) => self.note_action(event),
            _ => false,
        }
    }

    fn note_action(&mut self, event: &ActionEvent) -> bool {
        let action = &event.action;
        if action.id.is_empty() {
            return false;
        }
        let completed = event.phase == ActionPhase::Completed;

        // Step counting: the first observation of an id counts as a step;
        // re-starts of the same id are balanced against its completions so
        // "step N" tracks distinct logical actions.
        let mut is_update = false;
        if !completed {
            let started = self.started_counts.get(&action.id).copied().unwrap_or(0);
            is_update = event.phase == ActionPhase::Updated || started > 0;
            if started == 0 {
                self.action_count += 1;
                self.started_counts.insert(action.id.clone(), 1);
            } else if event.phase == ActionPhase::Started {
                self.started_counts.insert(action.id.clone(), started + 1);
            }
        } else {
            let started = self.started_counts.get(&action.id).copied().unwrap_or(0);
            if started == 0 {
                self.action_count += 1;
            } else if started == 1 {
                self.started_counts.remove(&action.id);
            } else {
                self.started_counts.insert(action.id.clone(), started - 1);
            }
        }

        let status = if is_update && !completed {
            STATUS_UPDATE
        } else {
            action_status_symbol(action, completed, event.ok)
        };
        let title = format_action_title(action, self.command_width);
        let suffix = if completed {
            action_exit_suffix(action)
        } else {
            String::new()
        };
        let line = format!("{status} {title}{suffix}");
        self.append_action(&action.id, completed, line);
        true
    }

    fn append_action(&mut self, action_id: &str, completed: bool, line: String) {
        // A live entry for the same id is overwritten in place.
        for entry in self.ring.iter_mut().rev() {
            if entry.action_id == action_id && !entry.completed {
                entry.line = line;
                if completed {
                    entry.completed = true;
                }
                return;
            }
        }
        if self.ring.len() >= self.max_actions {
            self.ring.pop_front();
        }
        self.ring.push_back(RingEntry {
            action_id: action_id.to_string(),
            completed,
            line,
        });
    }

    pub fn snapshot(&self, resume_formatter: impl Fn(&ResumeToken) -> String) -> ProgressState {
        ProgressState {
            engine: self.engine.clone(),
            session_title: self.session_title.clone(),
            resume: self.resume.clone(),
            recent_actions: self.ring.iter().map(|e| e.line.clone()).collect(),
            step_count: self.action_count,
            resume_line: self.resume.as_ref().map(resume_formatter),
            context_line: self.context_line.clone(),
        }
    }
}

/// Body of an in-flight progress message.
pub fn render_progress_text(state: &ProgressState, elapsed_s: f64, label: &str) -> String {
    let step = (state.step_count > 0).then_some(state.step_count);
    let header = format_header(elapsed_s, step, &label_with_title(state, label));
    let mut message = match state.context_line.as_deref() {
        Some(context) => format!("{context}\n{header}"),
        None => header,
    };
    if !state.recent_actions.is_empty() {
        message.push_str("\n\n");
        message.push_str(&state.recent_actions.join(HARD_BREAK));
    }
    append_resume(state, message)
}

/// Body of the terminal message for a run.
pub fn render_final_text(
    state: &ProgressState,
    elapsed_s: f64,
    status: &str,
    answer: &str,
) -> String {
    let step = (state.step_count > 0).then_some(state.step_count);
    let header = format_header(elapsed_s, step, &label_with_title(state, status));
    let mut message = match state.context_line.as_deref() {
        Some(context) => format!("{context}\n{header}"),
        None => header,
    };
    let answer = answer.trim();
    if !answer.is_empty() {
        message.push_str("\n\n");
        message.push_str(answer);
    }
    append_resume(state, message)
}

fn label_with_title(state: &ProgressState, label: &str) -> String {
    match &state.session_title {
        Some(title) => format!("{label} ({title})"),
        None => label.to_string(),
    }
}

fn append_resume(state: &ProgressState, message: String) -> String {
    match &state.resume_line {
        Some(line) => format!("{message}\n\n{line}"),
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StartedEvent;

    fn command(id: &str, title: &str) -> Action {
        Action::new(id, ActionKind::Command, title)
    }

    fn started(action: Action) -> EngineEvent {
        EngineEvent::action(action, ActionPhase::Started, None)
    }

    fn completed(action: Action, ok: Option<bool>) -> EngineEvent {
        EngineEvent::action(action, ActionPhase::Completed, ok)
    }

    #[test]
    fn elapsed_formats() {
        assert_eq!(format_elapsed(7.9), "7s");
        assert_eq!(format_elapsed(67.0), "1m 07s");
        assert_eq!(format_elapsed(3720.0), "1h 02m");
    }

    #[test]
    fn dedup_updates_in_place() {
        let mut tracker = ProgressTracker::new("codex");
        tracker.note_event(&started(command("a", "cargo test")));
        tracker.note_event(&completed(command("a", "cargo test"), Some(true)));
        let state = tracker.snapshot(|t| t.value.clone());
        assert_eq!(state.recent_actions.len(), 1);
        assert!(state.recent_actions[0].starts_with(STATUS_DONE));
        assert_eq!(state.step_count, 1);
    }

    #[test]
    fn ring_is_bounded_and_fifo() {
        let mut tracker = ProgressTracker::new("codex");
        for i in 0..7 {
            tracker.note_event(&started(command(&format!("id{i}"), &format!("cmd {i}"))));
        }
        let state = tracker.snapshot(|t| t.value.clone());
        assert_eq!(state.recent_actions.len(), MAX_RECENT_ACTIONS);
        assert!(state.recent_actions[0].contains("cmd 2"));
        assert_eq!(state.step_count, 7);
    }

    #[test]
    fn restart_of_same_id_is_one_step() {
        let mut tracker = ProgressTracker::new("codex");
        tracker.note_event(&started(command("a", "x")));
        tracker.note_event(&started(command("a", "x")));
        tracker.note_event(&completed(command("a", "x"), None));
        tracker.note_event(&completed(command("a", "x"), None));
        let state = tracker.snapshot(|t| t.value.clone());
        assert_eq!(state.step_count, 1);
    }

    #[test]
    fn completion_without_start_counts_a_step() {
        let mut tracker = ProgressTracker::new("codex");
        tracker.note_event(&completed(command("only", "x"), Some(true)));
        assert_eq!(tracker.step_count(), 1);
    }

    #[test]
    fn exit_code_drives_failure_symbol_and_suffix() {
        let mut tracker = ProgressTracker::new("codex");
        let action = command("a", "false").with_detail("exit_code", serde_json::json!(2));
        tracker.note_event(&completed(action, None));
        let state = tracker.snapshot(|t| t.value.clone());
        assert!(state.recent_actions[0].starts_with(STATUS_FAIL));
        assert!(state.recent_actions[0].ends_with("(exit 2)"));
    }

    #[test]
    fn explicit_ok_beats_exit_code() {
        let mut tracker = ProgressTracker::new("codex");
        let action = command("a", "flaky").with_detail("exit_code", serde_json::json!(1));
        tracker.note_event(&completed(action, Some(true)));
        let state = tracker.snapshot(|t| t.value.clone());
        assert!(state.recent_actions[0].starts_with(STATUS_DONE));
    }

    #[test]
    fn update_phase_uses_update_symbol() {
        let mut tracker = ProgressTracker::new("codex");
        tracker.note_event(&started(command("a", "x")));
        tracker.note_event(&EngineEvent::action(
            command("a", "x again"),
            ActionPhase::Updated,
            None,
        ));
        let state = tracker.snapshot(|t| t.value.clone());
        assert_eq!(state.recent_actions.len(), 1);
        assert!(state.recent_actions[0].starts_with(STATUS_UPDATE));
    }

    #[test]
    fn started_event_records_resume_and_title() {
        let mut tracker = ProgressTracker::new("codex");
        tracker.note_event(&EngineEvent::Started(StartedEvent {
            engine: "codex".into(),
            title: Some("fix readme".into()),
            resume: Some(ResumeToken::new("codex", "r1")),
        }));
        let state = tracker.snapshot(|t| format!("resume: `{}`", t.value));
        assert_eq!(state.resume_line.as_deref(), Some("resume: `r1`"));
        let text = render_progress_text(&state, 3.0, "working");
        assert!(text.contains("working (fix readme)"));
        assert!(text.ends_with("resume: `r1`"));
    }

    #[test]
    fn file_change_lines_inline_changes() {
        let mut tracker = ProgressTracker::new("codex");
        let action = Action::new("p1", ActionKind::FileChange, "patch").with_detail(
            "changes",
            serde_json::json!([
                {"path": "./src/lib.rs", "kind": "update"},
                {"path": "README.md", "kind": "add"}
            ]),
        );
        tracker.note_event(&started(action));
        let state = tracker.snapshot(|t| t.value.clone());
        assert!(state.recent_actions[0].contains("files: updated `src/lib.rs`, added `README.md`"));
    }

    #[test]
    fn final_text_includes_context_and_answer() {
        let mut tracker = ProgressTracker::new("codex");
        tracker.set_context_line(Some("`proj @feat`".into()));
        tracker.note_event(&started(command("a", "cargo build")));
        let state = tracker.snapshot(|t| t.value.clone());
        let text = render_final_text(&state, 61.0, "done", "all green");
        assert!(text.starts_with("`proj @feat`\ndone · 1m 01s · step 1"));
        assert!(text.contains("\n\nall green"));
    }
}
