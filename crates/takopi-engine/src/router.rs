use std::sync::Arc;

use takopi_core::error::{Result, TakopiError};
use takopi_core::model::{EngineId, ResumeToken};

use crate::runner::Runner;

/// One configured engine backend, plus whether it can actually be used.
#[derive(Clone)]
pub struct RunnerEntry {
    pub engine: EngineId,
    pub runner: Arc<dyn Runner>,
    pub available: bool,
    pub issue: Option<String>,
}

impl RunnerEntry {
    pub fn available(runner: Arc<dyn Runner>) -> Self {
        Self {
            engine: runner.engine().to_string(),
            runner,
            available: true,
            issue: None,
        }
    }
}

/// Routes messages to engine runners: by explicit override, by the engine a
/// resume token belongs to, or the configured default.
#[derive(Clone)]
pub struct EngineRouter {
    entries: Vec<RunnerEntry>,
    default_engine: EngineId,
}

impl std::fmt::Debug for EngineRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRouter")
            .field("entries", &self.entries.iter().map(|e| &e.engine).collect::<Vec<_>>())
            .field("default_engine", &self.default_engine)
            .finish()
    }
}

impl EngineRouter {
    pub fn new(entries: Vec<RunnerEntry>, default_engine: EngineId) -> Result<Self> {
        let default_engine = default_engine.to_lowercase();
        if !entries.iter().any(|e| e.engine == default_engine) {
            let available: Vec<&str> = entries.iter().map(|e| e.engine.as_str()).collect();
            return Err(TakopiError::Config(format!(
                "Unknown default engine {default_engine:?}. Available: {}.",
                available.join(", ")
            )));
        }
        Ok(Self {
            entries,
            default_engine,
        })
    }

    pub fn default_engine(&self) -> &str {
        &self.default_engine
    }

    /// Same runners, possibly different default (config reload).
    pub fn rebuild(&self, default_engine: &str) -> Result<Self> {
        Self::new(self.entries.clone(), default_engine.to_string())
    }

    pub fn engine_ids(&self) -> Vec<EngineId> {
        self.entries.iter().map(|e| e.engine.clone()).collect()
    }

    pub fn available_engine_ids(&self) -> Vec<EngineId> {
        self.entries
            .iter()
            .filter(|e| e.available)
            .map(|e| e.engine.clone())
            .collect()
    }

    pub fn missing_engine_ids(&self) -> Vec<EngineId> {
        self.entries
            .iter()
            .filter(|e| !e.available)
            .map(|e| e.engine.clone())
            .collect()
    }

    pub fn entry_for_engine(&self, engine_override: Option<&str>) -> Result<&RunnerEntry> {
        let engine = engine_override
            .map(|e| e.to_lowercase())
            .unwrap_or_else(|| self.default_engine.clone());
        self.entries
            .iter()
            .find(|e| e.engine == engine)
            .ok_or_else(|| TakopiError::RunnerUnavailable {
                engine: engine.clone(),
                reason: "engine is not configured".to_string(),
            })
    }

    pub fn entry_for(&self, token: &ResumeToken) -> Result<&RunnerEntry> {
        self.entries
            .iter()
            .find(|e| e.engine == token.engine)
            .ok_or_else(|| TakopiError::RunnerUnavailable {
                engine: token.engine.clone(),
                reason: "no runner for this resume token".to_string(),
            })
    }

    /// Scan the prompt, then the reply text, for a resume line any runner
    /// recognises. A pasted resume line in the prompt wins over the reply.
    pub fn resolve_resume(&self, prompt: &str, reply_text: Option<&str>) -> Option<ResumeToken> {
        for text in [Some(prompt), reply_text].into_iter().flatten() {
            for line in text.lines() {
                for entry in &self.entries {
                    if let Some(token) = entry.runner.parse_resume_line(line) {
                        return Some(token);
                    }
                }
            }
        }
        None
    }

    pub fn is_resume_line(&self, line: &str) -> bool {
        self.entries.iter().any(|e| e.runner.is_resume_line(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptRunner;

    fn router() -> EngineRouter {
        let codex = ScriptRunner::answering("codex", "ok");
        let claude = ScriptRunner::answering("claude", "ok");
        EngineRouter::new(
            vec![
                RunnerEntry::available(Arc::new(codex)),
                RunnerEntry::available(Arc::new(claude)),
            ],
            "codex".into(),
        )
        .unwrap()
    }

    #[test]
    fn unknown_default_engine_is_config_error() {
        let codex = ScriptRunner::answering("codex", "ok");
        let err = EngineRouter::new(
            vec![RunnerEntry::available(Arc::new(codex))],
            "missing".into(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("Unknown default engine"));
    }

    #[test]
    fn entry_for_engine_falls_back_to_default() {
        let router = router();
        assert_eq!(router.entry_for_engine(None).unwrap().engine, "codex");
        assert_eq!(
            router.entry_for_engine(Some("Claude")).unwrap().engine,
            "claude"
        );
        assert!(router.entry_for_engine(Some("pi")).is_err());
    }

    #[test]
    fn resolve_resume_prefers_prompt_over_reply() {
        let router = router();
        let prompt = "more\nresume: `claude --resume abc`";
        let reply = "working\nresume: `codex exec resume xyz`";
        let token = router.resolve_resume(prompt, Some(reply)).unwrap();
        assert_eq!(token.engine, "claude");
        assert_eq!(token.value, "abc");
    }

    #[test]
    fn resolve_resume_finds_reply_line() {
        let router = router();
        let reply = "done · 5s · step 3\n\nresume: `codex exec resume r1`";
        let token = router.resolve_resume("more", Some(reply)).unwrap();
        assert_eq!(token.engine, "codex");
        assert_eq!(token.value, "r1");
    }

    #[test]
    fn entry_for_token_uses_owning_engine() {
        let router = router();
        let token = ResumeToken::new("claude", "abc");
        assert_eq!(router.entry_for(&token).unwrap().engine, "claude");
        let unknown = ResumeToken::new("pi", "abc");
        assert!(router.entry_for(&unknown).is_err());
    }
}
