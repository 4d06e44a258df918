//! Scripted in-process runner used by tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use takopi_core::error::Result;
use takopi_core::model::ResumeToken;

use crate::event::EngineEvent;
use crate::runner::{strip_resume_decoration, RunSpec, Runner};

/// Replays a fixed list of events for every run and records the prompts it
/// was given, so tests can assert ordering and content.
pub struct ScriptRunner {
    engine: String,
    events: Vec<EngineEvent>,
    prompts: Arc<Mutex<Vec<String>>>,
    /// Per-run delay before replying, for interleaving tests.
    delay: Option<std::time::Duration>,
}

impl ScriptRunner {
    pub fn new(engine: impl Into<String>, events: Vec<EngineEvent>) -> Self {
        Self {
            engine: engine.into(),
            events,
            prompts: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// A runner that immediately answers `answer` with no actions.
    pub fn answering(engine: impl Into<String>, answer: &str) -> Self {
        Self::new(
            engine,
            vec![EngineEvent::TurnEnd {
                answer: Some(answer.to_string()),
            }],
        )
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn prompts(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.prompts)
    }
}

#[async_trait]
impl Runner for ScriptRunner {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn cli_cmd(&self) -> &str {
        &self.engine
    }

    async fn run(&self, spec: RunSpec) -> Result<mpsc::Receiver<EngineEvent>> {
        self.prompts.lock().unwrap().push(spec.prompt.clone());
        let (tx, rx) = mpsc::channel(16);
        let events = self.events.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            for event in events {
                if spec.cancel.is_cancelled() {
                    return;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn format_resume(&self, token: &ResumeToken) -> String {
        format!("resume: `{} resume {}`", self.engine, token.value)
    }

    fn parse_resume_line(&self, line: &str) -> Option<ResumeToken> {
        let stripped = strip_resume_decoration(line);
        let tokens: Vec<&str> = stripped.split_whitespace().collect();
        if tokens.len() < 3 || tokens[0] != self.engine {
            return None;
        }
        if !tokens.iter().any(|t| *t == "resume" || *t == "--resume") {
            return None;
        }
        let value = tokens.last()?;
        Some(ResumeToken::new(self.engine.clone(), *value))
    }
}
