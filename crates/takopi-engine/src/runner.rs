use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use takopi_core::error::Result;
use takopi_core::model::ResumeToken;

use crate::event::EngineEvent;

/// Everything one engine invocation needs.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub prompt: String,
    pub resume: Option<ResumeToken>,
    pub cwd: Option<PathBuf>,
    /// Cancelling this token terminates the engine process.
    pub cancel: CancellationToken,
}

/// An engine backend: spawns the engine CLI and translates its native JSON
/// stream into [`EngineEvent`]s.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Engine id (lowercase, doubles as the `/engine` directive).
    fn engine(&self) -> &str;

    /// Executable probed for availability at startup.
    fn cli_cmd(&self) -> &str;

    /// Spawn the engine and stream translated events. The stream ends with
    /// `TurnEnd` or `Failed`; the channel closing without either means the
    /// engine died silently.
    async fn run(&self, spec: RunSpec) -> Result<mpsc::Receiver<EngineEvent>>;

    /// Render the resume line published in progress and final messages.
    fn format_resume(&self, token: &ResumeToken) -> String;

    /// Recognise a resume line this runner previously emitted (or the bare
    /// CLI invocation a user pasted back).
    fn parse_resume_line(&self, line: &str) -> Option<ResumeToken>;

    fn is_resume_line(&self, line: &str) -> bool {
        self.parse_resume_line(line).is_some()
    }
}

/// Strip the decoration around a resume line: an optional `resume:` prefix
/// and surrounding backticks.
pub(crate) fn strip_resume_decoration(line: &str) -> &str {
    let mut rest = line.trim();
    if let Some(stripped) = rest.strip_prefix("resume:") {
        rest = stripped.trim_start();
    }
    rest.trim_matches('`').trim()
}
