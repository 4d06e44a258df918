//! Engine backends and message resolution.
//!
//! An engine is a coding-agent CLI spawned as a child process that streams
//! line-delimited JSON events. Per-engine translators map those streams onto
//! the shared [`event::EngineEvent`] model; the [`router::EngineRouter`]
//! picks runners; [`runtime::TransportRuntime`] resolves free-form incoming
//! messages into run requests.

pub mod claude;
pub mod codex;
pub mod directives;
pub mod event;
mod jsonl;
pub mod progress;
pub mod router;
pub mod runner;
pub mod runtime;
pub mod script;

pub use event::{Action, ActionEvent, ActionKind, ActionPhase, EngineEvent, StartedEvent};
pub use progress::{ProgressState, ProgressTracker};
pub use router::{EngineRouter, RunnerEntry};
pub use runner::{RunSpec, Runner};
pub use runtime::{ContextSource, ResolvedMessage, ResolvedRunner, TransportRuntime};
