//! Message resolution.
//!
//! [`TransportRuntime::resolve_message`] is the pure function that turns a
//! raw incoming message into a run request: prompt, resume token, engine
//! override and working context, with a recorded context source.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use takopi_core::config::ProjectsConfig;
use takopi_core::context::RunContext;
use takopi_core::error::{Result, TakopiError};
use takopi_core::model::{EngineId, ResumeToken};
use takopi_core::worktrees::resolve_run_cwd;

use crate::directives::{format_context_line, parse_context_line, parse_directives};
use crate::router::EngineRouter;
use crate::runner::Runner;

/// Where the resolved context came from. Earlier variants win.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSource {
    Directives,
    ReplyCtx,
    TopicBind,
    ChatDefault,
    None,
}

impl ContextSource {
    pub fn label(&self) -> &'static str {
        match self {
            ContextSource::Directives => "directives",
            ContextSource::ReplyCtx => "reply_ctx",
            ContextSource::TopicBind => "topic_bind",
            ContextSource::ChatDefault => "chat_default",
            ContextSource::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMessage {
    pub prompt: String,
    pub resume_token: Option<ResumeToken>,
    pub engine_override: Option<EngineId>,
    pub context: Option<RunContext>,
    pub context_source: ContextSource,
}

#[derive(Clone)]
pub struct ResolvedRunner {
    pub engine: EngineId,
    pub runner: Arc<dyn Runner>,
    pub available: bool,
    pub issue: Option<String>,
}

pub struct TransportRuntime {
    router: EngineRouter,
    projects: ProjectsConfig,
    config_path: Option<PathBuf>,
    plugin_configs: HashMap<String, serde_json::Value>,
}

impl TransportRuntime {
    pub fn new(
        router: EngineRouter,
        projects: ProjectsConfig,
        config_path: Option<PathBuf>,
        plugin_configs: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            router,
            projects,
            config_path,
            plugin_configs,
        }
    }

    pub fn default_engine(&self) -> &str {
        self.router.default_engine()
    }

    /// Rebuild for a reloaded config: same runners, new projects and plugin
    /// tables, possibly a new default engine.
    pub fn with_config(
        &self,
        projects: ProjectsConfig,
        plugin_configs: HashMap<String, serde_json::Value>,
        default_engine: &str,
    ) -> Result<Self> {
        Ok(Self::new(
            self.router.rebuild(default_engine)?,
            projects,
            self.config_path.clone(),
            plugin_configs,
        ))
    }

    pub fn engine_ids(&self) -> Vec<EngineId> {
        self.router.engine_ids()
    }

    pub fn available_engine_ids(&self) -> Vec<EngineId> {
        self.router.available_engine_ids()
    }

    pub fn missing_engine_ids(&self) -> Vec<EngineId> {
        self.router.missing_engine_ids()
    }

    pub fn project_aliases(&self) -> Vec<String> {
        self.projects.aliases()
    }

    pub fn projects(&self) -> &ProjectsConfig {
        &self.projects
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn normalize_project_key(&self, token: &str) -> Option<String> {
        self.projects.normalize_key(token)
    }

    pub fn project_alias_for_key(&self, key: &str) -> String {
        self.projects.alias_for_key(key)
    }

    pub fn project_chat_ids(&self) -> Vec<i64> {
        self.projects.project_chat_ids()
    }

    pub fn plugin_config(&self, plugin_id: &str) -> Result<serde_json::Value> {
        match self.plugin_configs.get(plugin_id) {
            None => Ok(serde_json::Value::Null),
            Some(value @ serde_json::Value::Object(_)) => Ok(value.clone()),
            Some(_) => Err(TakopiError::Config(format!(
                "Invalid `plugins.{plugin_id}`; expected a table."
            ))),
        }
    }

    fn project_default_engine(&self, project_key: Option<&str>) -> Option<EngineId> {
        let project = self.projects.get(project_key?)?;
        project.default_engine.clone()
    }

    /// Engine used for a run: explicit override, else the project's default
    /// engine, else the router default.
    pub fn resolve_engine(
        &self,
        engine_override: Option<&str>,
        context: Option<&RunContext>,
    ) -> EngineId {
        if let Some(engine) = engine_override {
            return engine.to_lowercase();
        }
        self.project_default_engine(context.and_then(|c| c.project.as_deref()))
            .unwrap_or_else(|| self.router.default_engine().to_string())
    }

    pub fn default_context_for_chat(&self, chat_id: Option<i64>) -> Option<RunContext> {
        let project = self.projects.project_for_chat(chat_id)?;
        Some(RunContext::project(project))
    }

    pub fn resolve_runner(
        &self,
        resume_token: Option<&ResumeToken>,
        engine_override: Option<&str>,
    ) -> Result<ResolvedRunner> {
        let entry = match resume_token {
            Some(token) => self.router.entry_for(token)?,
            None => self.router.entry_for_engine(engine_override)?,
        };
        Ok(ResolvedRunner {
            engine: entry.engine.clone(),
            runner: Arc::clone(&entry.runner),
            available: entry.available,
            issue: entry.issue.clone(),
        })
    }

    pub fn is_resume_line(&self, line: &str) -> bool {
        self.router.is_resume_line(line)
    }

    pub fn resolve_run_cwd(&self, context: Option<&RunContext>) -> Result<Option<PathBuf>> {
        resolve_run_cwd(context, &self.projects)
    }

    pub fn format_context_line(&self, context: Option<&RunContext>) -> Option<String> {
        format_context_line(context, &self.projects)
    }

    /// Resolve a free-form message. Pure: no I/O, deterministic for a given
    /// input and config.
    pub fn resolve_message(
        &self,
        text: &str,
        reply_text: Option<&str>,
        ambient_context: Option<&RunContext>,
        chat_id: Option<i64>,
    ) -> Result<ResolvedMessage> {
        let directives = parse_directives(text, &self.router.engine_ids(), &self.projects)?;
        let reply_ctx = parse_context_line(reply_text, &self.projects);
        let resume_token = self.router.resolve_resume(&directives.prompt, reply_text);
        let chat_project = self
            .projects
            .project_for_chat(chat_id)
            .map(str::to_string)
            .or_else(|| self.projects.default_project.clone());

        let has_ctx_directive = directives.project.is_some() || directives.branch.is_some();

        // A resume token pins the engine; directives may still place the run.
        if let Some(resume_token) = resume_token {
            let (context, context_source) = if has_ctx_directive {
                (
                    self.context_from_directives(&directives, ambient_context, &chat_project),
                    ContextSource::Directives,
                )
            } else if let Some(reply_ctx) = reply_ctx {
                (Some(reply_ctx), ContextSource::ReplyCtx)
            } else if let Some(ambient) = ambient_context {
                (Some(ambient.clone()), ContextSource::TopicBind)
            } else if let Some(project) = &chat_project {
                (Some(RunContext::project(project)), ContextSource::ChatDefault)
            } else {
                (None, ContextSource::None)
            };
            return Ok(ResolvedMessage {
                prompt: directives.prompt,
                resume_token: Some(resume_token),
                engine_override: None,
                context,
                context_source,
            });
        }

        if !has_ctx_directive {
            if let Some(reply_ctx) = reply_ctx {
                let engine_override = directives.engine.clone().or_else(|| {
                    self.project_default_engine(reply_ctx.project.as_deref())
                });
                return Ok(ResolvedMessage {
                    prompt: directives.prompt,
                    resume_token: None,
                    engine_override,
                    context: Some(reply_ctx),
                    context_source: ContextSource::ReplyCtx,
                });
            }
        }

        let (context, context_source) = if has_ctx_directive {
            (
                self.context_from_directives(&directives, ambient_context, &chat_project),
                ContextSource::Directives,
            )
        } else if let Some(ambient) = ambient_context {
            (Some(ambient.clone()), ContextSource::TopicBind)
        } else if let Some(project) = &chat_project {
            (Some(RunContext::project(project)), ContextSource::ChatDefault)
        } else {
            (None, ContextSource::None)
        };

        let engine_override = directives.engine.clone().or_else(|| {
            self.project_default_engine(context.as_ref().and_then(|c| c.project.as_deref()))
        });

        Ok(ResolvedMessage {
            prompt: directives.prompt,
            resume_token: None,
            engine_override,
            context,
            context_source,
        })
    }

    /// Build a context from explicit directives. A bare `@branch` attaches
    /// to the ambient or chat-default project; an explicit `/project` resets
    /// the branch unless one was also given.
    fn context_from_directives(
        &self,
        directives: &crate::directives::Directives,
        ambient_context: Option<&RunContext>,
        chat_project: &Option<String>,
    ) -> Option<RunContext> {
        let project = directives.project.clone().or_else(|| {
            directives.branch.as_ref()?;
            ambient_context
                .and_then(|c| c.project.clone())
                .or_else(|| chat_project.clone())
        });
        RunContext::new(project, directives.branch.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RunnerEntry;
    use crate::script::ScriptRunner;
    use std::collections::HashMap;
    use takopi_core::config::ProjectConfig;

    fn make_runtime(project_default_engine: Option<&str>) -> TransportRuntime {
        let codex = ScriptRunner::answering("codex", "ok");
        let pi = ScriptRunner::answering("pi", "ok");
        let router = EngineRouter::new(
            vec![
                RunnerEntry::available(Arc::new(codex)),
                RunnerEntry::available(Arc::new(pi)),
            ],
            "codex".into(),
        )
        .unwrap();
        let mut projects = HashMap::new();
        projects.insert(
            "proj".to_string(),
            ProjectConfig {
                alias: "proj".into(),
                path: ".".into(),
                worktrees_dir: ".worktrees".into(),
                worktree_base: None,
                default_engine: project_default_engine.map(str::to_string),
                chat_id: Some(-42),
            },
        );
        let mut chat_map = HashMap::new();
        chat_map.insert(-42, "proj".to_string());
        TransportRuntime::new(
            router,
            ProjectsConfig {
                projects,
                default_project: None,
                chat_map,
            },
            None,
            HashMap::new(),
        )
    }

    #[test]
    fn resolve_engine_uses_project_default() {
        let runtime = make_runtime(Some("pi"));
        let ctx = RunContext::project("proj");
        assert_eq!(runtime.resolve_engine(None, Some(&ctx)), "pi");
    }

    #[test]
    fn resolve_engine_prefers_override() {
        let runtime = make_runtime(Some("pi"));
        let ctx = RunContext::project("proj");
        assert_eq!(runtime.resolve_engine(Some("codex"), Some(&ctx)), "codex");
    }

    #[test]
    fn resolve_message_full_directives() {
        let runtime = make_runtime(None);
        let resolved = runtime
            .resolve_message("/codex /proj @feat write README", None, None, Some(10))
            .unwrap();
        assert_eq!(resolved.prompt, "write README");
        assert_eq!(resolved.engine_override.as_deref(), Some("codex"));
        assert_eq!(resolved.context_source, ContextSource::Directives);
        let ctx = resolved.context.unwrap();
        assert_eq!(ctx.project.as_deref(), Some("proj"));
        assert_eq!(ctx.branch.as_deref(), Some("feat"));
    }

    #[test]
    fn resolve_message_defaults_to_chat_project() {
        let runtime = make_runtime(None);
        let resolved = runtime
            .resolve_message("hello", None, None, Some(-42))
            .unwrap();
        assert_eq!(resolved.context_source, ContextSource::ChatDefault);
        assert_eq!(
            resolved.context.unwrap().project.as_deref(),
            Some("proj")
        );
    }

    #[test]
    fn resolve_message_prefers_ambient_over_chat_default() {
        let runtime = make_runtime(None);
        let ambient = RunContext {
            project: Some("proj".into()),
            branch: Some("feat".into()),
        };
        let resolved = runtime
            .resolve_message("hello", None, Some(&ambient), Some(-42))
            .unwrap();
        assert_eq!(resolved.context_source, ContextSource::TopicBind);
        assert_eq!(resolved.context.unwrap().branch.as_deref(), Some("feat"));
    }

    #[test]
    fn resolve_message_reply_ctx_beats_ambient() {
        let runtime = make_runtime(None);
        let ambient = RunContext::project("proj");
        let resolved = runtime
            .resolve_message("more", Some("`proj @wip`\nworking"), Some(&ambient), None)
            .unwrap();
        assert_eq!(resolved.context_source, ContextSource::ReplyCtx);
        assert_eq!(resolved.context.unwrap().branch.as_deref(), Some("wip"));
    }

    #[test]
    fn resolve_message_directives_beat_reply_ctx() {
        let runtime = make_runtime(None);
        let resolved = runtime
            .resolve_message("@feat go", Some("`proj @wip`\nworking"), None, Some(-42))
            .unwrap();
        assert_eq!(resolved.context_source, ContextSource::Directives);
        let ctx = resolved.context.unwrap();
        assert_eq!(ctx.project.as_deref(), Some("proj"));
        assert_eq!(ctx.branch.as_deref(), Some("feat"));
    }

    #[test]
    fn resume_token_pins_engine_and_drops_override() {
        let runtime = make_runtime(None);
        let reply = "done · 1s\n\nresume: `pi resume r1`";
        let resolved = runtime
            .resolve_message("/codex more", Some(reply), None, None)
            .unwrap();
        let token = resolved.resume_token.unwrap();
        assert_eq!(token.engine, "pi");
        assert_eq!(token.value, "r1");
        assert_eq!(resolved.engine_override, None);
    }

    #[test]
    fn resume_without_project_falls_back_to_chat_default() {
        let runtime = make_runtime(None);
        let reply = "working\n\nresume: `codex resume r2`";
        let resolved = runtime
            .resolve_message("more", Some(reply), None, Some(-42))
            .unwrap();
        assert!(resolved.resume_token.is_some());
        assert_eq!(resolved.context_source, ContextSource::ChatDefault);
        let ctx = resolved.context.unwrap();
        assert_eq!(ctx.project.as_deref(), Some("proj"));
        assert_eq!(ctx.branch, None);
    }

    #[test]
    fn resolver_is_idempotent_on_its_own_prompt() {
        let runtime = make_runtime(None);
        let first = runtime
            .resolve_message("/proj do the thing", None, None, None)
            .unwrap();
        let second = runtime
            .resolve_message(&first.prompt, None, None, None)
            .unwrap();
        assert_eq!(second.prompt, first.prompt);
    }

    #[test]
    fn unknown_project_directive_is_error() {
        let runtime = make_runtime(None);
        assert!(runtime
            .resolve_message("/ghost hello", None, None, None)
            .is_err());
    }

    #[test]
    fn plugin_config_table_or_null() {
        let mut plugin_configs = HashMap::new();
        plugin_configs.insert("good".to_string(), serde_json::json!({"a": 1}));
        plugin_configs.insert("bad".to_string(), serde_json::json!("nope"));
        let base = make_runtime(None);
        let runtime = TransportRuntime::new(
            EngineRouter::new(
                vec![RunnerEntry::available(Arc::new(ScriptRunner::answering(
                    "codex", "ok",
                )))],
                "codex".into(),
            )
            .unwrap(),
            base.projects.clone(),
            None,
            plugin_configs,
        );
        assert!(runtime.plugin_config("good").unwrap().is_object());
        assert!(runtime.plugin_config("missing").unwrap().is_null());
        assert!(runtime.plugin_config("bad").is_err());
    }
}
