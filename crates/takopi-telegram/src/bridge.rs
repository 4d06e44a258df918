//! The main loop: update routing, dispatch and lifecycle.
//!
//! Routing order for each update (first match wins): callback-query cancel,
//! voice transcription, media-group collection, `/cancel`, `/file`, topic
//! commands, plugin commands, engine run.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use takopi_core::commands::{
    split_command_args, CommandContext, CommandExecutor, CommandRegistry, RunRequest, RunResult,
};
use takopi_core::config::{
    resolve_state_path, FilesConfig, TakopiConfig, TelegramConfig, TopicsConfig,
    VoiceTranscriptionConfig,
};
use takopi_core::context::RunContext;
use takopi_core::error::{Result, TakopiError};
use takopi_core::ids::{is_valid_id, RESERVED_COMMAND_IDS};
use takopi_core::model::{EngineId, MessageRef, ResumeToken};
use takopi_core::transport::{RenderedMessage, SendOptions};
use takopi_engine::runtime::{ContextSource, TransportRuntime};
use takopi_scheduler::{JobRunner, ThreadJob, ThreadScheduler};
use takopi_sessions::TopicStateStore;

use crate::api::BotClient;
use crate::file_transfer;
use crate::poll::UpdatePoller;
use crate::presenter::{render_plain, CANCEL_CALLBACK_DATA};
use crate::runner_bridge::{
    self, new_running_tasks, ExecBridgeConfig, IncomingRun, ResumeSink, RunningTasks,
};
use crate::topics;
use crate::transcribe;
use crate::types::{
    TelegramCallbackQuery, TelegramIncomingMessage, TelegramIncomingUpdate,
};

const MAX_BOT_COMMANDS: usize = 100;
const MEDIA_GROUP_DEBOUNCE: Duration = Duration::from_secs(1);
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct TelegramBridgeConfig {
    pub bot: BotClient,
    pub chat_id: i64,
    pub chat_ids: Vec<i64>,
    pub startup_msg: String,
    pub exec: ExecBridgeConfig,
    pub files: FilesConfig,
    pub topics: TopicsConfig,
    pub voice: VoiceTranscriptionConfig,
}

pub struct MainLoopOptions {
    pub watch_config: bool,
    /// Transport table snapshot for reload diffing.
    pub transport_snapshot: Option<TelegramConfig>,
    pub default_engine_override: Option<String>,
}

pub(crate) struct MediaGroupState {
    pub(crate) messages: Vec<TelegramIncomingMessage>,
    pub(crate) token: u64,
}

struct CommandCache {
    command_ids: HashSet<String>,
    reserved: HashSet<String>,
}

impl CommandCache {
    fn build(runtime: &TransportRuntime, registry: &CommandRegistry) -> Self {
        let mut reserved: HashSet<String> = runtime
            .engine_ids()
            .into_iter()
            .map(|e| e.to_lowercase())
            .collect();
        reserved.extend(runtime.project_aliases().iter().map(|a| a.to_lowercase()));
        reserved.extend(RESERVED_COMMAND_IDS.iter().map(|r| r.to_string()));
        Self {
            command_ids: registry.ids().into_iter().collect(),
            reserved,
        }
    }
}

pub(crate) struct BridgeShared {
    pub(crate) cfg: TelegramBridgeConfig,
    runtime: StdRwLock<Arc<TransportRuntime>>,
    pub(crate) running_tasks: RunningTasks,
    pub(crate) topic_store: Option<Arc<TopicStateStore>>,
    scheduler: OnceLock<Arc<ThreadScheduler>>,
    pub(crate) registry: Arc<CommandRegistry>,
    command_cache: StdMutex<CommandCache>,
    media_groups: StdMutex<HashMap<(i64, String), MediaGroupState>>,
}

impl BridgeShared {
    pub(crate) fn runtime(&self) -> Arc<TransportRuntime> {
        Arc::clone(&self.runtime.read().unwrap())
    }

    fn set_runtime(&self, runtime: Arc<TransportRuntime>) {
        *self.runtime.write().unwrap() = runtime;
    }

    fn scheduler(&self) -> Arc<ThreadScheduler> {
        Arc::clone(self.scheduler.get().expect("scheduler installed at startup"))
    }

    fn refresh_command_cache(&self) {
        let runtime = self.runtime();
        *self.command_cache.lock().unwrap() = CommandCache::build(&runtime, &self.registry);
    }

    pub(crate) async fn send_plain(
        &self,
        chat_id: i64,
        user_msg_id: i64,
        thread_id: Option<i64>,
        text: &str,
    ) {
        self.send_plain_opts(chat_id, user_msg_id, thread_id, text, true)
            .await;
    }

    pub(crate) async fn send_plain_opts(
        &self,
        chat_id: i64,
        user_msg_id: i64,
        thread_id: Option<i64>,
        text: &str,
        notify: bool,
    ) {
        let message = render_plain(text);
        self.cfg
            .exec
            .transport
            .send(
                chat_id,
                &message,
                Some(&SendOptions {
                    reply_to: Some(MessageRef::new(chat_id, user_msg_id)),
                    notify,
                    thread_id,
                }),
            )
            .await;
    }
}

fn allowed_chat_ids(shared: &BridgeShared) -> HashSet<i64> {
    let mut allowed: HashSet<i64> = shared.cfg.chat_ids.iter().copied().collect();
    allowed.insert(shared.cfg.chat_id);
    allowed.extend(shared.runtime().project_chat_ids());
    allowed
}

fn is_cancel_command(text: &str) -> bool {
    let Some(first) = text.trim().split_whitespace().next() else {
        return false;
    };
    first == "/cancel" || first.starts_with("/cancel@")
}

/// Split a leading `/command` off the message: returns the lowercased id
/// (bot-mention stripped) and the argument text, which keeps later lines.
pub(crate) fn parse_slash_command(text: &str) -> (Option<String>, String) {
    let stripped = text.trim_start();
    if !stripped.starts_with('/') {
        return (None, text.to_string());
    }
    let (first_line, tail) = match stripped.split_once('\n') {
        Some((first_line, tail)) => (first_line, Some(tail)),
        None => (stripped, None),
    };
    let (token, rest) = match first_line.split_once(' ') {
        Some((token, rest)) => (token, rest),
        None => (first_line, ""),
    };
    let command = &token[1..];
    if command.is_empty() {
        return (None, text.to_string());
    }
    let command = command
        .split('@')
        .next()
        .unwrap_or(command)
        .to_lowercase();
    let args = match tail {
        Some(tail) if !rest.is_empty() => format!("{rest}\n{tail}"),
        Some(tail) => tail.to_string(),
        None => rest.to_string(),
    };
    (Some(command), args)
}

fn build_bot_commands(
    runtime: &TransportRuntime,
    registry: &CommandRegistry,
    include_file: bool,
) -> Vec<serde_json::Value> {
    let mut commands = Vec::new();
    let mut seen = HashSet::new();
    for engine in runtime.available_engine_ids() {
        let cmd = engine.to_lowercase();
        if seen.insert(cmd.clone()) {
            commands.push(serde_json::json!({
                "command": cmd,
                "description": format!("use agent: {engine}"),
            }));
        }
    }
    for alias in runtime.project_aliases() {
        let cmd = alias.to_lowercase();
        if !is_valid_id(&cmd) {
            debug!(alias = %alias, "project alias not menu-safe, skipping");
            continue;
        }
        if seen.insert(cmd.clone()) {
            commands.push(serde_json::json!({
                "command": cmd,
                "description": format!("work on: {alias}"),
            }));
        }
    }
    for id in registry.ids() {
        if seen.insert(id.clone()) {
            let description = registry
                .get(&id)
                .and_then(|b| b.description().map(str::to_string))
                .unwrap_or_else(|| format!("command: {id}"));
            commands.push(serde_json::json!({"command": id, "description": description}));
        }
    }
    if include_file && seen.insert("file".to_string()) {
        commands.push(serde_json::json!({
            "command": "file", "description": "upload or fetch files",
        }));
    }
    if seen.insert("cancel".to_string()) {
        commands.push(serde_json::json!({
            "command": "cancel", "description": "cancel run",
        }));
    }
    if commands.len() > MAX_BOT_COMMANDS {
        warn!(count = commands.len(), limit = MAX_BOT_COMMANDS, "command menu truncated");
        commands.truncate(MAX_BOT_COMMANDS);
        if !commands.iter().any(|c| c["command"] == "cancel") {
            let last = commands.len() - 1;
            commands[last] =
                serde_json::json!({"command": "cancel", "description": "cancel run"});
        }
    }
    commands
}

async fn set_command_menu(shared: &BridgeShared) {
    let runtime = shared.runtime();
    let commands = build_bot_commands(&runtime, &shared.registry, shared.cfg.files.enabled);
    if commands.is_empty() {
        return;
    }
    if shared.cfg.bot.set_my_commands(&commands).await {
        info!(count = commands.len(), "command menu published");
    } else {
        info!("command menu update rejected");
    }
}

/// Parameters of one engine run requested through the bridge.
pub(crate) struct EngineJob {
    pub(crate) chat_id: i64,
    pub(crate) user_msg_id: i64,
    pub(crate) text: String,
    pub(crate) resume_token: Option<ResumeToken>,
    pub(crate) context: Option<RunContext>,
    pub(crate) engine_override: Option<EngineId>,
    pub(crate) thread_id: Option<i64>,
}

struct BridgeResumeSink {
    scheduler: Arc<ThreadScheduler>,
    store: Option<Arc<TopicStateStore>>,
    topic_key: Option<(i64, i64)>,
}

#[async_trait]
impl ResumeSink for BridgeResumeSink {
    async fn thread_known(&self, token: &ResumeToken, done: CancellationToken) {
        self.scheduler.note_thread_known(token, done);
        if let (Some(store), Some((chat_id, thread_id))) = (&self.store, self.topic_key) {
            if let Err(e) = store.set_session_resume(chat_id, thread_id, token).await {
                warn!(error = %e, "failed to persist session resume");
            }
        }
    }
}

pub(crate) async fn run_engine_job(shared: &Arc<BridgeShared>, job: EngineJob) {
    let runtime = shared.runtime();
    let entry = match runtime.resolve_runner(
        job.resume_token.as_ref(),
        job.engine_override.as_deref(),
    ) {
        Ok(entry) => entry,
        Err(e) => {
            shared
                .send_plain(job.chat_id, job.user_msg_id, job.thread_id, &format!("error:\n{e}"))
                .await;
            return;
        }
    };
    if !entry.available {
        let reason = entry
            .issue
            .clone()
            .unwrap_or_else(|| "engine unavailable".to_string());
        runner_bridge::send_runner_unavailable(
            &shared.cfg.exec,
            job.chat_id,
            job.user_msg_id,
            job.thread_id,
            job.resume_token.clone(),
            entry.runner.as_ref(),
            &reason,
        )
        .await;
        return;
    }
    let cwd = match runtime.resolve_run_cwd(job.context.as_ref()) {
        Ok(cwd) => cwd,
        Err(e) => {
            shared
                .send_plain(job.chat_id, job.user_msg_id, job.thread_id, &format!("error:\n{e}"))
                .await;
            return;
        }
    };
    let context_line = runtime.format_context_line(job.context.as_ref());
    let topic_key = topics::topic_key_for(shared, job.chat_id, job.thread_id);
    let sink: Arc<dyn ResumeSink> = Arc::new(BridgeResumeSink {
        scheduler: shared.scheduler(),
        store: shared.topic_store.clone(),
        topic_key,
    });
    let strip_runtime = Arc::clone(&runtime);
    let strip: Arc<dyn Fn(&str) -> bool + Send + Sync> =
        Arc::new(move |line: &str| strip_runtime.is_resume_line(line));

    info!(
        engine = %entry.engine,
        chat_id = job.chat_id,
        resume = job.resume_token.as_ref().map(|t| t.value.as_str()),
        "starting run"
    );
    runner_bridge::handle_message(
        &shared.cfg.exec,
        entry.runner,
        IncomingRun {
            channel_id: job.chat_id,
            message_id: job.user_msg_id,
            text: job.text,
            thread_id: job.thread_id,
        },
        job.resume_token,
        job.context,
        context_line,
        cwd,
        Some(Arc::clone(&shared.running_tasks)),
        Some(sink),
        Some(strip),
    )
    .await;
}

struct SchedulerJobRunner {
    shared: Arc<BridgeShared>,
}

#[async_trait]
impl JobRunner for SchedulerJobRunner {
    async fn run(&self, job: ThreadJob) {
        run_engine_job(
            &self.shared,
            EngineJob {
                chat_id: job.chat_id,
                user_msg_id: job.user_msg_id,
                text: job.text,
                resume_token: Some(job.resume_token),
                context: job.context,
                engine_override: None,
                thread_id: job.thread_id,
            },
        )
        .await;
    }
}

async fn handle_cancel(shared: Arc<BridgeShared>, msg: TelegramIncomingMessage) {
    let Some(reply_id) = msg.reply_to_message_id else {
        let text = if msg.reply_to_text.is_some() {
            "nothing is currently running for that message."
        } else {
            "reply to the progress message to cancel."
        };
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, text)
            .await;
        return;
    };
    let progress_ref = MessageRef::new(msg.chat_id, reply_id);
    match shared.running_tasks.get(&progress_ref) {
        Some(task) => {
            info!(chat_id = msg.chat_id, progress_message_id = reply_id, "cancel requested");
            task.cancel_requested.cancel();
        }
        None => {
            shared
                .send_plain(
                    msg.chat_id,
                    msg.message_id,
                    msg.thread_id,
                    "nothing is currently running for that message.",
                )
                .await;
        }
    }
}

async fn handle_callback_cancel(shared: Arc<BridgeShared>, query: TelegramCallbackQuery) {
    let progress_ref = MessageRef::new(query.chat_id, query.message_id);
    match shared.running_tasks.get(&progress_ref) {
        Some(task) => {
            info!(
                chat_id = query.chat_id,
                progress_message_id = query.message_id,
                "cancel requested"
            );
            task.cancel_requested.cancel();
            drop(task);
            shared
                .cfg
                .bot
                .answer_callback_query(&query.callback_query_id, Some("cancelling..."))
                .await;
        }
        None => {
            shared
                .cfg
                .bot
                .answer_callback_query(
                    &query.callback_query_id,
                    Some("nothing is currently running for that message."),
                )
                .await;
        }
    }
}

async fn wait_for_resume(task: &runner_bridge::RunningTask) -> Option<ResumeToken> {
    if let Some(resume) = task.resume() {
        return Some(resume);
    }
    tokio::select! {
        _ = task.resume_ready.cancelled() => task.resume(),
        _ = task.done.cancelled() => task.resume(),
    }
}

/// A reply to a live progress message: wait for its resume token, then queue
/// the follow-up behind that session.
async fn send_with_resume(
    shared: Arc<BridgeShared>,
    task: Arc<runner_bridge::RunningTask>,
    chat_id: i64,
    user_msg_id: i64,
    thread_id: Option<i64>,
    text: String,
) {
    let Some(resume) = wait_for_resume(&task).await else {
        shared
            .send_plain_opts(
                chat_id,
                user_msg_id,
                thread_id,
                "resume token not ready yet; try replying to the final message.",
                false,
            )
            .await;
        return;
    };
    shared.scheduler().enqueue_resume(ThreadJob {
        chat_id,
        user_msg_id,
        text,
        resume_token: resume,
        context: task.context.clone(),
        thread_id,
    });
}

struct TelegramCommandExecutor {
    shared: Arc<BridgeShared>,
    chat_id: i64,
    user_msg_id: i64,
    thread_id: Option<i64>,
}

#[async_trait]
impl CommandExecutor for TelegramCommandExecutor {
    async fn send(
        &self,
        message: RenderedMessage,
        reply_to: Option<MessageRef>,
        notify: bool,
    ) -> Option<MessageRef> {
        let reply_to =
            reply_to.unwrap_or_else(|| MessageRef::new(self.chat_id, self.user_msg_id));
        self.shared
            .cfg
            .exec
            .transport
            .send(
                self.chat_id,
                &message,
                Some(&SendOptions {
                    reply_to: Some(reply_to),
                    notify,
                    thread_id: self.thread_id,
                }),
            )
            .await
    }

    async fn run_one(&self, request: RunRequest) -> Result<RunResult> {
        let runtime = self.shared.runtime();
        let context = request
            .context
            .or_else(|| runtime.default_context_for_chat(Some(self.chat_id)));
        let engine = runtime.resolve_engine(request.engine.as_deref(), context.as_ref());
        run_engine_job(
            &self.shared,
            EngineJob {
                chat_id: self.chat_id,
                user_msg_id: self.user_msg_id,
                text: request.prompt,
                resume_token: None,
                context,
                engine_override: Some(engine.clone()),
                thread_id: self.thread_id,
            },
        )
        .await;
        Ok(RunResult { engine })
    }
}

async fn dispatch_command(
    shared: Arc<BridgeShared>,
    msg: TelegramIncomingMessage,
    command_id: String,
    args_text: String,
) {
    let Some(backend) = shared.registry.get(&command_id) else {
        return;
    };
    let runtime = shared.runtime();
    let plugin_config = match runtime.plugin_config(&command_id) {
        Ok(config) => config,
        Err(e) => {
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
            return;
        }
    };
    let executor = TelegramCommandExecutor {
        shared: Arc::clone(&shared),
        chat_id: msg.chat_id,
        user_msg_id: msg.message_id,
        thread_id: msg.thread_id,
    };
    let ctx = CommandContext {
        command: command_id.clone(),
        text: msg.text.clone(),
        args: split_command_args(&args_text),
        args_text,
        message: MessageRef::new(msg.chat_id, msg.message_id),
        reply_to: msg
            .reply_to_message_id
            .map(|id| MessageRef::new(msg.chat_id, id)),
        reply_text: msg.reply_to_text.clone(),
        thread_id: msg.thread_id,
        plugin_config,
    };
    match backend.handle(ctx, &executor).await {
        Ok(Some(reply)) => {
            executor
                .send(render_plain(&reply.text), reply.reply_to, reply.notify)
                .await;
        }
        Ok(None) => {}
        Err(e) => {
            error!(command = %command_id, error = %e, "command failed");
            shared
                .send_plain(msg.chat_id, msg.message_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
        }
    }
}

async fn flush_media_group(shared: Arc<BridgeShared>, key: (i64, String)) {
    loop {
        let token = {
            let groups = shared.media_groups.lock().unwrap();
            match groups.get(&key) {
                Some(state) => state.token,
                None => return,
            }
        };
        tokio::time::sleep(MEDIA_GROUP_DEBOUNCE).await;
        let messages = {
            let mut groups = shared.media_groups.lock().unwrap();
            let current = groups.get(&key).map(|state| state.token);
            match current {
                None => return,
                Some(t) if t == token => groups.remove(&key).map(|state| state.messages),
                Some(_) => continue,
            }
        };
        if let Some(messages) = messages {
            file_transfer::handle_media_group(&shared, messages).await;
        }
        return;
    }
}

async fn config_watcher(shared: Arc<BridgeShared>, mut options: MainLoopOptions) {
    let Some(config_path) = shared.runtime().config_path().map(|p| p.to_path_buf()) else {
        return;
    };
    let mut last_modified = std::fs::metadata(&config_path).and_then(|m| m.modified()).ok();
    let mut interval = tokio::time::interval(CONFIG_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let modified = match std::fs::metadata(&config_path).and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        if last_modified == Some(modified) {
            continue;
        }
        last_modified = Some(modified);

        let config = match TakopiConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous config");
                continue;
            }
        };
        let runtime = shared.runtime();
        let projects = match config.to_projects(
            &config_path,
            &runtime.engine_ids(),
            RESERVED_COMMAND_IDS,
        ) {
            Ok(projects) => projects,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous config");
                continue;
            }
        };
        let default_engine = options
            .default_engine_override
            .clone()
            .unwrap_or_else(|| config.default_engine.clone());
        let new_runtime = match runtime.with_config(
            projects,
            config.plugins.clone().into_iter().collect(),
            &default_engine,
        ) {
            Ok(new_runtime) => Arc::new(new_runtime),
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping previous config");
                continue;
            }
        };
        shared.set_runtime(new_runtime);
        shared.refresh_command_cache();
        set_command_menu(&shared).await;
        info!("config reloaded");

        if let Some(snapshot) = &options.transport_snapshot {
            if let Some(new_telegram) = &config.transports.telegram {
                let old = serde_json::to_value(snapshot).unwrap_or_default();
                let new = serde_json::to_value(new_telegram).unwrap_or_default();
                if old != new {
                    warn!(transport = "telegram", restart_required = true,
                          "transport config changed; restart to apply");
                    options.transport_snapshot = Some(new_telegram.clone());
                }
            }
        }
        if config.transport != "telegram" {
            warn!(new_transport = %config.transport, restart_required = true,
                  "transport id changed; restart to apply");
        }
    }
}

/// Turn a voice note into prompt text, or report why that is not possible.
async fn transcribe_voice(
    shared: &BridgeShared,
    msg: &TelegramIncomingMessage,
) -> Option<String> {
    let voice = msg.voice.as_ref()?;
    let reject = |text: &'static str| async move {
        shared
            .send_plain(msg.chat_id, msg.message_id, msg.thread_id, text)
            .await;
        None::<String>
    };
    if !shared.cfg.voice.enabled {
        return reject("voice transcription is disabled.").await;
    }
    let Some(api_key) = transcribe::resolve_openai_api_key() else {
        return reject("voice transcription requires OPENAI_API_KEY.").await;
    };
    if voice.file_size.unwrap_or(0) > transcribe::AUDIO_MAX_BYTES {
        return reject("voice message is too large to transcribe.").await;
    }
    let file_info = shared.cfg.bot.get_file(&voice.file_id).await;
    let Some(file_path) = file_info
        .as_ref()
        .and_then(|info| info.get("file_path"))
        .and_then(|p| p.as_str())
    else {
        return reject("failed to fetch voice file.").await;
    };
    let Some(audio) = shared.cfg.bot.download_file(file_path).await else {
        return reject("failed to download voice message.").await;
    };
    if audio.len() as u64 > transcribe::AUDIO_MAX_BYTES {
        return reject("voice message is too large to transcribe.").await;
    }
    let filename =
        transcribe::normalize_voice_filename(Some(file_path), voice.mime_type.as_deref());
    let Some(transcript) = transcribe::transcribe_audio(
        audio,
        &filename,
        &api_key,
        voice.mime_type.as_deref(),
    )
    .await
    else {
        return reject("voice transcription failed.").await;
    };
    let transcript = transcript.trim().to_string();
    if transcript.is_empty() {
        return reject("voice transcription returned empty text.").await;
    }
    Some(transcript)
}

async fn route_message(shared: &Arc<BridgeShared>, msg: TelegramIncomingMessage) {
    let mut text = msg.text.clone();
    if msg.voice.is_some() {
        match transcribe_voice(shared, &msg).await {
            Some(transcript) => text = transcript,
            None => return,
        }
    }

    let chat_id = msg.chat_id;
    let user_msg_id = msg.message_id;
    let topic_key = topics::topic_key(shared, &msg);
    let chat_project = if shared.cfg.topics.enabled {
        topics::chat_project(shared, chat_id)
    } else {
        None
    };
    let bound_context = match (&shared.topic_store, topic_key) {
        (Some(store), Some((chat, thread))) => {
            store.get_context(chat, thread).await.unwrap_or_default()
        }
        _ => None,
    };
    let mut ambient_context =
        topics::merge_topic_context(chat_project.as_deref(), bound_context);

    // Media groups collect documents until the group goes quiet.
    if shared.cfg.files.enabled && msg.document.is_some() {
        if let Some(group_id) = msg.media_group_id.clone() {
            let key = (chat_id, group_id);
            let spawn_flush = {
                let mut groups = shared.media_groups.lock().unwrap();
                let state = groups.entry(key.clone()).or_insert_with(|| MediaGroupState {
                    messages: Vec::new(),
                    token: 0,
                });
                state.messages.push(msg.clone());
                state.token += 1;
                state.messages.len() == 1
            };
            if spawn_flush {
                tokio::spawn(flush_media_group(Arc::clone(shared), key));
            }
            return;
        }
    }

    if is_cancel_command(&text) {
        tokio::spawn(handle_cancel(Arc::clone(shared), msg));
        return;
    }

    let (command_id, args_text) = parse_slash_command(&text);

    if command_id.as_deref() == Some("file") {
        if !shared.cfg.files.enabled {
            shared
                .send_plain(
                    chat_id,
                    user_msg_id,
                    msg.thread_id,
                    "file transfer disabled; enable `[transports.telegram.files]`.",
                )
                .await;
        } else {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                file_transfer::handle_file_command(
                    &shared,
                    &msg,
                    &args_text,
                    ambient_context,
                )
                .await;
            });
        }
        return;
    }

    if msg.document.is_some() {
        if shared.cfg.files.enabled && shared.cfg.files.auto_put && text.trim().is_empty() {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                file_transfer::handle_file_put(&shared, &msg, "", ambient_context).await;
            });
        } else if shared.cfg.files.enabled {
            shared
                .send_plain(
                    chat_id,
                    user_msg_id,
                    msg.thread_id,
                    crate::files::file_put_usage(),
                )
                .await;
        }
        return;
    }

    if shared.cfg.topics.enabled && shared.topic_store.is_some() {
        match command_id.as_deref() {
            Some("ctx") => {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    topics::handle_ctx_command(&shared, &msg, &args_text).await;
                });
                return;
            }
            Some("new") => {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    topics::handle_new_command(&shared, &msg).await;
                });
                return;
            }
            Some("topic") => {
                let shared = Arc::clone(shared);
                tokio::spawn(async move {
                    topics::handle_topic_command(&shared, &msg, &args_text).await;
                });
                return;
            }
            _ => {}
        }
    }

    if let Some(command_id) = &command_id {
        let is_plugin = {
            let cache = shared.command_cache.lock().unwrap();
            !cache.reserved.contains(command_id)
        };
        if is_plugin {
            let known = {
                let cache = shared.command_cache.lock().unwrap();
                cache.command_ids.contains(command_id)
            };
            let known = if known {
                true
            } else {
                shared.refresh_command_cache();
                let cache = shared.command_cache.lock().unwrap();
                cache.command_ids.contains(command_id)
            };
            if known {
                tokio::spawn(dispatch_command(
                    Arc::clone(shared),
                    msg.clone(),
                    command_id.clone(),
                    args_text,
                ));
                return;
            }
        }
    }

    // Engine-run path.
    let runtime = shared.runtime();
    let resolved = match runtime.resolve_message(
        &text,
        msg.reply_to_text.as_deref(),
        ambient_context.as_ref(),
        Some(chat_id),
    ) {
        Ok(resolved) => resolved,
        Err(e) => {
            shared
                .send_plain(chat_id, user_msg_id, msg.thread_id, &format!("error:\n{e}"))
                .await;
            return;
        }
    };

    let mut resume_token = resolved.resume_token;
    let engine_override = resolved.engine_override;
    let context = resolved.context;

    // An explicit directive context re-binds the topic.
    if let (Some(store), Some((topic_chat, topic_thread))) = (&shared.topic_store, topic_key) {
        if resolved.context_source == ContextSource::Directives {
            if let Some(context) = &context {
                if let Err(e) = store
                    .set_context(topic_chat, topic_thread, context.clone(), None, None)
                    .await
                {
                    warn!(error = %e, "failed to store topic context");
                }
                topics::maybe_rename_topic(shared, topic_chat, topic_thread, context).await;
                ambient_context = Some(context.clone());
            }
        }
    }

    // In a topic-enabled chat an unbound topic must be bound explicitly.
    if topic_key.is_some()
        && ambient_context.is_none()
        && !matches!(
            resolved.context_source,
            ContextSource::Directives | ContextSource::ReplyCtx
        )
    {
        let hint = format!(
            "this topic isn't bound to a project yet.\n{} or {}",
            topics::usage_ctx_set(chat_project.as_deref()),
            topics::usage_topic(chat_project.as_deref()),
        );
        shared
            .send_plain(chat_id, user_msg_id, msg.thread_id, &hint)
            .await;
        return;
    }

    // A reply to a live progress message chains onto that run's session.
    if resume_token.is_none() {
        if let Some(reply_id) = msg.reply_to_message_id {
            let progress_ref = MessageRef::new(chat_id, reply_id);
            if let Some(task) = shared.running_tasks.get(&progress_ref) {
                let task = Arc::clone(task.value());
                tokio::spawn(send_with_resume(
                    Arc::clone(shared),
                    task,
                    chat_id,
                    user_msg_id,
                    msg.thread_id,
                    resolved.prompt,
                ));
                return;
            }
        }
    }

    // Topic threads continue their stored per-engine session.
    if resume_token.is_none() {
        if let (Some(store), Some((topic_chat, topic_thread))) =
            (&shared.topic_store, topic_key)
        {
            let engine =
                runtime.resolve_engine(engine_override.as_deref(), context.as_ref());
            if let Ok(Some(stored)) = store
                .get_session_resume(topic_chat, topic_thread, &engine)
                .await
            {
                resume_token = Some(stored);
            }
        }
    }

    match resume_token {
        None => {
            let shared = Arc::clone(shared);
            tokio::spawn(async move {
                run_engine_job(
                    &shared,
                    EngineJob {
                        chat_id,
                        user_msg_id,
                        text: resolved.prompt,
                        resume_token: None,
                        context,
                        engine_override,
                        thread_id: msg.thread_id,
                    },
                )
                .await;
            });
        }
        Some(resume_token) => {
            shared.scheduler().enqueue_resume(ThreadJob {
                chat_id,
                user_msg_id,
                text: resolved.prompt,
                resume_token,
                context,
                thread_id: msg.thread_id,
            });
        }
    }
}

async fn send_startup(shared: &BridgeShared) {
    let message = render_plain(&shared.cfg.startup_msg);
    if shared
        .cfg
        .exec
        .transport
        .send(shared.cfg.chat_id, &message, None)
        .await
        .is_some()
    {
        info!(chat_id = shared.cfg.chat_id, "startup message sent");
    }
}

/// Run the bridge until `cancel` fires.
pub async fn run_main_loop(
    cfg: TelegramBridgeConfig,
    runtime: TransportRuntime,
    registry: CommandRegistry,
    options: MainLoopOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let topic_store = if cfg.topics.enabled {
        let config_path = runtime.config_path().ok_or_else(|| {
            TakopiError::Config(
                "topics enabled but config path is not set; cannot locate state file.".into(),
            )
        })?;
        Some(Arc::new(TopicStateStore::new(resolve_state_path(config_path))))
    } else {
        None
    };

    let runtime = Arc::new(runtime);
    let registry = Arc::new(registry);
    let command_cache = CommandCache::build(&runtime, &registry);
    let shared = Arc::new(BridgeShared {
        cfg,
        runtime: StdRwLock::new(runtime),
        running_tasks: new_running_tasks(),
        topic_store,
        scheduler: OnceLock::new(),
        registry,
        command_cache: StdMutex::new(command_cache),
        media_groups: StdMutex::new(HashMap::new()),
    });
    let scheduler = Arc::new(ThreadScheduler::new(Arc::new(SchedulerJobRunner {
        shared: Arc::clone(&shared),
    })));
    shared
        .scheduler
        .set(scheduler)
        .unwrap_or_else(|_| unreachable!("scheduler set once"));

    if let Some(store) = &shared.topic_store {
        topics::validate_topics_setup(&shared).await?;
        info!(
            scope = topics::scope_label(&shared),
            state_path = %store.path().display(),
            "topics enabled"
        );
    }
    set_command_menu(&shared).await;

    let watch_config = options.watch_config;
    if watch_config {
        tokio::spawn(config_watcher(Arc::clone(&shared), options));
    }

    let shared_for_filter = Arc::clone(&shared);
    let mut poller = UpdatePoller::new(
        shared.cfg.bot.clone(),
        move |chat_id| allowed_chat_ids(&shared_for_filter).contains(&chat_id),
        cancel.clone(),
    );
    poller.drain_backlog().await;
    send_startup(&shared).await;

    while let Some(update) = poller.next().await {
        match update {
            TelegramIncomingUpdate::CallbackQuery(query) => {
                if query.data.as_deref() == Some(CANCEL_CALLBACK_DATA) {
                    tokio::spawn(handle_callback_cancel(Arc::clone(&shared), query));
                } else {
                    let bot = shared.cfg.bot.clone();
                    tokio::spawn(async move {
                        bot.answer_callback_query(&query.callback_query_id, None).await;
                    });
                }
            }
            TelegramIncomingUpdate::Message(msg) => {
                route_message(&shared, msg).await;
            }
        }
    }

    // Shutdown: ask every live run to stop, then wait briefly for cleanup.
    info!("shutting down, cancelling live runs");
    let tasks: Vec<_> = shared
        .running_tasks
        .iter()
        .map(|entry| Arc::clone(entry.value()))
        .collect();
    for task in &tasks {
        task.cancel_requested.cancel();
    }
    let drain = async {
        for task in &tasks {
            task.done.cancelled().await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("some runs did not finish before shutdown grace expired");
    }
    shared.cfg.exec.transport.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_command_parsing() {
        assert_eq!(parse_slash_command("/ctx set proj"), (Some("ctx".into()), "set proj".into()));
        assert_eq!(
            parse_slash_command("/file@takopi_bot get a.txt"),
            (Some("file".into()), "get a.txt".into())
        );
        assert_eq!(parse_slash_command("hello"), (None, "hello".into()));
        assert_eq!(parse_slash_command("/"), (None, "/".into()));
        let (cmd, args) = parse_slash_command("/deploy now\nwith details");
        assert_eq!(cmd.as_deref(), Some("deploy"));
        assert_eq!(args, "now\nwith details");
    }

    #[test]
    fn cancel_detection() {
        assert!(is_cancel_command("/cancel"));
        assert!(is_cancel_command("  /cancel@takopi_bot"));
        assert!(!is_cancel_command("/cancelx"));
        assert!(!is_cancel_command("cancel"));
        assert!(!is_cancel_command(""));
    }
}
