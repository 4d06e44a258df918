//! Run orchestration: one engine invocation from spawn to final frame.
//!
//! Owns the progress message, coalesces edits, publishes the resume token
//! the moment the engine declares it, honours cancellation, and guarantees
//! the [`RunningTasks`] entry is released however the run ends.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use takopi_core::context::RunContext;
use takopi_core::model::{EngineId, MessageRef, ResumeToken};
use takopi_core::transport::{RenderedMessage, SendOptions, Transport};
use takopi_engine::event::EngineEvent;
use takopi_engine::progress::ProgressTracker;
use takopi_engine::runner::{RunSpec, Runner};

use crate::presenter::TelegramPresenter;

/// Live state of one run, keyed in [`RunningTasks`] by its progress message.
pub struct RunningTask {
    pub engine: EngineId,
    pub context: Option<RunContext>,
    resume: Mutex<Option<ResumeToken>>,
    /// Fires once the resume token is known.
    pub resume_ready: CancellationToken,
    /// Set by `/cancel` or the inline button.
    pub cancel_requested: CancellationToken,
    /// Fires when the run has fully finished (final frame sent).
    pub done: CancellationToken,
}

impl RunningTask {
    fn new(engine: EngineId, context: Option<RunContext>, resume: Option<ResumeToken>) -> Self {
        let resume_ready = CancellationToken::new();
        if resume.is_some() {
            resume_ready.cancel();
        }
        Self {
            engine,
            context,
            resume: Mutex::new(resume),
            resume_ready,
            cancel_requested: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    pub fn resume(&self) -> Option<ResumeToken> {
        self.resume.lock().unwrap().clone()
    }

    fn set_resume(&self, token: ResumeToken) {
        *self.resume.lock().unwrap() = Some(token);
    }
}

/// Progress-message ref → task. One entry per live run.
pub type RunningTasks = Arc<DashMap<MessageRef, Arc<RunningTask>>>;

pub fn new_running_tasks() -> RunningTasks {
    Arc::new(DashMap::new())
}

/// Told when a run learns its engine session; the bridge routes this to the
/// scheduler and the topic store.
#[async_trait]
pub trait ResumeSink: Send + Sync {
    async fn thread_known(&self, token: &ResumeToken, done: CancellationToken);
}

#[derive(Clone)]
pub struct ExecBridgeConfig {
    pub transport: Arc<dyn Transport>,
    pub presenter: TelegramPresenter,
    /// Send the final frame as a fresh reply (notifies) instead of editing
    /// the progress message in place.
    pub final_notify: bool,
}

/// The user message that triggered the run.
#[derive(Debug, Clone)]
pub struct IncomingRun {
    pub channel_id: i64,
    pub message_id: i64,
    pub text: String,
    pub thread_id: Option<i64>,
}

enum Outcome {
    Done { answer: Option<String> },
    Error { message: String },
    Cancelled,
}

/// Render an error final frame without ever starting the engine (used when a
/// runner is configured but unavailable).
pub async fn send_runner_unavailable(
    exec: &ExecBridgeConfig,
    chat_id: i64,
    user_msg_id: i64,
    thread_id: Option<i64>,
    resume_token: Option<ResumeToken>,
    runner: &dyn Runner,
    reason: &str,
) {
    let mut tracker = ProgressTracker::new(runner.engine());
    tracker.set_resume(resume_token);
    let state = tracker.snapshot(|t| runner.format_resume(t));
    let message = exec
        .presenter
        .render_final(&state, 0.0, "error", &format!("error:\n{reason}"));
    let reply_to = MessageRef::new(chat_id, user_msg_id);
    exec.transport
        .send(
            chat_id,
            &message,
            Some(&SendOptions::reply(reply_to, thread_id)),
        )
        .await;
}

/// Drive one engine invocation to completion.
#[allow(clippy::too_many_arguments)]
pub async fn handle_message(
    exec: &ExecBridgeConfig,
    runner: Arc<dyn Runner>,
    incoming: IncomingRun,
    resume_token: Option<ResumeToken>,
    context: Option<RunContext>,
    context_line: Option<String>,
    cwd: Option<PathBuf>,
    running_tasks: Option<RunningTasks>,
    on_thread_known: Option<Arc<dyn ResumeSink>>,
    strip_resume_line: Option<Arc<dyn Fn(&str) -> bool + Send + Sync>>,
) {
    let engine = runner.engine().to_string();
    let started_at = Instant::now();

    // A pasted resume line in the prompt is routing, not prose.
    let prompt = match &strip_resume_line {
        Some(is_resume) => incoming
            .text
            .lines()
            .filter(|line| !is_resume(line))
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string(),
        None => incoming.text.clone(),
    };

    let mut tracker = ProgressTracker::new(engine.clone());
    tracker.set_context_line(context_line);
    tracker.set_resume(resume_token.clone());

    let run_cancel = CancellationToken::new();
    let spec = RunSpec {
        prompt,
        resume: resume_token.clone(),
        cwd,
        cancel: run_cancel.clone(),
    };

    let mut events = match runner.run(spec).await {
        Ok(events) => events,
        Err(e) => {
            error!(engine = %engine, error = %e, "engine failed to start");
            send_runner_unavailable(
                exec,
                incoming.channel_id,
                incoming.message_id,
                incoming.thread_id,
                resume_token,
                runner.as_ref(),
                &e.to_string(),
            )
            .await;
            return;
        }
    };

    // Initial progress message; its ref keys the running task.
    let runner_fmt = Arc::clone(&runner);
    let resume_formatter = move |t: &ResumeToken| runner_fmt.format_resume(t);
    let initial = exec.presenter.render_progress(
        &tracker.snapshot(&resume_formatter),
        0.0,
        "working",
    );
    let user_ref = MessageRef::new(incoming.channel_id, incoming.message_id);
    let progress_ref = exec
        .transport
        .send(
            incoming.channel_id,
            &initial,
            Some(&SendOptions {
                reply_to: Some(user_ref),
                notify: false,
                thread_id: incoming.thread_id,
            }),
        )
        .await;
    if progress_ref.is_none() {
        warn!(engine = %engine, "progress message failed to send");
    }

    let task = Arc::new(RunningTask::new(
        engine.clone(),
        context,
        resume_token.clone(),
    ));
    if let (Some(tasks), Some(progress_ref)) = (&running_tasks, progress_ref) {
        tasks.insert(progress_ref, Arc::clone(&task));
    }
    if let (Some(sink), Some(token)) = (&on_thread_known, &resume_token) {
        sink.thread_known(token, task.done.clone()).await;
    }

    // Editor task: one edit in flight, last snapshot wins.
    let (edit_tx, mut edit_rx) = watch::channel::<Option<RenderedMessage>>(None);
    let editor = progress_ref.map(|progress_ref| {
        let transport = Arc::clone(&exec.transport);
        tokio::spawn(async move {
            while edit_rx.changed().await.is_ok() {
                let message = edit_rx.borrow_and_update().clone();
                if let Some(message) = message {
                    transport.edit(progress_ref, &message, true).await;
                }
            }
        })
    });

    let outcome = loop {
        tokio::select! {
            _ = task.cancel_requested.cancelled() => {
                run_cancel.cancel();
                break Outcome::Cancelled;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    break Outcome::Error {
                        message: "engine stream ended unexpectedly".to_string(),
                    };
                };
                match event {
                    EngineEvent::Started(started) => {
                        let new_resume = started.resume.clone();
                        tracker.note_event(&EngineEvent::Started(started));
                        if let Some(token) = new_resume {
                            task.set_resume(token.clone());
                            task.resume_ready.cancel();
                            if let Some(sink) = &on_thread_known {
                                sink.thread_known(&token, task.done.clone()).await;
                            }
                        }
                        let state = tracker.snapshot(&resume_formatter);
                        let message = exec.presenter.render_progress(
                            &state,
                            started_at.elapsed().as_secs_f64(),
                            "working",
                        );
                        let _ = edit_tx.send(Some(message));
                    }
                    EngineEvent::Action(_) => {
                        if tracker.note_event(&event) {
                            let state = tracker.snapshot(&resume_formatter);
                            let message = exec.presenter.render_progress(
                                &state,
                                started_at.elapsed().as_secs_f64(),
                                "working",
                            );
                            let _ = edit_tx.send(Some(message));
                        }
                    }
                    EngineEvent::TurnEnd { answer } => break Outcome::Done { answer },
                    EngineEvent::Failed { message } => break Outcome::Error { message },
                    EngineEvent::Unknown { .. } => {}
                }
            }
        }
    };

    // Flush the editor before the terminal frame so the final edit is last.
    drop(edit_tx);
    if let Some(editor) = editor {
        let _ = editor.await;
    }

    let elapsed = started_at.elapsed().as_secs_f64();
    let state = tracker.snapshot(&resume_formatter);
    match outcome {
        Outcome::Cancelled => {
            info!(engine = %engine, "run cancelled");
            let message = exec.presenter.render_progress(&state, elapsed, "cancelled");
            if let Some(progress_ref) = progress_ref {
                exec.transport.edit(progress_ref, &message, true).await;
            }
        }
        Outcome::Done { answer } => {
            let answer = answer.unwrap_or_default();
            let message = exec.presenter.render_final(&state, elapsed, "done", &answer);
            deliver_final(exec, &incoming, progress_ref, message).await;
        }
        Outcome::Error { message } => {
            warn!(engine = %engine, error = %message, "run failed");
            let frame = exec.presenter.render_final(
                &state,
                elapsed,
                "error",
                &format!("error:\n{message}"),
            );
            deliver_final(exec, &incoming, progress_ref, frame).await;
        }
    }

    if let (Some(tasks), Some(progress_ref)) = (&running_tasks, progress_ref) {
        tasks.remove(&progress_ref);
    }
    task.done.cancel();
}

/// Final frame delivery: a fresh notifying reply (and the progress message
/// removed) when `final_notify` is on, an in-place edit otherwise.
async fn deliver_final(
    exec: &ExecBridgeConfig,
    incoming: &IncomingRun,
    progress_ref: Option<MessageRef>,
    message: RenderedMessage,
) {
    let user_ref = MessageRef::new(incoming.channel_id, incoming.message_id);
    if exec.final_notify || progress_ref.is_none() {
        let sent = exec
            .transport
            .send(
                incoming.channel_id,
                &message,
                Some(&SendOptions::reply(user_ref, incoming.thread_id)),
            )
            .await;
        if let (Some(_), Some(progress_ref)) = (sent, progress_ref) {
            exec.transport.delete(progress_ref).await;
        }
    } else if let Some(progress_ref) = progress_ref {
        exec.transport.edit(progress_ref, &message, true).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use takopi_engine::event::{Action, ActionKind, ActionPhase, StartedEvent};
    use takopi_engine::script::ScriptRunner;

    #[derive(Default)]
    struct CaptureTransport {
        next_id: AtomicI64,
        pub sent: Mutex<Vec<(i64, RenderedMessage)>>,
        pub edits: Mutex<Vec<(MessageRef, RenderedMessage)>>,
        pub deleted: Mutex<Vec<MessageRef>>,
    }

    #[async_trait]
    impl Transport for CaptureTransport {
        async fn send(
            &self,
            channel_id: i64,
            message: &RenderedMessage,
            _options: Option<&SendOptions>,
        ) -> Option<MessageRef> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.sent.lock().unwrap().push((channel_id, message.clone()));
            Some(MessageRef::new(channel_id, id))
        }

        async fn edit(
            &self,
            message_ref: MessageRef,
            message: &RenderedMessage,
            _wait: bool,
        ) -> Option<MessageRef> {
            self.edits.lock().unwrap().push((message_ref, message.clone()));
            Some(message_ref)
        }

        async fn delete(&self, message_ref: MessageRef) -> bool {
            self.deleted.lock().unwrap().push(message_ref);
            true
        }

        async fn send_document(
            &self,
            _channel_id: i64,
            _filename: &str,
            _content: Vec<u8>,
            _reply_to: Option<MessageRef>,
            _thread_id: Option<i64>,
        ) -> Option<MessageRef> {
            None
        }

        async fn close(&self) {}
    }

    struct RecordingSink {
        tokens: Mutex<Vec<ResumeToken>>,
    }

    #[async_trait]
    impl ResumeSink for RecordingSink {
        async fn thread_known(&self, token: &ResumeToken, _done: CancellationToken) {
            self.tokens.lock().unwrap().push(token.clone());
        }
    }

    fn exec_with(transport: Arc<CaptureTransport>, final_notify: bool) -> ExecBridgeConfig {
        ExecBridgeConfig {
            transport,
            presenter: TelegramPresenter,
            final_notify,
        }
    }

    fn incoming() -> IncomingRun {
        IncomingRun {
            channel_id: 10,
            message_id: 1,
            text: "write README".into(),
            thread_id: None,
        }
    }

    fn scripted_run() -> ScriptRunner {
        ScriptRunner::new(
            "codex",
            vec![
                EngineEvent::Started(StartedEvent {
                    engine: "codex".into(),
                    title: None,
                    resume: Some(ResumeToken::new("codex", "r1")),
                }),
                EngineEvent::action(
                    Action::new("c1", ActionKind::Command, "cargo test"),
                    ActionPhase::Completed,
                    Some(true),
                ),
                EngineEvent::TurnEnd {
                    answer: Some("done".into()),
                },
            ],
        )
    }

    #[tokio::test]
    async fn fresh_run_publishes_resume_and_releases_task() {
        let transport = Arc::new(CaptureTransport::default());
        let exec = exec_with(Arc::clone(&transport), true);
        let tasks = new_running_tasks();
        let sink = Arc::new(RecordingSink {
            tokens: Mutex::new(Vec::new()),
        });

        handle_message(
            &exec,
            Arc::new(scripted_run()),
            incoming(),
            None,
            None,
            None,
            None,
            Some(Arc::clone(&tasks)),
            Some(sink.clone() as Arc<dyn ResumeSink>),
            None,
        )
        .await;

        assert!(tasks.is_empty());
        assert_eq!(sink.tokens.lock().unwrap().as_slice(), [ResumeToken::new("codex", "r1")]);

        // Final frame is a new message carrying the answer and resume line,
        // and the progress message is removed.
        let sent = transport.sent.lock().unwrap();
        let last = &sent.last().unwrap().1;
        assert!(last.text.contains("done"));
        assert!(last.text.contains("codex resume r1"));
        assert_eq!(transport.deleted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn without_final_notify_the_progress_message_is_edited() {
        let transport = Arc::new(CaptureTransport::default());
        let exec = exec_with(Arc::clone(&transport), false);

        handle_message(
            &exec,
            Arc::new(scripted_run()),
            incoming(),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await;

        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        let edits = transport.edits.lock().unwrap();
        let last = &edits.last().unwrap().1;
        assert!(last.text.contains("done"));
        assert!(transport.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_renders_cancelled_and_clears_markup() {
        let transport = Arc::new(CaptureTransport::default());
        let exec = exec_with(Arc::clone(&transport), true);
        let tasks = new_running_tasks();

        let slow = ScriptRunner::new(
            "codex",
            vec![EngineEvent::TurnEnd {
                answer: Some("too late".into()),
            }],
        )
        .with_delay(std::time::Duration::from_secs(5));

        let exec2 = exec.clone();
        let tasks2 = Arc::clone(&tasks);
        let run = tokio::spawn(async move {
            handle_message(
                &exec2,
                Arc::new(slow),
                incoming(),
                None,
                None,
                None,
                None,
                Some(tasks2),
                None,
                None,
            )
            .await;
        });

        // Wait for the progress message, then press cancel.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let task = {
            let entry = tasks.iter().next().expect("running task registered");
            Arc::clone(entry.value())
        };
        task.cancel_requested.cancel();
        run.await.unwrap();

        assert!(tasks.is_empty());
        assert!(task.done.is_cancelled());
        let edits = transport.edits.lock().unwrap();
        let last = &edits.last().unwrap().1;
        assert!(last.text.contains("cancelled"));
        let markup = last.extra.get("reply_markup").unwrap();
        assert!(markup["inline_keyboard"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn engine_failure_renders_error_frame() {
        let transport = Arc::new(CaptureTransport::default());
        let exec = exec_with(Arc::clone(&transport), false);

        let failing = ScriptRunner::new(
            "codex",
            vec![EngineEvent::Failed {
                message: "boom".into(),
            }],
        );

        handle_message(
            &exec,
            Arc::new(failing),
            incoming(),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
        )
        .await;

        let edits = transport.edits.lock().unwrap();
        let last = &edits.last().unwrap().1;
        assert!(last.text.contains("error"));
        assert!(last.text.contains("boom"));
    }

    #[tokio::test]
    async fn resume_lines_are_stripped_from_the_prompt() {
        let transport = Arc::new(CaptureTransport::default());
        let exec = exec_with(Arc::clone(&transport), false);
        let runner = Arc::new(ScriptRunner::answering("codex", "ok"));
        let prompts = runner.prompts();

        let mut msg = incoming();
        msg.text = "more work\nresume: `codex exec resume r1`".into();
        handle_message(
            &exec,
            runner,
            msg,
            None,
            None,
            None,
            None,
            None,
            None,
            Some(Arc::new(|line: &str| line.contains("resume:"))),
        )
        .await;

        assert_eq!(prompts.lock().unwrap().as_slice(), ["more work"]);
    }
}
