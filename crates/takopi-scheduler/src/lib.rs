//! Per-session scheduling of resume follow-ups.
//!
//! An engine session is identified by its resume token (engine-qualified,
//! see [`ResumeToken::session_key`]). Follow-ups that reference the same
//! session run strictly FIFO; unrelated sessions run in parallel. Fresh
//! (non-resume) runs never pass through the scheduler.
//!
//! A session's key becomes known mid-run: the run orchestrator calls
//! [`ThreadScheduler::note_thread_known`] as soon as the engine declares its
//! token. Follow-ups enqueued before that point start their own worker
//! immediately; follow-ups after it queue behind the active run.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use takopi_core::context::RunContext;
use takopi_core::model::ResumeToken;

/// One queued follow-up.
#[derive(Debug, Clone)]
pub struct ThreadJob {
    pub chat_id: i64,
    pub user_msg_id: i64,
    pub text: String,
    pub resume_token: ResumeToken,
    pub context: Option<RunContext>,
    pub thread_id: Option<i64>,
}

/// Executes one job to completion (the run's final frame has been sent when
/// this returns).
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: ThreadJob);
}

#[derive(Default)]
struct ThreadState {
    queue: VecDeque<ThreadJob>,
    worker_active: bool,
    /// Latch of the run currently holding this session, fired on completion.
    run_done: Option<CancellationToken>,
}

#[derive(Default)]
struct Inner {
    threads: HashMap<String, ThreadState>,
}

pub struct ThreadScheduler {
    inner: Arc<Mutex<Inner>>,
    runner: Arc<dyn JobRunner>,
}

impl ThreadScheduler {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            runner,
        }
    }

    /// Record that `token` names a live engine session whose current run
    /// completes when `done` fires. Later follow-ups for the token queue
    /// behind that run.
    pub fn note_thread_known(&self, token: &ResumeToken, done: CancellationToken) {
        let key = token.session_key();
        let mut inner = self.inner.lock().unwrap();
        let state = inner.threads.entry(key.clone()).or_default();
        state.run_done = Some(done);
        debug!(session = %key, "engine thread known");
    }

    /// Enqueue a follow-up. Known sessions queue FIFO behind the active run;
    /// unknown sessions start immediately (the run itself will publish the
    /// session via `note_thread_known`).
    pub fn enqueue_resume(&self, job: ThreadJob) {
        let key = job.resume_token.session_key();
        let start_worker = {
            let mut inner = self.inner.lock().unwrap();
            match inner.threads.get_mut(&key) {
                Some(state) => {
                    state.queue.push_back(job);
                    if state.worker_active {
                        false
                    } else {
                        state.worker_active = true;
                        true
                    }
                }
                None => {
                    // Unknown session: run now, outside any queue.
                    let runner = Arc::clone(&self.runner);
                    tokio::spawn(async move {
                        runner.run(job).await;
                    });
                    return;
                }
            }
        };
        if start_worker {
            self.spawn_worker(key);
        }
    }

    fn spawn_worker(&self, key: String) {
        let inner = Arc::clone(&self.inner);
        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            debug!(session = %key, "session worker started");
            loop {
                // Wait out any run currently holding the session.
                let pending_done = {
                    let mut guard = inner.lock().unwrap();
                    guard
                        .threads
                        .get_mut(&key)
                        .and_then(|state| state.run_done.take())
                };
                if let Some(done) = pending_done {
                    done.cancelled().await;
                    continue;
                }

                let job = {
                    let mut guard = inner.lock().unwrap();
                    let Some(state) = guard.threads.get_mut(&key) else {
                        return;
                    };
                    match state.queue.pop_front() {
                        Some(job) => Some(job),
                        None => {
                            state.worker_active = false;
                            None
                        }
                    }
                };
                match job {
                    Some(job) => runner.run(job).await,
                    None => {
                        debug!(session = %key, "session worker idle");
                        return;
                    }
                }
            }
        });
    }

    /// Number of sessions with queued or active work (diagnostics).
    pub fn active_sessions(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .threads
            .values()
            .filter(|s| s.worker_active || !s.queue.is_empty())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    struct RecordingRunner {
        log: Arc<AsyncMutex<Vec<String>>>,
        delay: Duration,
        scheduler_done: Arc<Mutex<Option<Arc<ThreadScheduler>>>>,
    }

    #[async_trait]
    impl JobRunner for RecordingRunner {
        async fn run(&self, job: ThreadJob) {
            tokio::time::sleep(self.delay).await;
            self.log.lock().await.push(job.text.clone());
            // Mimic the orchestrator: publish the session and fire done.
            if let Some(scheduler) = self.scheduler_done.lock().unwrap().clone() {
                let done = CancellationToken::new();
                scheduler.note_thread_known(&job.resume_token, done.clone());
                done.cancel();
            }
        }
    }

    fn make_scheduler(delay: Duration) -> (Arc<ThreadScheduler>, Arc<AsyncMutex<Vec<String>>>) {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let holder = Arc::new(Mutex::new(None));
        let runner = Arc::new(RecordingRunner {
            log: Arc::clone(&log),
            delay,
            scheduler_done: Arc::clone(&holder),
        });
        let scheduler = Arc::new(ThreadScheduler::new(runner));
        *holder.lock().unwrap() = Some(Arc::clone(&scheduler));
        (scheduler, log)
    }

    fn job(token: &ResumeToken, text: &str) -> ThreadJob {
        ThreadJob {
            chat_id: 1,
            user_msg_id: 1,
            text: text.to_string(),
            resume_token: token.clone(),
            context: None,
            thread_id: None,
        }
    }

    #[tokio::test]
    async fn fifo_within_one_session() {
        let (scheduler, log) = make_scheduler(Duration::from_millis(10));
        let token = ResumeToken::new("codex", "s1");
        // The session is known and its original run has already finished.
        let done = CancellationToken::new();
        scheduler.note_thread_known(&token, done.clone());
        done.cancel();
        for i in 0..5 {
            scheduler.enqueue_resume(job(&token, &format!("m{i}")));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        let log = log.lock().await;
        assert_eq!(log.as_slice(), ["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn queued_job_waits_for_active_run() {
        let (scheduler, log) = make_scheduler(Duration::from_millis(5));
        let token = ResumeToken::new("codex", "s2");
        let done = CancellationToken::new();
        scheduler.note_thread_known(&token, done.clone());
        scheduler.enqueue_resume(job(&token, "follow-up"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(log.lock().await.is_empty());
        done.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().await.as_slice(), ["follow-up"]);
    }

    #[tokio::test]
    async fn unknown_session_runs_immediately() {
        let (scheduler, log) = make_scheduler(Duration::from_millis(1));
        let token = ResumeToken::new("codex", "brand-new");
        scheduler.enqueue_resume(job(&token, "first"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().await.as_slice(), ["first"]);
    }

    #[tokio::test]
    async fn distinct_sessions_run_in_parallel() {
        let (scheduler, log) = make_scheduler(Duration::from_millis(50));
        let a = ResumeToken::new("codex", "a");
        let b = ResumeToken::new("codex", "b");
        let started = std::time::Instant::now();
        scheduler.enqueue_resume(job(&a, "a"));
        scheduler.enqueue_resume(job(&b, "b"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(log.lock().await.len(), 2);
        // Serial execution would need ~100ms.
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn worker_restarts_after_idle() {
        let (scheduler, log) = make_scheduler(Duration::from_millis(1));
        let token = ResumeToken::new("codex", "s3");
        let done = CancellationToken::new();
        scheduler.note_thread_known(&token, done.clone());
        done.cancel();
        scheduler.enqueue_resume(job(&token, "one"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.enqueue_resume(job(&token, "two"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(log.lock().await.as_slice(), ["one", "two"]);
    }
}
