use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use takopi_core::context::RunContext;
use takopi_core::model::ResumeToken;

use crate::types::{Result, StateFile, StoreError, TopicThreadSnapshot, STATE_VERSION};

/// Disk-backed topic state. All mutation funnels through one async mutex;
/// each mutation rewrites the whole document atomically.
pub struct TopicStateStore {
    path: PathBuf,
    state: Mutex<Option<StateFile>>,
}

impl TopicStateStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn load_file(&self) -> Result<StateFile> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StateFile::default())
            }
            Err(e) => return Err(StoreError::Read(e)),
        };
        let state: StateFile = serde_json::from_str(&raw)?;
        if state.version != STATE_VERSION {
            return Err(StoreError::Version(state.version));
        }
        Ok(state)
    }

    fn persist(&self, state: &StateFile) -> Result<()> {
        let payload = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(StoreError::Write)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, payload).map_err(StoreError::Write)?;
        std::fs::rename(&tmp, &self.path).map_err(StoreError::Write)?;
        Ok(())
    }

    async fn with_state<T>(
        &self,
        mutate: impl FnOnce(&mut StateFile) -> (T, bool),
    ) -> Result<T> {
        let mut guard = self.state.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_file()?);
        }
        let state = guard.as_mut().expect("state loaded above");
        let (value, dirty) = mutate(state);
        if dirty {
            self.persist(state)?;
        }
        Ok(value)
    }

    pub async fn get_thread(
        &self,
        chat_id: i64,
        thread_id: i64,
    ) -> Result<Option<TopicThreadSnapshot>> {
        self.with_state(|state| {
            let snapshot = state
                .chats
                .get(&chat_id.to_string())
                .and_then(|threads| threads.get(&thread_id.to_string()))
                .cloned();
            (snapshot, false)
        })
        .await
    }

    pub async fn get_context(&self, chat_id: i64, thread_id: i64) -> Result<Option<RunContext>> {
        Ok(self
            .get_thread(chat_id, thread_id)
            .await?
            .and_then(|snapshot| snapshot.context))
    }

    pub async fn set_context(
        &self,
        chat_id: i64,
        thread_id: i64,
        context: RunContext,
        topic_title: Option<String>,
        created_by_bot: Option<bool>,
    ) -> Result<()> {
        self.with_state(|state| {
            let snapshot = state
                .chats
                .entry(chat_id.to_string())
                .or_default()
                .entry(thread_id.to_string())
                .or_default();
            snapshot.context = Some(context);
            if let Some(title) = topic_title {
                snapshot.topic_title = Some(title);
            }
            if let Some(created) = created_by_bot {
                snapshot.created_by_bot = created;
            }
            ((), true)
        })
        .await?;
        debug!(chat_id, thread_id, "topic context bound");
        Ok(())
    }

    pub async fn clear_context(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.mutate_thread(chat_id, thread_id, |snapshot| {
            snapshot.context = None;
        })
        .await
    }

    pub async fn clear_sessions(&self, chat_id: i64, thread_id: i64) -> Result<()> {
        self.mutate_thread(chat_id, thread_id, |snapshot| {
            snapshot.sessions.clear();
        })
        .await
    }

    pub async fn get_session_resume(
        &self,
        chat_id: i64,
        thread_id: i64,
        engine: &str,
    ) -> Result<Option<ResumeToken>> {
        Ok(self
            .get_thread(chat_id, thread_id)
            .await?
            .and_then(|snapshot| snapshot.session_resume(engine)))
    }

    pub async fn set_session_resume(
        &self,
        chat_id: i64,
        thread_id: i64,
        token: &ResumeToken,
    ) -> Result<()> {
        let engine = token.engine.clone();
        let value = token.value.clone();
        self.with_state(move |state| {
            let snapshot = state
                .chats
                .entry(chat_id.to_string())
                .or_default()
                .entry(thread_id.to_string())
                .or_default();
            snapshot.sessions.insert(engine, value);
            ((), true)
        })
        .await
    }

    /// Find the thread already bound to `context` in `chat_id`, if any.
    pub async fn find_thread_for_context(
        &self,
        chat_id: i64,
        context: &RunContext,
    ) -> Result<Option<i64>> {
        let context = context.clone();
        self.with_state(move |state| {
            let found = state
                .chats
                .get(&chat_id.to_string())
                .and_then(|threads| {
                    threads.iter().find_map(|(thread_id, snapshot)| {
                        (snapshot.context.as_ref() == Some(&context))
                            .then(|| thread_id.parse::<i64>().ok())
                            .flatten()
                    })
                });
            (found, false)
        })
        .await
    }

    async fn mutate_thread(
        &self,
        chat_id: i64,
        thread_id: i64,
        mutate: impl FnOnce(&mut TopicThreadSnapshot),
    ) -> Result<()> {
        self.with_state(|state| {
            let Some(threads) = state.chats.get_mut(&chat_id.to_string()) else {
                return ((), false);
            };
            let Some(snapshot) = threads.get_mut(&thread_id.to_string()) else {
                return ((), false);
            };
            mutate(snapshot);
            if snapshot.is_empty() {
                threads.remove(&thread_id.to_string());
                if threads.is_empty() {
                    state.chats.remove(&chat_id.to_string());
                }
            }
            ((), true)
        })
        .await
    }

    /// Drop the cached document so the next access re-reads the file.
    pub async fn invalidate(&self) {
        let mut guard = self.state.lock().await;
        if guard.take().is_some() {
            warn!(path = %self.path.display(), "topic state cache invalidated");
        }
    }
}
