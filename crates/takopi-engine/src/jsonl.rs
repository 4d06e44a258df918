//! Shared subprocess driver for JSONL-speaking engine CLIs.

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use takopi_core::error::Result;

use crate::event::EngineEvent;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const STDERR_TAIL_BYTES: usize = 4096;

/// Per-engine translation of one JSON line into zero or more events.
pub(crate) trait Translator: Send + 'static {
    fn engine(&self) -> &str;

    fn translate(&mut self, value: serde_json::Value) -> Vec<EngineEvent>;

    /// Called when the stream ends without a terminal event. Returns the
    /// diagnostic for the failure frame.
    fn exit_diagnostic(&mut self, status: Option<std::process::ExitStatus>, stderr_tail: &str)
        -> String {
        let status = status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown status".to_string());
        let tail = stderr_tail.trim();
        if tail.is_empty() {
            format!("{} exited without a final answer ({status})", self.engine())
        } else {
            format!(
                "{} exited without a final answer ({status})\n{tail}",
                self.engine()
            )
        }
    }
}

/// Spawn `command` and stream translated events until the child exits, a
/// terminal event is seen, or `cancel` fires (which kills the child).
pub(crate) fn spawn_translated(
    mut command: Command,
    cancel: CancellationToken,
    mut translator: Box<dyn Translator>,
) -> Result<mpsc::Receiver<EngineEvent>> {
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = child.stdout.take().ok_or_else(|| {
        std::io::Error::other("engine child has no stdout")
    })?;
    let stderr = child.stderr.take();

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let stderr_task = tokio::spawn(async move {
        let mut tail = Vec::new();
        if let Some(mut stderr) = stderr {
            let mut buf = [0u8; 1024];
            while let Ok(n) = stderr.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let cut = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..cut);
                }
            }
        }
        String::from_utf8_lossy(&tail).into_owned()
    });

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let mut terminal_seen = false;
        let mut cancelled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !cancelled => {
                    debug!(engine = translator.engine(), "cancel requested, killing engine");
                    cancelled = true;
                    let _ = child.start_kill();
                }
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            warn!(engine = translator.engine(), error = %e, "engine stdout read failed");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value: serde_json::Value = match serde_json::from_str(&line) {
                        Ok(value) => value,
                        Err(_) => {
                            warn!(engine = translator.engine(), line = %line, "dropping non-JSON engine line");
                            continue;
                        }
                    };
                    for event in translator.translate(value) {
                        match &event {
                            EngineEvent::TurnEnd { .. } | EngineEvent::Failed { .. } => {
                                terminal_seen = true;
                            }
                            EngineEvent::Unknown { payload } => {
                                warn!(engine = translator.engine(), %payload, "unknown engine event");
                                continue;
                            }
                            _ => {}
                        }
                        if tx.send(event).await.is_err() {
                            let _ = child.start_kill();
                            return;
                        }
                    }
                }
            }
        }

        let status = child.wait().await.ok();
        let stderr_tail = stderr_task.await.unwrap_or_default();
        if !terminal_seen && !cancelled {
            let message = translator.exit_diagnostic(status, &stderr_tail);
            let _ = tx.send(EngineEvent::Failed { message }).await;
        }
    });

    Ok(rx)
}
