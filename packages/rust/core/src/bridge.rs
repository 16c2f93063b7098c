//! Long-lived collaborator subprocess speaking JSON lines over stdin/stdout.
//!
//! Protocol:
//! - bridge → `{"type":"ready"}` once after start
//! - host → `{"type":"request","id":"req-N","task":…,"context":…,"model":…}`
//! - bridge → `{"type":"result","id":"req-N","payload":…,"model":…}` or
//!   `{"type":"error","id":"req-N","error":"…"}`
//! - host → `{"type":"shutdown"}`
//!
//! The process is spawned lazily on the first call. If a caller gives up on
//! a request (timeout) after it was written, the late reply is discarded by id
//! on the next call. If it gives up while the request is still being written,
//! stdin holds a partial line and the process is restarted on the next call.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use appraisal_shared::{AppraisalError, CollaboratorConfig, Result};

use crate::collaborator::{Collaborator, CollaboratorRequest, CollaboratorResponse, excerpt};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    Request {
        id: &'a str,
        task: &'a str,
        context: &'a serde_json::Value,
        model: &'a str,
    },
    Shutdown,
}

#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: String,
        payload: serde_json::Value,
        #[serde(default)]
        model: Option<String>,
    },
    Error {
        id: String,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// How to start the bridge process.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub model: String,
}

impl From<&CollaboratorConfig> for BridgeConfig {
    fn from(c: &CollaboratorConfig) -> Self {
        Self {
            program: c.bridge_cmd.clone(),
            args: vec!["run".into(), c.bridge_script.clone()],
            working_dir: c.bridge_working_dir.as_ref().map(PathBuf::from),
            model: c.model.clone(),
        }
    }
}

fn bridge_err(msg: impl Into<String>) -> AppraisalError {
    AppraisalError::Collaborator(msg.into())
}

// ---------------------------------------------------------------------------
// Process handle
// ---------------------------------------------------------------------------

struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    // `next_line` is cancel-safe, so an abandoned read loses no data.
    lines: Lines<BufReader<ChildStdout>>,
    /// Set while a message is being written. Still set on the next call means
    /// the write was abandoned or failed part way.
    writing: bool,
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig) -> Result<Self> {
        info!(program = %config.program, args = ?config.args, "spawning collaborator bridge");

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Bridge logs go to parent stderr
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            bridge_err(format!(
                "failed to spawn bridge: {e}. Is `{}` installed?",
                config.program
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| bridge_err("failed to capture bridge stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| bridge_err("failed to capture bridge stdout"))?;

        let mut handle = Self {
            child,
            stdin,
            lines: BufReader::new(stdout).lines(),
            writing: false,
        };
        handle.wait_for_ready().await?;
        Ok(handle)
    }

    async fn wait_for_ready(&mut self) -> Result<()> {
        let line = self.next_line().await?;
        match serde_json::from_str::<ResponseMessage>(line.trim()) {
            Ok(ResponseMessage::Ready) => {
                info!("bridge is ready");
                Ok(())
            }
            Ok(_) => Err(bridge_err(format!("expected ready message, got: {line}"))),
            Err(e) => Err(bridge_err(format!(
                "invalid bridge ready message: {e} (got: {line})"
            ))),
        }
    }

    async fn next_line(&mut self) -> Result<String> {
        self.lines
            .next_line()
            .await
            .map_err(|e| bridge_err(format!("bridge read error: {e}")))?
            .ok_or_else(|| bridge_err("bridge closed stdout unexpectedly"))
    }

    async fn send(&mut self, message: &RequestMessage<'_>) -> Result<()> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| bridge_err(format!("failed to serialize request: {e}")))?;
        json.push('\n');
        self.writing = true;
        self.stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| bridge_err(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| bridge_err(format!("failed to flush bridge stdin: {e}")))?;
        self.writing = false;
        Ok(())
    }

    /// Read until the reply for `id` arrives, dropping replies to abandoned requests.
    async fn receive(&mut self, id: &str) -> Result<(serde_json::Value, Option<String>)> {
        loop {
            let line = self.next_line().await?;
            let message: ResponseMessage = serde_json::from_str(line.trim()).map_err(|e| {
                bridge_err(format!(
                    "invalid bridge response: {e} (got: {})",
                    excerpt(&line)
                ))
            })?;

            match message {
                ResponseMessage::Result {
                    id: reply_id,
                    payload,
                    model,
                } if reply_id == id => return Ok((payload, model)),
                ResponseMessage::Error {
                    id: reply_id,
                    error,
                } if reply_id == id => return Err(bridge_err(error)),
                ResponseMessage::Result { id: stale, .. }
                | ResponseMessage::Error { id: stale, .. } => {
                    debug!(%stale, expected = %id, "discarding stale bridge reply");
                }
                ResponseMessage::Ready => {
                    return Err(bridge_err("unexpected ready message during request"));
                }
            }
        }
    }

    async fn kill(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("bridge kill error: {e}");
        }
    }

    async fn shutdown(mut self) {
        if self.send(&RequestMessage::Shutdown).await.is_err() {
            warn!("bridge stdin already closed");
        }
        match self.child.wait().await {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator
// ---------------------------------------------------------------------------

struct BridgeState {
    handle: Option<BridgeHandle>,
    request_counter: u64,
}

/// Collaborator backed by a long-lived bridge process.
pub struct BridgeCollaborator {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl BridgeCollaborator {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BridgeState {
                handle: None,
                request_counter: 0,
            }),
        }
    }

    /// Ask the bridge to exit and wait for it. Safe to call when never started.
    pub async fn shutdown(&self) {
        let handle = self.state.lock().await.handle.take();
        match handle {
            Some(handle) if handle.writing => handle.kill().await,
            Some(handle) => handle.shutdown().await,
            None => {}
        }
    }
}

#[async_trait]
impl Collaborator for BridgeCollaborator {
    async fn call(&self, request: &CollaboratorRequest) -> Result<CollaboratorResponse> {
        let mut state = self.state.lock().await;

        state.request_counter += 1;
        let id = format!("req-{}", state.request_counter);

        if state.handle.as_ref().is_some_and(|h| h.writing) {
            warn!("previous request was cut off mid-write, restarting bridge");
            if let Some(handle) = state.handle.take() {
                handle.kill().await;
            }
        }
        if state.handle.is_none() {
            state.handle = Some(BridgeHandle::spawn(&self.config).await?);
        }
        let Some(handle) = state.handle.as_mut() else {
            return Err(bridge_err("bridge not running"));
        };

        let message = RequestMessage::Request {
            id: &id,
            task: &request.task,
            context: &request.context,
            model: &self.config.model,
        };

        let outcome = match handle.send(&message).await {
            Ok(()) => handle.receive(&id).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok((payload, model)) => Ok(CollaboratorResponse {
                payload,
                model: model.unwrap_or_else(|| self.config.model.clone()),
            }),
            Err(e) => {
                // A broken pipe or closed stdout means the process is gone; respawn next time.
                if matches!(handle.child.try_wait(), Ok(Some(_))) {
                    warn!(error = %e, "bridge exited, will respawn on next call");
                    state.handle = None;
                }
                Err(e)
            }
        }
    }

    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}
