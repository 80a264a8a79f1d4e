//! The IDE host: debug sessions and node terminals.
//!
//! The host is reached through [`DebugHost`]. [`JsonLinesHost`] speaks a small
//! line-delimited JSON protocol so an IDE extension can run this crate's
//! binary as a sidecar: requests go out on one stream, and responses and
//! notifications come back on the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::debug_config::DebugConfiguration;
use crate::group::{GroupEvent, GroupHandle};

/// Host-assigned identifier of a debug session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a node output terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TerminalId(pub u64);

/// Operations the orchestrator needs from the host.
///
/// Session and terminal notifications flow the other way, as
/// [`GroupEvent`]s posted to the group inbox.
#[async_trait]
pub trait DebugHost: Send + Sync {
    /// Asks the host to start a debug session. `Ok(false)` means refused.
    async fn start_session(&self, config: &DebugConfiguration) -> Result<bool>;
    async fn stop_session(&self, session: &SessionId) -> Result<()>;
    async fn open_terminal(&self, name: &str) -> Result<TerminalId>;
    async fn write_terminal(&self, terminal: TerminalId, text: &str) -> Result<()>;
    async fn close_terminal(&self, terminal: TerminalId) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct Outgoing<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Incoming {
    Response {
        id: u64,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Notification(HostNotification),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum HostNotification {
    SessionStarted { session: SessionId },
    SessionStopped { session: SessionId },
    TerminalClosed { terminal: TerminalId },
    Shutdown,
}

impl From<HostNotification> for GroupEvent {
    fn from(notification: HostNotification) -> Self {
        match notification {
            HostNotification::SessionStarted { session } => GroupEvent::SessionStarted(session),
            HostNotification::SessionStopped { session } => GroupEvent::SessionStopped(session),
            HostNotification::TerminalClosed { terminal } => GroupEvent::TerminalClosed(terminal),
            HostNotification::Shutdown => GroupEvent::Shutdown,
        }
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// [`DebugHost`] over line-delimited JSON.
pub struct JsonLinesHost<W> {
    writer: tokio::sync::Mutex<W>,
    pending: Pending,
    next_request: AtomicU64,
    next_terminal: AtomicU64,
}

impl JsonLinesHost<tokio::io::Stdout> {
    /// A host bridge writing to this process's stdout.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> JsonLinesHost<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(writer),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request: AtomicU64::new(1),
            next_terminal: AtomicU64::new(1),
        }
    }

    /// Reads responses and notifications from `reader` until it closes.
    ///
    /// Notifications are forwarded to `group`. When the host goes away the
    /// group is asked to shut down and outstanding requests fail.
    pub fn spawn_reader<R>(&self, reader: R, group: GroupHandle) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Incoming>(&line) {
                    Ok(Incoming::Response { id, result, error }) => {
                        let waiter = pending.lock().ok().and_then(|mut map| map.remove(&id));
                        match waiter {
                            Some(waiter) => {
                                let _ = waiter.send(match error {
                                    Some(error) => Err(error),
                                    None => Ok(result),
                                });
                            }
                            None => log::debug!("response for unknown request {id}"),
                        }
                    }
                    Ok(Incoming::Notification(notification)) => {
                        group.send(notification.into()).await;
                    }
                    Err(err) => log::warn!("ignoring malformed host message ({err}): {line}"),
                }
            }
            log::info!("host connection closed");
            if let Ok(mut map) = pending.lock() {
                map.clear();
            }
            group.send(GroupEvent::Shutdown).await;
        })
    }

    async fn write_message(&self, message: &Outgoing<'_>) -> Result<()> {
        let mut line = serde_json::to_string(message).context("failed to encode host message")?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| anyhow!("host request table poisoned"))?
            .insert(id, tx);
        self.write_message(&Outgoing {
            id: Some(id),
            method,
            params,
        })
        .await?;
        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => bail!("{method} failed: {error}"),
            Err(_) => bail!("host disconnected before answering {method}"),
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.write_message(&Outgoing {
            id: None,
            method,
            params,
        })
        .await
    }
}

#[async_trait]
impl<W> DebugHost for JsonLinesHost<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn start_session(&self, config: &DebugConfiguration) -> Result<bool> {
        let params = serde_json::to_value(config)?;
        let result = self.request("startDebugging", params).await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    async fn stop_session(&self, session: &SessionId) -> Result<()> {
        self.request("stopDebugging", json!({ "session": session }))
            .await
            .map(|_| ())
    }

    async fn open_terminal(&self, name: &str) -> Result<TerminalId> {
        let terminal = TerminalId(self.next_terminal.fetch_add(1, Ordering::Relaxed));
        self.notify("openTerminal", json!({ "terminal": terminal, "name": name }))
            .await?;
        Ok(terminal)
    }

    async fn write_terminal(&self, terminal: TerminalId, text: &str) -> Result<()> {
        self.notify("writeTerminal", json!({ "terminal": terminal, "text": text }))
            .await
    }

    async fn close_terminal(&self, terminal: TerminalId) -> Result<()> {
        self.notify("closeTerminal", json!({ "terminal": terminal }))
            .await
    }
}
