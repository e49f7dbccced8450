//! IPC protocol for daemon communication
//!
//! The daemon listens on a Unix socket. Clients send one JSON command per
//! line and read newline-delimited JSON responses back. Most commands get a
//! single response; `proxy` streams head/chunk/end frames and `subscribe`
//! streams events until the client hangs up.

use crate::events::SandboxEvent;
use crate::orchestrator::StatusSummary;
use crate::{Result, SandholdError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub const DEFAULT_LOG_LINES: usize = 100;

/// Commands that can be sent to the daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonCommand {
    /// Health check
    Ping,

    /// Full status summary
    Status,

    /// Is a plugin registered?
    Exists { plugin_id: String },

    /// Recent container output
    Logs {
        plugin_id: String,
        #[serde(default = "default_lines")]
        lines: usize,
    },

    /// Forward a JSON-RPC request body to a plugin and stream the response
    Proxy { plugin_id: String, body: String },

    RestartPlugin { plugin_id: String },

    /// Stop and unregister a plugin
    StopPlugin { plugin_id: String },

    /// Stream events until the connection closes
    Subscribe,

    /// Stop everything and exit
    Shutdown,
}

fn default_lines() -> usize {
    DEFAULT_LOG_LINES
}

/// Responses from the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
    Ok { message: Option<String> },

    Pong,

    Status { summary: Box<StatusSummary> },

    Exists { exists: bool },

    Logs { lines: Vec<String> },

    ProxyHead {
        status: u16,
        content_type: Option<String>,
    },

    /// Raw response bytes, chunk boundaries as received from the plugin
    ProxyChunk { data: Vec<u8> },

    ProxyEnd,

    Event { event: SandboxEvent },

    Error { message: String },
}

/// Get the default socket path for the daemon
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir).join("sandhold.sock")
    } else {
        PathBuf::from("/tmp").join(format!("sandhold-{}.sock", whoami()))
    }
}

fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Write one message as a JSON line.
pub(crate) async fn write_line<T: Serialize>(writer: &mut OwnedWriteHalf, message: &T) -> Result<()> {
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// An open connection to the daemon.
pub struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub async fn send(&mut self, command: &DaemonCommand) -> Result<()> {
        write_line(&mut self.writer, command).await
    }

    /// Next response, or `None` once the daemon closes the connection.
    pub async fn next(&mut self) -> Result<Option<DaemonResponse>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(serde_json::from_str(&line)?)),
            None => Ok(None),
        }
    }
}

/// Daemon client for the CLI
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn connect(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            SandholdError::Daemon(format!(
                "cannot reach daemon at {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Send one command and wait for its single response.
    ///
    /// `DaemonResponse::Error` comes back as `SandholdError::Daemon`.
    pub async fn request(&self, command: DaemonCommand) -> Result<DaemonResponse> {
        let mut conn = self.connect().await?;
        conn.send(&command).await?;
        match conn.next().await? {
            Some(DaemonResponse::Error { message }) => Err(SandholdError::Daemon(message)),
            Some(response) => Ok(response),
            None => Err(SandholdError::Daemon(
                "daemon closed the connection without answering".to_string(),
            )),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(DaemonCommand::Ping).await? {
            DaemonResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<StatusSummary> {
        match self.request(DaemonCommand::Status).await? {
            DaemonResponse::Status { summary } => Ok(*summary),
            other => Err(unexpected(other)),
        }
    }

    pub async fn exists(&self, plugin_id: &str) -> Result<bool> {
        let command = DaemonCommand::Exists {
            plugin_id: plugin_id.to_string(),
        };
        match self.request(command).await? {
            DaemonResponse::Exists { exists } => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    pub async fn logs(&self, plugin_id: &str, lines: usize) -> Result<Vec<String>> {
        let command = DaemonCommand::Logs {
            plugin_id: plugin_id.to_string(),
            lines,
        };
        match self.request(command).await? {
            DaemonResponse::Logs { lines } => Ok(lines),
            other => Err(unexpected(other)),
        }
    }
}

pub(crate) fn unexpected(response: DaemonResponse) -> SandholdError {
    SandholdError::Daemon(format!("unexpected response: {:?}", response))
}
