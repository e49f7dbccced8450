//! Daemon module - serves the orchestrator over a Unix socket
//!
//! The sandhold daemon owns the orchestrator for the lifetime of the
//! process. Front ends connect, issue commands and read responses; status
//! and progress events are pushed to any client that subscribes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     IPC      ┌──────────────────────┐
//! │  CLI / app      │◄────────────►│        Daemon        │
//! │  (client)       │   (socket)   │                      │
//! └─────────────────┘              │  ┌────────────────┐  │
//!                                  │  │  Orchestrator  │  │
//!                                  │  └───────┬────────┘  │
//!                                  │          │           │
//!                                  │  ┌───────┴────────┐  │
//!                                  │  │ PluginSandbox  │  │
//!                                  │  │ PluginSandbox  │  │
//!                                  │  └────────────────┘  │
//!                                  └──────────────────────┘
//! ```

pub mod ipc;

pub use ipc::{default_socket_path, Connection, DaemonClient, DaemonCommand, DaemonResponse};

use crate::container::ProxyFrame;
use crate::events::ChannelBroadcaster;
use crate::orchestrator::SandboxOrchestrator;
use crate::{Result, SandholdError};
use bytes::Bytes;
use ipc::write_line;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const PROXY_CHANNEL_CAPACITY: usize = 32;

/// The sandhold daemon server
pub struct Daemon {
    orchestrator: Arc<SandboxOrchestrator>,
    events: ChannelBroadcaster,
    socket_path: PathBuf,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(
        orchestrator: Arc<SandboxOrchestrator>,
        events: ChannelBroadcaster,
        socket_path: PathBuf,
    ) -> Self {
        Self {
            orchestrator,
            events,
            socket_path,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Cancelled when a client asks for shutdown. Cancel it to stop `run`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run the daemon, listening for client connections until shutdown
    pub async fn run(&self) -> Result<()> {
        // Remove stale socket if it exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| SandholdError::Daemon(e.to_string()))?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .map_err(|e| SandholdError::Daemon(e.to_string()))?;

        tracing::info!(socket = %self.socket_path.display(), "Daemon listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let handler = Handler {
                            orchestrator: self.orchestrator.clone(),
                            events: self.events.clone(),
                            shutdown: self.shutdown.clone(),
                        };
                        tokio::spawn(async move {
                            if let Err(e) = handler.serve(stream).await {
                                tracing::warn!(error = %e, "Client handler error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Accept error");
                    }
                },
            }
        }

        drop(listener);
        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("Daemon stopped listening");
        Ok(())
    }
}

/// Per-connection state
struct Handler {
    orchestrator: Arc<SandboxOrchestrator>,
    events: ChannelBroadcaster,
    shutdown: CancellationToken,
}

impl Handler {
    async fn serve(self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let command: DaemonCommand = match serde_json::from_str(&line) {
                Ok(command) => command,
                Err(e) => {
                    let message = format!("invalid command: {}", e);
                    write_line(&mut writer, &DaemonResponse::Error { message }).await?;
                    continue;
                }
            };
            tracing::debug!(?command, "Daemon command");

            match command {
                DaemonCommand::Subscribe => {
                    // The connection belongs to the subscription from here on
                    return self.subscribe(&mut writer).await;
                }
                DaemonCommand::Proxy { plugin_id, body } => {
                    self.proxy(&mut writer, &plugin_id, body).await?;
                }
                DaemonCommand::Shutdown => {
                    write_line(&mut writer, &DaemonResponse::Ok { message: None }).await?;
                    tracing::info!("Shutdown requested by client");
                    self.shutdown.cancel();
                    return Ok(());
                }
                other => {
                    let response = self.execute(other).await;
                    write_line(&mut writer, &response).await?;
                }
            }
        }

        Ok(())
    }

    /// Single-response commands
    async fn execute(&self, command: DaemonCommand) -> DaemonResponse {
        let result = match command {
            DaemonCommand::Ping => Ok(DaemonResponse::Pong),
            DaemonCommand::Status => Ok(DaemonResponse::Status {
                summary: Box::new(self.orchestrator.status_summary()),
            }),
            DaemonCommand::Exists { plugin_id } => Ok(DaemonResponse::Exists {
                exists: self.orchestrator.check_plugin_exists(&plugin_id),
            }),
            DaemonCommand::Logs { plugin_id, lines } => self
                .orchestrator
                .plugin_logs(&plugin_id, lines)
                .await
                .map(|lines| DaemonResponse::Logs { lines }),
            DaemonCommand::RestartPlugin { plugin_id } => self
                .orchestrator
                .restart_plugin(&plugin_id)
                .await
                .map(|()| DaemonResponse::Ok {
                    message: Some(format!("restarted {}", plugin_id)),
                }),
            DaemonCommand::StopPlugin { plugin_id } => self
                .orchestrator
                .stop_plugin(&plugin_id)
                .await
                .map(|()| DaemonResponse::Ok {
                    message: Some(format!("stopped {}", plugin_id)),
                }),
            DaemonCommand::Subscribe | DaemonCommand::Proxy { .. } | DaemonCommand::Shutdown => {
                Err(SandholdError::Daemon("streaming command".to_string()))
            }
        };

        result.unwrap_or_else(|e| DaemonResponse::Error {
            message: e.to_string(),
        })
    }

    async fn proxy(&self, writer: &mut OwnedWriteHalf, plugin_id: &str, body: String) -> Result<()> {
        let (tx, mut rx) = mpsc::channel(PROXY_CHANNEL_CAPACITY);
        let orchestrator = self.orchestrator.clone();
        let id = plugin_id.to_string();
        let request = tokio::spawn(async move {
            orchestrator
                .stream_to_plugin(&id, Bytes::from(body), tx)
                .await
        });

        while let Some(frame) = rx.recv().await {
            let response = match frame {
                ProxyFrame::Head {
                    status,
                    content_type,
                } => DaemonResponse::ProxyHead {
                    status,
                    content_type,
                },
                ProxyFrame::Chunk(data) => DaemonResponse::ProxyChunk {
                    data: data.to_vec(),
                },
            };
            if let Err(e) = write_line(writer, &response).await {
                // Client went away; dropping rx ends the upstream read
                request.abort();
                return Err(e);
            }
        }

        let outcome = match request.await {
            Ok(Ok(())) => DaemonResponse::ProxyEnd,
            Ok(Err(e)) => DaemonResponse::Error {
                message: e.to_string(),
            },
            Err(e) => DaemonResponse::Error {
                message: format!("proxy task failed: {}", e),
            },
        };
        write_line(writer, &outcome).await
    }

    async fn subscribe(&self, writer: &mut OwnedWriteHalf) -> Result<()> {
        let mut rx = self.events.subscribe();
        write_line(writer, &DaemonResponse::Ok { message: None }).await?;
        // Current snapshot first so a late subscriber is not blind until the next tick
        let summary = Box::new(self.orchestrator.status_summary());
        let snapshot = crate::events::SandboxEvent::Status { summary };
        write_line(writer, &DaemonResponse::Event { event: snapshot }).await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                received = rx.recv() => match received {
                    Ok(event) => write_line(writer, &DaemonResponse::Event { event }).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BroadcastSink, SandboxEvent};
    use crate::orchestrator::Collaborators;
    use crate::store::PluginRecord;
    use crate::testing::{
        spawn_http_stub, test_config, MockAnalysisStore, MockClientFactory, MockConnector,
        MockDriver, MockEngine, MockRecordStore, StubResponse,
    };
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    struct Running {
        _dir: tempfile::TempDir,
        socket: PathBuf,
        client: DaemonClient,
        events: ChannelBroadcaster,
        orchestrator: Arc<SandboxOrchestrator>,
        shutdown: CancellationToken,
        server: tokio::task::JoinHandle<Result<()>>,
    }

    async fn running_daemon(engine: MockEngine, ids: &[&str]) -> Running {
        let dir = tempfile::tempdir().unwrap();
        let clients = Arc::new(MockClientFactory::default());
        for id in ids {
            clients.set_tools(id, &["echo"]);
        }
        let events = ChannelBroadcaster::default();
        let records = ids.iter().map(|id| PluginRecord::new(*id)).collect();
        let orchestrator = SandboxOrchestrator::new(
            test_config(dir.path()),
            Collaborators {
                driver: Box::new(MockDriver::new(true, false)),
                connector: Arc::new(MockConnector::new(engine)),
                records: Arc::new(MockRecordStore::new(records)),
                analyses: Arc::new(MockAnalysisStore::default()),
                clients,
                events: Arc::new(events.clone()),
                http: reqwest::Client::new(),
            },
        );

        let socket = dir.path().join("sandhold.sock");
        let daemon = Daemon::new(orchestrator.clone(), events.clone(), socket.clone());
        let shutdown = daemon.shutdown_token();
        let server = tokio::spawn(async move { daemon.run().await });

        let client = DaemonClient::new(socket.clone());
        for _ in 0..100 {
            if client.ping().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Running {
            _dir: dir,
            socket,
            client,
            events,
            orchestrator,
            shutdown,
            server,
        }
    }

    impl Running {
        async fn finish(self) {
            self.orchestrator.stop_all().await.unwrap();
            self.shutdown.cancel();
            self.server.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn ping_status_and_exists() {
        let daemon = running_daemon(MockEngine::default(), &["fs"]).await;
        daemon.client.ping().await.unwrap();

        daemon.orchestrator.start().await.unwrap();
        let summary = daemon.client.status().await.unwrap();
        assert_eq!(summary.containers.len(), 1);
        assert!(daemon.client.exists("fs").await.unwrap());
        assert!(!daemon.client.exists("nope").await.unwrap());

        daemon.finish().await;
    }

    #[tokio::test]
    async fn unknown_plugin_comes_back_as_error() {
        let daemon = running_daemon(MockEngine::default(), &[]).await;
        let err = daemon.client.logs("ghost", 10).await.unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = daemon
            .client
            .request(DaemonCommand::StopPlugin {
                plugin_id: "ghost".to_string(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));

        daemon.finish().await;
    }

    #[tokio::test]
    async fn invalid_command_keeps_connection_open() {
        let daemon = running_daemon(MockEngine::default(), &[]).await;

        let stream = UnixStream::connect(&daemon.socket).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(b"{\"type\":\"bogus\"}\n").await.unwrap();
        let reply: DaemonResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        match reply {
            DaemonResponse::Error { message } => assert!(message.contains("invalid command")),
            other => panic!("unexpected {:?}", other),
        }

        writer.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        let reply: DaemonResponse =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(matches!(reply, DaemonResponse::Pong));

        daemon.finish().await;
    }

    #[tokio::test]
    async fn subscribers_get_snapshot_then_events() {
        let daemon = running_daemon(MockEngine::default(), &[]).await;
        let mut conn = daemon.client.connect().await.unwrap();
        conn.send(&DaemonCommand::Subscribe).await.unwrap();
        assert!(matches!(
            conn.next().await.unwrap(),
            Some(DaemonResponse::Ok { .. })
        ));
        assert!(matches!(
            conn.next().await.unwrap(),
            Some(DaemonResponse::Event {
                event: SandboxEvent::Status { .. }
            })
        ));

        daemon.events.broadcast(SandboxEvent::Error {
            message: "boom".to_string(),
        });
        match conn.next().await.unwrap() {
            Some(DaemonResponse::Event {
                event: SandboxEvent::Error { message },
            }) => assert_eq!(message, "boom"),
            other => panic!("unexpected {:?}", other),
        }

        daemon.finish().await;
    }

    #[tokio::test]
    async fn shutdown_command_stops_listener() {
        let daemon = running_daemon(MockEngine::default(), &[]).await;
        match daemon.client.request(DaemonCommand::Shutdown).await.unwrap() {
            DaemonResponse::Ok { .. } => {}
            other => panic!("unexpected {:?}", other),
        }
        daemon.server.await.unwrap().unwrap();
        assert!(daemon.shutdown.is_cancelled());
        assert!(!daemon.socket.exists());
    }

    #[tokio::test]
    async fn proxy_streams_plugin_response() {
        let endpoint = spawn_http_stub(|_| {
            StubResponse::sse("data: {\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{}}\n\n")
        })
        .await;
        let port: u16 = endpoint
            .trim_start_matches("http://127.0.0.1:")
            .trim_end_matches("/mcp")
            .parse()
            .unwrap();
        let engine = MockEngine::default();
        engine.preset_running("sandhold-fs", port);

        let daemon = running_daemon(engine, &["fs"]).await;
        daemon.orchestrator.start().await.unwrap();

        let mut conn = daemon.client.connect().await.unwrap();
        conn.send(&DaemonCommand::Proxy {
            plugin_id: "fs".to_string(),
            body: r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#.to_string(),
        })
        .await
        .unwrap();

        match conn.next().await.unwrap() {
            Some(DaemonResponse::ProxyHead { status, .. }) => assert_eq!(status, 200),
            other => panic!("expected head, got {:?}", other),
        }
        let mut body = Vec::new();
        loop {
            match conn.next().await.unwrap() {
                Some(DaemonResponse::ProxyChunk { data }) => body.extend(data),
                Some(DaemonResponse::ProxyEnd) => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(String::from_utf8(body).unwrap().contains("\"id\":7"));

        daemon.finish().await;
    }
}
