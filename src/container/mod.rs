//! One container bound to one plugin.

pub mod logs;

use crate::config::SandholdConfig;
use crate::engine::{ContainerEngine, ContainerSpec, EngineSlot};
use crate::store::PluginRecord;
use crate::{Result, SandholdError};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use logs::ContainerLogger;

pub const CONTAINER_PREFIX: &str = "sandhold-";
pub const LABEL_PLUGIN_ID: &str = "sandhold.plugin-id";
pub const LABEL_MANAGED: &str = "sandhold.managed";

const EXIT_POLL: Duration = Duration::from_millis(250);

/// Deterministic container name for a plugin id.
pub fn container_name(plugin_id: &str) -> String {
    let sanitized: String = plugin_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}{}", CONTAINER_PREFIX, sanitized)
}

/// Ask the OS for a free localhost port.
fn free_host_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    pub container_name: String,
    pub host_port: Option<u16>,
    pub log_file_path: PathBuf,
    pub running: bool,
    pub last_error: Option<String>,
}

/// One piece of a proxied response, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyFrame {
    Head {
        status: u16,
        content_type: Option<String>,
    },
    Chunk(Bytes),
}

pub struct ContainerHandle {
    plugin_id: String,
    image: String,
    cmd: Option<Vec<String>>,
    env: Vec<String>,
    container_port: u16,
    engine: EngineSlot,
    http: reqwest::Client,
    logs_dir: PathBuf,
    stop_grace: Duration,
    stop_escalation: Duration,
    state: RwLock<ContainerState>,
    log_task: Mutex<Option<JoinHandle<()>>>,
}

impl ContainerHandle {
    pub fn new(
        record: &PluginRecord,
        config: &SandholdConfig,
        engine: EngineSlot,
        http: reqwest::Client,
    ) -> Self {
        let name = container_name(&record.id);
        let logs_dir = config.logs_dir();

        let image = record
            .container_image
            .clone()
            .unwrap_or_else(|| config.base_image.clone());
        let cmd = record.command.as_ref().map(|command| {
            std::iter::once(command.clone())
                .chain(record.args.iter().cloned())
                .collect()
        });
        let env = record
            .env
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        Self {
            plugin_id: record.id.clone(),
            image,
            cmd,
            env,
            container_port: record.container_port,
            engine,
            http,
            stop_grace: config.stop_grace(),
            stop_escalation: config.stop_escalation(),
            state: RwLock::new(ContainerState {
                log_file_path: logs::log_path(&logs_dir, &name),
                container_name: name,
                host_port: None,
                running: false,
                last_error: None,
            }),
            logs_dir,
            log_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ContainerState {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn name(&self) -> String {
        self.state().container_name
    }

    /// Base URL of the plugin's protocol endpoint, once it has a port.
    pub fn endpoint(&self) -> Option<String> {
        self.state()
            .host_port
            .map(|port| format!("http://127.0.0.1:{}/mcp", port))
    }

    fn update(&self, f: impl FnOnce(&mut ContainerState)) {
        f(&mut self.state.write().unwrap_or_else(|e| e.into_inner()));
    }

    fn spec(&self, host_port: u16) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert(LABEL_PLUGIN_ID.to_string(), self.plugin_id.clone());
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());

        ContainerSpec {
            name: self.name(),
            image: self.image.clone(),
            cmd: self.cmd.clone(),
            env: self.env.clone(),
            container_port: self.container_port,
            host_port,
            labels,
        }
    }

    /// Create the container if missing, start it if stopped. Idempotent.
    pub async fn start_or_create(&self) -> Result<()> {
        let engine = self.engine.get()?;
        let name = self.name();

        match self.bring_up(engine.as_ref(), &name).await {
            Ok(host_port) => {
                self.update(|s| {
                    s.host_port = Some(host_port);
                    s.running = true;
                    s.last_error = None;
                });
                self.spawn_log_capture(engine.as_ref(), &name);
                tracing::info!(plugin_id = %self.plugin_id, container = %name, host_port, "container running");
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::error!(plugin_id = %self.plugin_id, container = %name, "container start failed: {}", reason);
                self.update(|s| {
                    s.running = false;
                    s.last_error = Some(reason.clone());
                });
                Err(SandholdError::ContainerStart {
                    plugin_id: self.plugin_id.clone(),
                    reason,
                })
            }
        }
    }

    async fn bring_up(&self, engine: &dyn ContainerEngine, name: &str) -> Result<u16> {
        let host_port = match engine.inspect_container(name).await? {
            Some(info) => {
                let port = info.host_port.ok_or_else(|| {
                    SandholdError::Engine(format!("container {} publishes no port", name))
                })?;
                if info.running {
                    tracing::debug!(container = %name, "reusing running container");
                    return Ok(port);
                }
                tracing::debug!(container = %name, "reusing stopped container");
                port
            }
            None => {
                let port = free_host_port()?;
                let id = engine.create_container(&self.spec(port)).await?;
                tracing::debug!(container = %name, id = %id, "created container");
                port
            }
        };

        engine.start_container(name).await?;
        Ok(host_port)
    }

    /// Follow the container's output into its log file until it exits.
    fn spawn_log_capture(&self, engine: &dyn ContainerEngine, name: &str) {
        let mut slot = self.log_task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut logger = match ContainerLogger::open(&self.logs_dir, name) {
            Ok(logger) => logger,
            Err(e) => {
                tracing::warn!(container = %name, "log capture disabled: {}", e);
                return;
            }
        };
        let mut stream = engine.follow_logs(name);
        let container = name.to_string();

        *slot = Some(tokio::spawn(async move {
            while let Some(chunk) = stream.next().await {
                let written = chunk.and_then(|bytes| {
                    logger.write(&bytes)?;
                    logger.flush()
                });
                if let Err(e) = written {
                    tracing::debug!(container = %container, "log capture ended: {}", e);
                    break;
                }
            }
        }));
    }

    fn stop_log_capture(&self) {
        if let Some(task) = self
            .log_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }

    /// Poll until the container is gone or stopped, up to `window`.
    async fn wait_for_exit(&self, engine: &dyn ContainerEngine, name: &str, window: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + window;
        loop {
            match engine.inspect_container(name).await {
                Ok(None) => return true,
                Ok(Some(info)) if !info.running => return true,
                Ok(Some(_)) => {}
                Err(e) => tracing::debug!(container = %name, "inspect during stop failed: {}", e),
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }

    /// Graceful stop, then kill. Returns once the container has exited.
    pub async fn stop(&self) -> Result<()> {
        let engine = self.engine.get()?;
        let name = self.name();

        if let Err(e) = engine.stop_container(&name, self.stop_grace).await {
            tracing::warn!(container = %name, "graceful stop failed: {}", e);
        }
        let mut exited = self
            .wait_for_exit(engine.as_ref(), &name, self.stop_escalation)
            .await;

        if !exited {
            tracing::warn!(container = %name, "still running after {:?}, killing", self.stop_escalation);
            if let Err(e) = engine.kill_container(&name).await {
                tracing::warn!(container = %name, "kill failed: {}", e);
            }
            exited = self
                .wait_for_exit(engine.as_ref(), &name, self.stop_escalation)
                .await;
        }

        self.stop_log_capture();

        if !exited {
            tracing::error!(container = %name, "container never confirmed exit");
            self.update(|s| s.last_error = Some("container did not exit".to_string()));
            return Err(SandholdError::StopTimeout(name));
        }

        self.update(|s| s.running = false);
        tracing::info!(plugin_id = %self.plugin_id, container = %name, "container stopped");
        Ok(())
    }

    /// POST `body` to the plugin and forward the response, chunk by chunk.
    ///
    /// Returns when the response ends or the receiver goes away.
    pub async fn stream_request(&self, body: Bytes, sink: mpsc::Sender<ProxyFrame>) -> Result<()> {
        let state = self.state();
        let endpoint = match (state.running, self.endpoint()) {
            (true, Some(endpoint)) => endpoint,
            _ => {
                return Err(SandholdError::Protocol(format!(
                    "container {} is not running",
                    state.container_name
                )))
            }
        };

        let response = self
            .http
            .post(&endpoint)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .body(body)
            .send()
            .await?;

        let head = ProxyFrame::Head {
            status: response.status().as_u16(),
            content_type: response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        };
        if sink.send(head).await.is_err() {
            return Ok(());
        }

        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            if sink.send(ProxyFrame::Chunk(chunk?)).await.is_err() {
                tracing::debug!(plugin_id = %self.plugin_id, "proxy receiver dropped mid-stream");
                break;
            }
        }
        Ok(())
    }

    /// Last `lines` lines of output, ANSI escapes stripped.
    pub async fn recent_logs(&self, lines: usize) -> Result<Vec<String>> {
        let path = self.state().log_file_path;
        let captured = tokio::task::spawn_blocking(move || logs::tail_file(&path, lines))
            .await
            .map_err(|e| SandholdError::Io(std::io::Error::other(e)))??;
        if let Some(captured) = captured {
            return Ok(captured);
        }

        let engine = self.engine.get()?;
        let raw = engine.container_logs(&self.name(), lines).await?;
        Ok(logs::tail_lines(&raw.join("\n"), lines))
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        self.stop_log_capture();
    }
}
