//! In-memory stand-ins for the engine, the runtime and the app collaborators.

use crate::config::SandholdConfig;
use crate::engine::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineConnector, ProgressFn, PullProgress,
};
use crate::events::{BroadcastSink, PluginPhase, SandboxEvent};
use crate::protocol::{PluginClient, PluginClientFactory, RemoteTool};
use crate::runtime::{MachineDriver, MachineStatus};
use crate::store::{AnalysisStore, PluginRecord, PluginRecordStore, ToolAnalysis};
use crate::{Result, SandholdError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn test_config(data_dir: &Path) -> SandholdConfig {
    SandholdConfig {
        data_dir: data_dir.to_path_buf(),
        health_check_attempts: 3,
        health_check_interval_ms: 10,
        stop_grace_secs: 0,
        stop_escalation_ms: 200,
        status_broadcast_interval_ms: 20,
        analysis_refresh_interval_ms: 20,
        request_timeout_secs: 5,
        ..SandholdConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Runtime

#[derive(Clone)]
pub struct MockDriver {
    installed: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    pub installs: Arc<AtomicUsize>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
    pub fail_start: Arc<AtomicBool>,
}

impl MockDriver {
    pub fn new(installed: bool, running: bool) -> Self {
        Self {
            installed: Arc::new(AtomicBool::new(installed)),
            running: Arc::new(AtomicBool::new(running)),
            installs: Arc::default(),
            starts: Arc::default(),
            stops: Arc::default(),
            fail_start: Arc::default(),
        }
    }

    fn socket() -> PathBuf {
        PathBuf::from("/tmp/mock-engine.sock")
    }
}

#[async_trait]
impl MachineDriver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn probe(&self) -> Result<MachineStatus> {
        let running = self.running.load(Ordering::SeqCst);
        Ok(MachineStatus {
            installed: self.installed.load(Ordering::SeqCst),
            running,
            socket_path: running.then(Self::socket),
        })
    }

    async fn install(&self) -> Result<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        self.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<PathBuf> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(SandholdError::Engine("machine refused to boot".to_string()));
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(Self::socket())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, (bool, u16)>,
    created: Vec<ContainerSpec>,
    pulls: Vec<String>,
    pull_progress: Vec<PullProgress>,
    pull_error: Option<String>,
    create_failures: HashSet<String>,
    ignore_stop: HashSet<String>,
    ignore_kill: HashSet<String>,
    kills: Vec<String>,
    logs: Vec<String>,
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<Mutex<EngineState>>,
}

impl MockEngine {
    fn with<T>(&self, f: impl FnOnce(&mut EngineState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_pull_progress(&self, progress: Vec<PullProgress>) {
        self.with(|s| s.pull_progress = progress);
    }

    pub fn fail_pull(&self, reason: &str) {
        self.with(|s| s.pull_error = Some(reason.to_string()));
    }

    pub fn pulls(&self) -> Vec<String> {
        self.with(|s| s.pulls.clone())
    }

    pub fn fail_create(&self, name: &str) {
        self.with(|s| s.create_failures.insert(name.to_string()));
    }

    pub fn created(&self) -> Vec<ContainerSpec> {
        self.with(|s| s.created.clone())
    }

    pub fn ignore_stop(&self, name: &str) {
        self.with(|s| s.ignore_stop.insert(name.to_string()));
    }

    pub fn ignore_kill(&self, name: &str) {
        self.with(|s| s.ignore_kill.insert(name.to_string()));
    }

    pub fn kills(&self) -> Vec<String> {
        self.with(|s| s.kills.clone())
    }

    pub fn set_logs(&self, lines: Vec<String>) {
        self.with(|s| s.logs = lines);
    }

    /// Pretend a container already exists and runs on `port`.
    pub fn preset_running(&self, name: &str, port: u16) {
        self.with(|s| s.containers.insert(name.to_string(), (true, port)));
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.with(|s| s.containers.get(name).is_some_and(|(running, _)| *running))
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn pull_image(&self, image: &str, progress: ProgressFn<'_>) -> Result<()> {
        let (steps, error) = self.with(|s| {
            s.pulls.push(image.to_string());
            (s.pull_progress.clone(), s.pull_error.clone())
        });
        if let Some(reason) = error {
            return Err(SandholdError::ImagePull(reason));
        }

        progress(PullProgress {
            status: Some(format!("Trying to pull {}", image)),
            ..Default::default()
        });
        for step in steps {
            tokio::task::yield_now().await;
            progress(step);
        }
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        Ok(self.with(|s| {
            s.containers.get(name).map(|(running, port)| ContainerInfo {
                id: format!("mock-{}", name),
                running: *running,
                host_port: Some(*port),
            })
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.with(|s| {
            if s.create_failures.contains(&spec.name) {
                return Err(SandholdError::Engine(format!(
                    "create {} rejected",
                    spec.name
                )));
            }
            s.containers
                .insert(spec.name.clone(), (false, spec.host_port));
            s.created.push(spec.clone());
            Ok(format!("mock-{}", spec.name))
        })
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.with(|s| match s.containers.get_mut(name) {
            Some(entry) => {
                entry.0 = true;
                Ok(())
            }
            None => Err(SandholdError::Engine(format!("no such container: {}", name))),
        })
    }

    async fn stop_container(&self, name: &str, _grace: Duration) -> Result<()> {
        self.with(|s| {
            if !s.ignore_stop.contains(name) {
                if let Some(entry) = s.containers.get_mut(name) {
                    entry.0 = false;
                }
            }
        });
        Ok(())
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        self.with(|s| {
            s.kills.push(name.to_string());
            if !s.ignore_kill.contains(name) {
                if let Some(entry) = s.containers.get_mut(name) {
                    entry.0 = false;
                }
            }
        });
        Ok(())
    }

    async fn container_logs(&self, _name: &str, tail: usize) -> Result<Vec<String>> {
        Ok(self.with(|s| {
            let skip = s.logs.len().saturating_sub(tail);
            s.logs[skip..].to_vec()
        }))
    }

    fn follow_logs(&self, _name: &str) -> BoxStream<'static, Result<Bytes>> {
        stream::empty().boxed()
    }
}

pub struct MockConnector {
    pub engine: MockEngine,
    pub fail: AtomicBool,
    pub connects: AtomicUsize,
    /// How long `connect` takes, to hold startup mid-flight
    pub delay_ms: AtomicU64,
}

impl MockConnector {
    pub fn new(engine: MockEngine) -> Self {
        Self {
            engine,
            fail: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            delay_ms: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl EngineConnector for MockConnector {
    async fn connect(&self, _socket_path: &Path) -> Result<Arc<dyn ContainerEngine>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(SandholdError::RuntimeInstall(
                "engine did not answer".to_string(),
            ));
        }
        Ok(Arc::new(self.engine.clone()))
    }
}

// ---------------------------------------------------------------------------
// Plugin protocol

#[derive(Default)]
struct PluginBehaviour {
    tools: Vec<RemoteTool>,
    fail_pings: bool,
    fail_discovery: bool,
    pings: usize,
}

#[derive(Default)]
pub struct MockClientFactory {
    plugins: Arc<Mutex<HashMap<String, PluginBehaviour>>>,
}

impl MockClientFactory {
    fn with<T>(&self, plugin_id: &str, f: impl FnOnce(&mut PluginBehaviour) -> T) -> T {
        f(self
            .plugins
            .lock()
            .unwrap()
            .entry(plugin_id.to_string())
            .or_default())
    }

    pub fn set_tools(&self, plugin_id: &str, names: &[&str]) {
        let tools = names
            .iter()
            .map(|name| RemoteTool {
                name: name.to_string(),
                description: Some(format!("{} tool", name)),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect();
        self.with(plugin_id, |p| p.tools = tools);
    }

    pub fn fail_pings(&self, plugin_id: &str) {
        self.with(plugin_id, |p| p.fail_pings = true);
    }

    pub fn fail_discovery(&self, plugin_id: &str, fail: bool) {
        self.with(plugin_id, |p| p.fail_discovery = fail);
    }

    pub fn pings(&self, plugin_id: &str) -> usize {
        self.with(plugin_id, |p| p.pings)
    }
}

impl PluginClientFactory for MockClientFactory {
    fn client_for(&self, plugin_id: &str, _endpoint: &str) -> Arc<dyn PluginClient> {
        Arc::new(MockClient {
            plugin_id: plugin_id.to_string(),
            plugins: self.plugins.clone(),
        })
    }
}

struct MockClient {
    plugin_id: String,
    plugins: Arc<Mutex<HashMap<String, PluginBehaviour>>>,
}

impl MockClient {
    fn with<T>(&self, f: impl FnOnce(&mut PluginBehaviour) -> T) -> T {
        f(self
            .plugins
            .lock()
            .unwrap()
            .entry(self.plugin_id.clone())
            .or_default())
    }
}

#[async_trait]
impl PluginClient for MockClient {
    async fn ping(&self) -> Result<()> {
        self.with(|p| {
            p.pings += 1;
            if p.fail_pings {
                Err(SandholdError::Protocol("connection refused".to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn initialize(&self) -> Result<()> {
        self.with(|p| {
            if p.fail_discovery {
                Err(SandholdError::Protocol("initialize failed".to_string()))
            } else {
                Ok(())
            }
        })
    }

    async fn list_tools(&self) -> Result<Vec<RemoteTool>> {
        self.with(|p| {
            if p.fail_discovery {
                Err(SandholdError::Protocol("tools/list failed".to_string()))
            } else {
                Ok(p.tools.clone())
            }
        })
    }

    async fn close(&self) {}
}

// ---------------------------------------------------------------------------
// App collaborators

#[derive(Default)]
pub struct MockRecordStore {
    records: Mutex<Vec<PluginRecord>>,
}

impl MockRecordStore {
    pub fn new(records: Vec<PluginRecord>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[async_trait]
impl PluginRecordStore for MockRecordStore {
    async fn get_all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self.records.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct MockAnalysisStore {
    analyses: Mutex<HashMap<String, Vec<ToolAnalysis>>>,
}

impl MockAnalysisStore {
    pub fn set(&self, plugin_id: &str, analyses: Vec<ToolAnalysis>) {
        self.analyses
            .lock()
            .unwrap()
            .insert(plugin_id.to_string(), analyses);
    }
}

#[async_trait]
impl AnalysisStore for MockAnalysisStore {
    async fn get_by_plugin_id(&self, plugin_id: &str) -> Result<Vec<ToolAnalysis>> {
        Ok(self
            .analyses
            .lock()
            .unwrap()
            .get(plugin_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SandboxEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<SandboxEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn phases_for(&self, plugin_id: &str) -> Vec<PluginPhase> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SandboxEvent::PluginProgress {
                    plugin_id: id,
                    phase,
                    ..
                } if id == plugin_id => Some(phase),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SandboxEvent::Error { message } => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl BroadcastSink for RecordingSink {
    fn broadcast(&self, event: SandboxEvent) {
        self.events.lock().unwrap().push(event);
    }
}

// ---------------------------------------------------------------------------
// HTTP stub

pub struct StubResponse {
    status: u16,
    content_type: Option<&'static str>,
    body: String,
}

impl StubResponse {
    pub fn json(body: &str) -> Self {
        Self {
            status: 200,
            content_type: Some("application/json"),
            body: body.to_string(),
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            status: 200,
            content_type: Some("text/event-stream"),
            body: body.to_string(),
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            body: String::new(),
        }
    }
}

/// Serve every request on a local port with `handler(request_body)`.
/// Returns the `/mcp` URL.
pub async fn spawn_http_stub<F>(handler: F) -> String
where
    F: Fn(String) -> StubResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                let _ = serve_one(stream, |body| (*handler)(body)).await;
            });
        }
    });

    format!("http://{}/mcp", addr)
}

async fn serve_one(
    mut stream: TcpStream,
    handler: impl Fn(String) -> StubResponse,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
    let content_length = headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let end = buf.len().min(header_end + content_length);
    let body = String::from_utf8_lossy(&buf[header_end..end]).into_owned();

    let response = handler(body);
    let mut head = format!("HTTP/1.1 {} Stub\r\n", response.status);
    if let Some(content_type) = response.content_type {
        head.push_str(&format!("content-type: {}\r\n", content_type));
    }
    head.push_str(&format!(
        "content-length: {}\r\nconnection: close\r\n\r\n",
        response.body.len()
    ));

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(response.body.as_bytes()).await?;
    stream.shutdown().await
}
