//! Top-level coordination of runtime, image and plugin sandboxes.

use crate::config::SandholdConfig;
use crate::container::ProxyFrame;
use crate::engine::{BollardConnector, EngineConnector, EngineSlot};
use crate::events::{BroadcastSink, SandboxEvent};
use crate::image::{BaseImage, ImagePullStatus};
use crate::protocol::{HttpClientFactory, PluginClientFactory};
use crate::runtime::{driver_for, MachineDriver, MachineStatus, RuntimeManager};
use crate::sandbox::{PluginSandbox, SandboxContext, SandboxState, ToolDescriptor};
use crate::store::{AnalysisStore, PluginRecord, PluginRecordStore};
use crate::{Result, SandholdError};
use bytes::Bytes;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeStatus {
    #[default]
    NotInstalled,
    Initializing,
    Running,
    Error,
    Stopping,
    Stopped,
}

impl std::fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RuntimeStatus::NotInstalled => "not_installed",
            RuntimeStatus::Initializing => "initializing",
            RuntimeStatus::Running => "running",
            RuntimeStatus::Error => "error",
            RuntimeStatus::Stopping => "stopping",
            RuntimeStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Per-plugin slice of the status summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerView {
    pub container_name: String,
    pub host_port: Option<u16>,
    pub running: bool,
    pub state: SandboxState,
    pub last_error: Option<String>,
    pub log_file_path: PathBuf,
}

/// Snapshot of everything observers care about. Rebuilt on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub status: RuntimeStatus,
    pub runtime: MachineStatus,
    pub image: ImagePullStatus,
    pub containers: BTreeMap<String, ContainerView>,
    pub tools: Vec<ToolDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginFailure {
    pub plugin_id: String,
    pub reason: String,
}

/// Outcome of the plugin fan-out in [`SandboxOrchestrator::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupReport {
    pub started: Vec<String>,
    pub failed: Vec<PluginFailure>,
}

impl StartupReport {
    /// `"K plugin(s) failed to start: a: reason; b: reason"`, if anything failed.
    pub fn failure_message(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        let details: Vec<String> = self
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.plugin_id, f.reason))
            .collect();
        Some(format!(
            "{} plugin(s) failed to start: {}",
            self.failed.len(),
            details.join("; ")
        ))
    }
}

/// Everything the orchestrator talks to but does not own.
pub struct Collaborators {
    pub driver: Box<dyn MachineDriver>,
    pub connector: Arc<dyn EngineConnector>,
    pub records: Arc<dyn PluginRecordStore>,
    pub analyses: Arc<dyn AnalysisStore>,
    pub clients: Arc<dyn PluginClientFactory>,
    pub events: Arc<dyn BroadcastSink>,
    pub http: reqwest::Client,
}

impl Collaborators {
    /// Real podman, bollard and HTTP implementations for `config`.
    pub fn production<S>(
        config: &SandholdConfig,
        store: Arc<S>,
        events: Arc<dyn BroadcastSink>,
    ) -> Result<Self>
    where
        S: PluginRecordStore + AnalysisStore + 'static,
    {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            driver: driver_for(config),
            connector: Arc::new(BollardConnector::new(config.engine_timeout_secs)),
            records: store.clone(),
            analyses: store,
            clients: Arc::new(HttpClientFactory::new(http.clone(), config.request_timeout())),
            events,
            http,
        })
    }
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Work that `stop_all` has to cancel before it can tear anything down.
#[derive(Default)]
struct Lifecycle {
    /// Fresh per `start`, cancelled by `stop_all`
    startup: CancellationToken,
    /// Plugins created but not yet registered, keyed by id
    starting: HashMap<String, CancellationToken>,
}

pub struct SandboxOrchestrator {
    config: Arc<SandholdConfig>,
    runtime: RuntimeManager,
    image: BaseImage,
    connector: Arc<dyn EngineConnector>,
    records: Arc<dyn PluginRecordStore>,
    events: Arc<dyn BroadcastSink>,
    ctx: SandboxContext,
    status: RwLock<RuntimeStatus>,
    /// Only lifecycle operations below mutate this
    sandboxes: RwLock<HashMap<String, Arc<PluginSandbox>>>,
    plugin_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    startup: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
    ticker: Mutex<Option<Ticker>>,
}

impl SandboxOrchestrator {
    pub fn new(config: SandholdConfig, collaborators: Collaborators) -> Arc<Self> {
        let config = Arc::new(config);
        let engine = EngineSlot::new();
        let ctx = SandboxContext {
            config: config.clone(),
            engine,
            http: collaborators.http,
            clients: collaborators.clients,
            analyses: collaborators.analyses,
            events: collaborators.events.clone(),
        };

        Arc::new(Self {
            runtime: RuntimeManager::new(collaborators.driver),
            image: BaseImage::new(config.base_image.clone()),
            connector: collaborators.connector,
            records: collaborators.records,
            events: collaborators.events,
            ctx,
            config,
            status: RwLock::new(RuntimeStatus::NotInstalled),
            sandboxes: RwLock::new(HashMap::new()),
            plugin_locks: Mutex::new(HashMap::new()),
            startup: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::default()),
            ticker: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SandholdConfig {
        &self.config
    }

    pub fn status(&self) -> RuntimeStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: RuntimeStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
        tracing::debug!(%status, "orchestrator status");
    }

    /// Subscribe to base image pull progress.
    pub fn image_progress(&self) -> tokio::sync::watch::Receiver<ImagePullStatus> {
        self.image.subscribe()
    }

    fn sandbox(&self, plugin_id: &str) -> Option<Arc<PluginSandbox>> {
        self.sandboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
    }

    fn registered(&self, plugin_id: &str) -> Result<Arc<PluginSandbox>> {
        self.sandbox(plugin_id)
            .ok_or_else(|| SandholdError::PluginNotRegistered(plugin_id.to_string()))
    }

    fn plugin_lock(&self, plugin_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.plugin_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(plugin_id.to_string())
            .or_default()
            .clone()
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `status` unless `stop_all` has begun. Returns whether it moved.
    fn advance(&self, status: RuntimeStatus) -> bool {
        let lifecycle = self.lifecycle();
        if lifecycle.startup.is_cancelled() {
            return false;
        }
        self.set_status(status);
        true
    }

    fn fatal(&self, err: SandholdError) -> SandholdError {
        if !self.advance(RuntimeStatus::Error) {
            return startup_cancelled();
        }
        tracing::error!("startup failed: {}", err);
        self.events.broadcast(SandboxEvent::Error {
            message: err.to_string(),
        });
        err
    }

    /// Run one startup step unless `stop_all` cancels it first.
    async fn step<T>(
        &self,
        cancel: &CancellationToken,
        work: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            _ = cancel.cancelled() => Err(startup_cancelled()),
            result = work => result.map_err(|e| self.fatal(e)),
        }
    }

    /// Bring up runtime, engine client and base image, then every installed plugin.
    ///
    /// Runtime and image failures abort with `status = error`. Plugin failures
    /// are collected into the report and leave `status = running`. A `stop_all`
    /// that lands mid-startup makes this return `Cancelled`.
    pub async fn start(self: &Arc<Self>) -> Result<StartupReport> {
        let _startup = self
            .startup
            .try_lock()
            .map_err(|_| SandholdError::StartupInProgress)?;

        let cancel = {
            let mut lifecycle = self.lifecycle();
            lifecycle.startup = CancellationToken::new();
            self.set_status(RuntimeStatus::Initializing);
            lifecycle.startup.clone()
        };
        self.start_ticker();
        tracing::info!(
            driver = self.runtime.driver_name(),
            image = self.image.image(),
            "starting runtime"
        );

        let socket = self.step(&cancel, self.runtime.ensure_running()).await?;
        let engine = self.step(&cancel, self.connector.connect(&socket)).await?;
        {
            let lifecycle = self.lifecycle();
            if lifecycle.startup.is_cancelled() {
                return Err(startup_cancelled());
            }
            self.ctx.engine.install(engine.clone());
        }

        self.step(&cancel, self.image.pull(engine.as_ref())).await?;

        if !self.advance(RuntimeStatus::Running) {
            return Err(startup_cancelled());
        }

        let records = match self.records.get_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("could not load plugin records: {}", e);
                self.events.broadcast(SandboxEvent::Error {
                    message: format!("could not load plugins: {}", e),
                });
                return Err(e);
            }
        };
        tracing::info!(plugins = records.len(), "starting plugins");

        let outcomes = join_all(records.into_iter().map(|record| async move {
            let plugin_id = record.id.clone();
            (plugin_id, self.start_plugin(record).await)
        }))
        .await;

        if cancel.is_cancelled() {
            return Err(startup_cancelled());
        }

        let mut report = StartupReport::default();
        for (plugin_id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.started.push(plugin_id),
                Err(e) => report.failed.push(PluginFailure {
                    plugin_id,
                    reason: e.to_string(),
                }),
            }
        }

        if let Some(message) = report.failure_message() {
            tracing::warn!("{}", message);
            self.events.broadcast(SandboxEvent::Error { message });
        }
        tracing::info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "startup complete"
        );
        Ok(report)
    }

    /// Start one plugin. A no-op if it is already registered.
    pub async fn start_plugin(&self, record: PluginRecord) -> Result<()> {
        let lock = self.plugin_lock(&record.id);
        let _guard = lock.lock().await;
        self.start_locked(record).await
    }

    async fn start_locked(&self, record: PluginRecord) -> Result<()> {
        if self.sandbox(&record.id).is_some() {
            tracing::debug!(plugin_id = %record.id, "plugin already started");
            return Ok(());
        }
        self.ctx.engine.get()?;

        let plugin_id = record.id.clone();
        let sandbox = PluginSandbox::create(record, &self.ctx).await;
        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.startup.is_cancelled() {
                return Err(plugin_cancelled(&plugin_id));
            }
            lifecycle
                .starting
                .insert(plugin_id.clone(), sandbox.cancel_token());
        }

        let outcome = sandbox.start().await;

        // Registration and stop_all's snapshot are serialised by the lifecycle lock
        let registered = {
            let mut lifecycle = self.lifecycle();
            lifecycle.starting.remove(&plugin_id);
            let keep = outcome.is_ok() && !lifecycle.startup.is_cancelled();
            if keep {
                self.sandboxes
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(plugin_id.clone(), sandbox.clone());
            }
            keep
        };

        match outcome {
            Ok(()) if registered => Ok(()),
            Ok(()) | Err(SandholdError::Cancelled(_)) => {
                // The engine stays installed until stop_all has waited for us
                if let Err(e) = sandbox.stop().await {
                    tracing::error!(plugin_id = %plugin_id, "cleanup after cancelled start failed: {}", e);
                    return Err(e);
                }
                Err(plugin_cancelled(&plugin_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Stop a plugin and forget it (uninstall path).
    pub async fn stop_plugin(&self, plugin_id: &str) -> Result<()> {
        let lock = self.plugin_lock(plugin_id);
        let result = {
            let _guard = lock.lock().await;
            self.stop_locked(plugin_id).await
        };
        self.forget_lock(plugin_id, &lock);
        result
    }

    /// Drop the per-plugin lock once nobody else holds a handle to it.
    fn forget_lock(&self, plugin_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.plugin_locks.lock().unwrap_or_else(|e| e.into_inner());
        // One count for the map, one for `lock`
        if Arc::strong_count(lock) == 2 && self.sandbox(plugin_id).is_none() {
            locks.remove(plugin_id);
        }
    }

    async fn stop_locked(&self, plugin_id: &str) -> Result<()> {
        let sandbox = self
            .sandboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id)
            .ok_or_else(|| SandholdError::PluginNotRegistered(plugin_id.to_string()))?;
        tracing::info!(plugin_id = %plugin_id, "stopping plugin");
        sandbox.stop().await
    }

    /// Stop the plugin if running and start it again from its current record.
    pub async fn restart_plugin(&self, plugin_id: &str) -> Result<()> {
        let record = self
            .records
            .get(plugin_id)
            .await?
            .ok_or_else(|| SandholdError::PluginNotRegistered(plugin_id.to_string()))?;

        let lock = self.plugin_lock(plugin_id);
        let _guard = lock.lock().await;
        match self.stop_locked(plugin_id).await {
            Ok(()) | Err(SandholdError::PluginNotRegistered(_)) => {}
            Err(e) => return Err(e),
        }
        self.start_locked(record).await
    }

    /// Stop every plugin, then the runtime. Nothing is broadcast afterwards.
    ///
    /// An in-flight `start` and any plugin still health-checking are cancelled
    /// and waited for before the runtime goes down.
    pub async fn stop_all(&self) -> Result<()> {
        let starting: Vec<String> = {
            let lifecycle = self.lifecycle();
            lifecycle.startup.cancel();
            self.set_status(RuntimeStatus::Stopping);
            for token in lifecycle.starting.values() {
                token.cancel();
            }
            lifecycle.starting.keys().cloned().collect()
        };

        let _startup = self.startup.lock().await;
        for plugin_id in &starting {
            let lock = self.plugin_lock(plugin_id);
            let _settled = lock.lock().await;
        }
        self.stop_ticker().await;

        let sandboxes: Vec<(String, Arc<PluginSandbox>)> = self
            .sandboxes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        join_all(sandboxes.into_iter().map(|(plugin_id, sandbox)| async move {
            let lock = self.plugin_lock(&plugin_id);
            let _guard = lock.lock().await;
            if let Err(e) = sandbox.stop().await {
                tracing::error!(plugin_id = %plugin_id, "stop failed: {}", e);
            }
        }))
        .await;

        let result = self.runtime.stop().await;
        if let Err(e) = &result {
            tracing::error!("runtime stop failed: {}", e);
        }
        self.ctx.engine.clear();
        self.set_status(RuntimeStatus::Stopped);
        self.plugin_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        result
    }

    /// Forward one request body to a plugin and stream its response into `sink`.
    pub async fn stream_to_plugin(
        &self,
        plugin_id: &str,
        body: Bytes,
        sink: mpsc::Sender<ProxyFrame>,
    ) -> Result<()> {
        self.registered(plugin_id)?
            .container()
            .stream_request(body, sink)
            .await
    }

    pub async fn plugin_logs(&self, plugin_id: &str, lines: usize) -> Result<Vec<String>> {
        self.registered(plugin_id)?
            .container()
            .recent_logs(lines)
            .await
    }

    pub fn check_plugin_exists(&self, plugin_id: &str) -> bool {
        self.sandbox(plugin_id).is_some()
    }

    pub fn status_summary(&self) -> StatusSummary {
        let mut sandboxes: Vec<Arc<PluginSandbox>> = self
            .sandboxes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        sandboxes.sort_by(|a, b| a.plugin_id().cmp(b.plugin_id()));

        let mut containers = BTreeMap::new();
        let mut tools = Vec::new();
        for sandbox in &sandboxes {
            let container = sandbox.container_state();
            containers.insert(
                sandbox.plugin_id().to_string(),
                ContainerView {
                    container_name: container.container_name,
                    host_port: container.host_port,
                    running: container.running,
                    state: sandbox.state(),
                    last_error: container.last_error,
                    log_file_path: container.log_file_path,
                },
            );
            tools.extend(sandbox.available_tools());
        }

        StatusSummary {
            status: self.status(),
            runtime: self.runtime.status(),
            image: self.image.status(),
            containers,
            tools,
        }
    }

    fn start_ticker(self: &Arc<Self>) {
        let mut slot = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = Arc::downgrade(self);
        let period = self.config.status_broadcast_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                let Some(orchestrator) = orchestrator.upgrade() else {
                    break;
                };
                orchestrator.events.broadcast(SandboxEvent::Status {
                    summary: Box::new(orchestrator.status_summary()),
                });
            }
        });

        *slot = Some(Ticker { cancel, handle });
    }

    async fn stop_ticker(&self) {
        let ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ticker) = ticker {
            ticker.cancel.cancel();
            let _ = ticker.handle.await;
        }
    }
}

fn startup_cancelled() -> SandholdError {
    SandholdError::Cancelled("startup".to_string())
}

fn plugin_cancelled(plugin_id: &str) -> SandholdError {
    SandholdError::Cancelled(format!("start of plugin '{}'", plugin_id))
}

impl Drop for SandboxOrchestrator {
    fn drop(&mut self) {
        if let Some(ticker) = self
            .ticker
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            ticker.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        test_config, MockAnalysisStore, MockClientFactory, MockConnector, MockDriver, MockEngine,
        MockRecordStore, RecordingSink,
    };
    use std::sync::atomic::Ordering;

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: MockEngine,
        connector: Arc<MockConnector>,
        driver: MockDriver,
        sink: Arc<RecordingSink>,
        orchestrator: Arc<SandboxOrchestrator>,
    }

    fn fixture(ids: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let engine = MockEngine::default();
        let connector = Arc::new(MockConnector::new(engine.clone()));
        let driver = MockDriver::new(true, false);
        let sink = Arc::new(RecordingSink::default());
        let clients = Arc::new(MockClientFactory::default());
        for id in ids {
            clients.set_tools(id, &["echo"]);
        }
        let records = ids.iter().map(|id| PluginRecord::new(*id)).collect();

        let orchestrator = SandboxOrchestrator::new(
            test_config(dir.path()),
            Collaborators {
                driver: Box::new(driver.clone()),
                connector: connector.clone(),
                records: Arc::new(MockRecordStore::new(records)),
                analyses: Arc::new(MockAnalysisStore::default()),
                clients,
                events: sink.clone(),
                http: reqwest::Client::new(),
            },
        );

        Fixture {
            _dir: dir,
            engine,
            connector,
            driver,
            sink,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn starts_all_plugins() {
        let f = fixture(&["a", "b"]);
        assert_eq!(f.orchestrator.status(), RuntimeStatus::NotInstalled);

        let report = f.orchestrator.start().await.unwrap();
        assert_eq!(report.started.len(), 2);
        assert!(report.failed.is_empty());

        let summary = f.orchestrator.status_summary();
        assert_eq!(summary.status, RuntimeStatus::Running);
        assert!(summary.runtime.running);
        assert_eq!(summary.image.percentage, 100);
        assert_eq!(summary.containers.len(), 2);
        assert_eq!(summary.containers["a"].state, SandboxState::Ready);
        let ids: Vec<&str> = summary.tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a__echo", "b__echo"]);

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn one_failed_create_leaves_the_rest_running() {
        let f = fixture(&["a", "b", "c"]);
        f.engine.fail_create("sandhold-b");

        let report = f.orchestrator.start().await.unwrap();

        let summary = f.orchestrator.status_summary();
        assert_eq!(summary.status, RuntimeStatus::Running);
        assert!(summary.containers.contains_key("a"));
        assert!(!summary.containers.contains_key("b"));
        assert!(summary.containers.contains_key("c"));

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].plugin_id, "b");
        let errors = f.sink.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("1 plugin(s) failed to start: b: "));

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn failed_image_pull_is_fatal() {
        let f = fixture(&["a", "b"]);
        f.engine.fail_pull("manifest unknown");

        let err = f.orchestrator.start().await.unwrap_err();
        assert!(matches!(err, SandholdError::ImagePull(_)));

        let summary = f.orchestrator.status_summary();
        assert_eq!(summary.status, RuntimeStatus::Error);
        assert!(summary.containers.is_empty());
        assert!(summary.image.error.is_some());
        assert!(f.engine.created().is_empty());
        assert_eq!(f.sink.errors().len(), 1);

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn runtime_failure_is_fatal() {
        let f = fixture(&["a"]);
        f.driver.fail_start.store(true, Ordering::SeqCst);

        let err = f.orchestrator.start().await.unwrap_err();
        assert!(matches!(err, SandholdError::RuntimeInstall(_)));
        assert_eq!(f.orchestrator.status(), RuntimeStatus::Error);
        assert_eq!(f.connector.connects.load(Ordering::SeqCst), 0);
        assert!(f.engine.pulls().is_empty());

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn starting_twice_keeps_one_container_per_plugin() {
        let f = fixture(&["a"]);
        f.orchestrator.start().await.unwrap();
        f.orchestrator.start().await.unwrap();
        f.orchestrator
            .start_plugin(PluginRecord::new("a"))
            .await
            .unwrap();

        assert_eq!(f.engine.created().len(), 1);
        assert_eq!(f.orchestrator.status_summary().containers.len(), 1);
        // The image is force-pulled on every startup
        assert_eq!(f.engine.pulls().len(), 2);

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_startup_is_rejected() {
        let f = fixture(&[]);
        let _held = f.orchestrator.startup.try_lock().unwrap();
        let err = f.orchestrator.start().await.unwrap_err();
        assert!(matches!(err, SandholdError::StartupInProgress));
    }

    #[tokio::test]
    async fn plugin_ops_before_startup_fail_fast() {
        let f = fixture(&[]);
        let err = f
            .orchestrator
            .start_plugin(PluginRecord::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandholdError::EngineNotReady));
    }

    #[tokio::test]
    async fn unknown_plugin_is_not_registered() {
        let f = fixture(&["a"]);
        f.orchestrator.start().await.unwrap();

        assert!(f.orchestrator.check_plugin_exists("a"));
        assert!(!f.orchestrator.check_plugin_exists("ghost"));

        let (tx, _rx) = mpsc::channel(1);
        let err = f
            .orchestrator
            .stream_to_plugin("ghost", Bytes::from_static(b"{}"), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, SandholdError::PluginNotRegistered(ref id) if id == "ghost"));

        let err = f.orchestrator.plugin_logs("ghost", 10).await.unwrap_err();
        assert!(matches!(err, SandholdError::PluginNotRegistered(_)));

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_stops_everything_and_goes_quiet() {
        let f = fixture(&["a", "b"]);
        f.orchestrator.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(f
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, SandboxEvent::Status { .. })));

        f.orchestrator.stop_all().await.unwrap();
        let summary = f.orchestrator.status_summary();
        assert_eq!(summary.status, RuntimeStatus::Stopped);
        assert!(summary.containers.is_empty());
        assert!(!summary.runtime.running);
        assert!(!f.engine.is_running("sandhold-a"));
        assert!(!f.engine.is_running("sandhold-b"));
        assert_eq!(f.driver.stops.load(Ordering::SeqCst), 1);

        let quiet_from = f.sink.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.sink.len(), quiet_from);

        assert!(matches!(
            f.orchestrator.start_plugin(PluginRecord::new("a")).await,
            Err(SandholdError::EngineNotReady)
        ));
    }

    #[tokio::test]
    async fn restart_reuses_the_container() {
        let f = fixture(&["a"]);
        f.orchestrator.start().await.unwrap();

        f.orchestrator.restart_plugin("a").await.unwrap();
        assert!(f.orchestrator.check_plugin_exists("a"));
        assert!(f.engine.is_running("sandhold-a"));
        assert_eq!(f.engine.created().len(), 1);

        let err = f.orchestrator.restart_plugin("ghost").await.unwrap_err();
        assert!(matches!(err, SandholdError::PluginNotRegistered(_)));

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn stop_plugin_removes_it() {
        let f = fixture(&["a", "b"]);
        f.orchestrator.start().await.unwrap();

        f.orchestrator.stop_plugin("a").await.unwrap();
        assert!(!f.orchestrator.check_plugin_exists("a"));
        assert!(!f.engine.is_running("sandhold-a"));
        assert!(f.engine.is_running("sandhold-b"));

        assert!(matches!(
            f.orchestrator.stop_plugin("a").await,
            Err(SandholdError::PluginNotRegistered(_))
        ));

        f.orchestrator.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_during_startup_wins() {
        let f = fixture(&["a"]);
        f.connector.delay_ms.store(300, Ordering::SeqCst);

        let starting = {
            let orchestrator = f.orchestrator.clone();
            tokio::spawn(async move { orchestrator.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        f.orchestrator.stop_all().await.unwrap();
        assert_eq!(f.orchestrator.status(), RuntimeStatus::Stopped);

        let err = starting.await.unwrap().unwrap_err();
        assert!(matches!(err, SandholdError::Cancelled(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let summary = f.orchestrator.status_summary();
        assert_eq!(summary.status, RuntimeStatus::Stopped);
        assert!(summary.containers.is_empty());
        assert!(f.engine.created().is_empty());
        assert!(f.engine.pulls().is_empty());
        assert!(matches!(
            f.orchestrator.start_plugin(PluginRecord::new("a")).await,
            Err(SandholdError::EngineNotReady)
        ));
    }

    #[tokio::test]
    async fn stop_all_cancels_health_checks_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.health_check_attempts = 20;
        config.health_check_interval_ms = 50;

        let engine = MockEngine::default();
        let clients = Arc::new(MockClientFactory::default());
        clients.fail_pings("a");
        let orchestrator = SandboxOrchestrator::new(
            config,
            Collaborators {
                driver: Box::new(MockDriver::new(true, false)),
                connector: Arc::new(MockConnector::new(engine.clone())),
                records: Arc::new(MockRecordStore::new(vec![PluginRecord::new("a")])),
                analyses: Arc::new(MockAnalysisStore::default()),
                clients: clients.clone(),
                events: Arc::new(RecordingSink::default()),
                http: reqwest::Client::new(),
            },
        );

        let starting = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.start().await })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(engine.is_running("sandhold-a"));

        orchestrator.stop_all().await.unwrap();
        let pings_at_stop = clients.pings("a");
        assert!(pings_at_stop < 20);
        assert!(!engine.is_running("sandhold-a"));

        assert!(matches!(
            starting.await.unwrap(),
            Err(SandholdError::Cancelled(_))
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(clients.pings("a"), pings_at_stop);
        assert!(!orchestrator.check_plugin_exists("a"));
        assert_eq!(orchestrator.status(), RuntimeStatus::Stopped);
    }

    #[tokio::test]
    async fn stopped_plugin_lock_is_released() {
        let f = fixture(&["a", "b"]);
        f.orchestrator.start().await.unwrap();

        f.orchestrator.stop_plugin("a").await.unwrap();
        let locks = f.orchestrator.plugin_locks.lock().unwrap();
        assert!(!locks.contains_key("a"));
        drop(locks);

        f.orchestrator.stop_all().await.unwrap();
    }

    #[test]
    fn failure_message_lists_each_plugin() {
        let report = StartupReport {
            started: vec!["a".to_string()],
            failed: vec![
                PluginFailure {
                    plugin_id: "b".to_string(),
                    reason: "create rejected".to_string(),
                },
                PluginFailure {
                    plugin_id: "c".to_string(),
                    reason: "port in use".to_string(),
                },
            ],
        };
        assert_eq!(
            report.failure_message().as_deref(),
            Some("2 plugin(s) failed to start: b: create rejected; c: port in use")
        );
        assert!(StartupReport::default().failure_message().is_none());
    }
}
