//! One plugin: its container, its protocol client and its tool cache.
//!
//! ```text
//! starting ──► health_checking ──► ready
//!    │                │  └───────► degraded ──(refresh)──► ready
//!    └────────────────┴──► error
//! any ──stop──► stopped
//! ```

pub mod analysis;

pub use analysis::{tool_id, AnalysisCache, ToolClassification, ToolDescriptor};

use crate::config::{HealthPolicy, SandholdConfig};
use crate::container::{ContainerHandle, ContainerState};
use crate::engine::EngineSlot;
use crate::events::{BroadcastSink, PluginPhase, SandboxEvent};
use crate::protocol::{PluginClient, PluginClientFactory, RemoteTool};
use crate::store::{AnalysisStore, PluginRecord};
use crate::{Result, SandholdError};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Starting,
    HealthChecking,
    Ready,
    /// Running, but not confirmed healthy or its tools could not be listed
    Degraded,
    Error,
    Stopped,
}

/// Collaborators shared by every sandbox.
#[derive(Clone)]
pub struct SandboxContext {
    pub config: Arc<SandholdConfig>,
    pub engine: EngineSlot,
    pub http: reqwest::Client,
    pub clients: Arc<dyn PluginClientFactory>,
    pub analyses: Arc<dyn AnalysisStore>,
    pub events: Arc<dyn BroadcastSink>,
}

pub struct PluginSandbox {
    record: PluginRecord,
    container: ContainerHandle,
    config: Arc<SandholdConfig>,
    clients: Arc<dyn PluginClientFactory>,
    analyses: Arc<dyn AnalysisStore>,
    events: Arc<dyn BroadcastSink>,
    state: RwLock<SandboxState>,
    client: RwLock<Option<Arc<dyn PluginClient>>>,
    tools: RwLock<Vec<RemoteTool>>,
    cache: RwLock<AnalysisCache>,
    cancel: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl PluginSandbox {
    /// Build a sandbox and warm its classification cache.
    pub async fn create(record: PluginRecord, ctx: &SandboxContext) -> Arc<Self> {
        let container =
            ContainerHandle::new(&record, &ctx.config, ctx.engine.clone(), ctx.http.clone());
        let sandbox = Arc::new(Self {
            record,
            container,
            config: ctx.config.clone(),
            clients: ctx.clients.clone(),
            analyses: ctx.analyses.clone(),
            events: ctx.events.clone(),
            state: RwLock::new(SandboxState::Starting),
            client: RwLock::new(None),
            tools: RwLock::new(Vec::new()),
            cache: RwLock::new(AnalysisCache::default()),
            cancel: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        });
        sandbox.reload_analysis().await;
        sandbox
    }

    pub fn plugin_id(&self) -> &str {
        &self.record.id
    }

    /// Fires when the sandbox is stopped or its start is abandoned.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    pub fn container_state(&self) -> ContainerState {
        self.container.state()
    }

    pub fn state(&self) -> SandboxState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SandboxState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn progress(&self, phase: PluginPhase, message: Option<String>) {
        self.events.broadcast(SandboxEvent::PluginProgress {
            plugin_id: self.record.id.clone(),
            phase,
            message,
        });
    }

    fn fail(&self, err: SandholdError) -> SandholdError {
        self.set_state(SandboxState::Error);
        self.progress(PluginPhase::Failed, Some(err.to_string()));
        err
    }

    /// Bring the container up, wait for it to answer, then list its tools.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let plugin_id = self.record.id.clone();
        self.set_state(SandboxState::Starting);
        self.progress(PluginPhase::Starting, None);

        if let Err(e) = self.container.start_or_create().await {
            return Err(self.fail(e));
        }

        let Some(endpoint) = self.container.endpoint() else {
            return Err(self.fail(SandholdError::ContainerStart {
                plugin_id,
                reason: "container has no published port".to_string(),
            }));
        };
        let client = self.clients.client_for(&plugin_id, &endpoint);
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = Some(client.clone());

        self.set_state(SandboxState::HealthChecking);
        self.progress(PluginPhase::HealthChecking, None);

        let healthy = self.wait_healthy(client.as_ref()).await?;
        if !healthy {
            let attempts = self.config.health_check_attempts;
            match self.config.health_policy {
                HealthPolicy::Fail => {
                    if let Err(e) = self.container.stop().await {
                        tracing::warn!(plugin_id = %plugin_id, "cleanup after failed health check: {}", e);
                    }
                    return Err(self.fail(SandholdError::HealthCheckExhausted {
                        plugin_id,
                        attempts,
                    }));
                }
                HealthPolicy::Proceed => {
                    tracing::warn!(
                        plugin_id = %plugin_id,
                        attempts,
                        "no successful health check, proceeding to tool discovery"
                    );
                }
            }
        }

        match self.discover_tools(client.as_ref()).await {
            Ok(count) => {
                self.set_state(SandboxState::Ready);
                self.progress(PluginPhase::Ready, Some(format!("{} tools", count)));
            }
            Err(e) => {
                tracing::warn!(plugin_id = %plugin_id, "tool discovery failed: {}", e);
                self.set_state(SandboxState::Degraded);
                self.progress(PluginPhase::Degraded, Some(e.to_string()));
            }
        }

        self.spawn_refresh();
        Ok(())
    }

    /// Probe until a ping succeeds. `Ok(false)` when attempts run out.
    async fn wait_healthy(&self, client: &dyn PluginClient) -> Result<bool> {
        let attempts = self.config.health_check_attempts;
        let interval = self.config.health_check_interval();

        for attempt in 1..=attempts {
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => None,
                result = client.ping() => Some(result),
            };
            match outcome {
                None => return Err(self.cancelled()),
                Some(Ok(())) => {
                    tracing::debug!(plugin_id = %self.record.id, attempt, "health check passed");
                    return Ok(true);
                }
                Some(Err(e)) => {
                    tracing::debug!(plugin_id = %self.record.id, attempt, "health check failed: {}", e);
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(self.cancelled()),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        Ok(false)
    }

    fn cancelled(&self) -> SandholdError {
        SandholdError::Cancelled(format!("start of plugin '{}'", self.record.id))
    }

    async fn discover_tools(&self, client: &dyn PluginClient) -> Result<usize> {
        client.initialize().await?;
        let tools = client.list_tools().await?;
        let count = tools.len();
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = tools;
        tracing::info!(plugin_id = %self.record.id, tools = count, "tools discovered");
        Ok(count)
    }

    /// Pull classifications from the store; only newer ones land in the cache.
    async fn reload_analysis(&self) {
        match self.analyses.get_by_plugin_id(&self.record.id).await {
            Ok(analyses) => {
                let changed = self
                    .cache
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .apply_all(analyses);
                if changed > 0 {
                    tracing::debug!(plugin_id = %self.record.id, changed, "tool analysis updated");
                }
            }
            Err(e) => {
                tracing::warn!(plugin_id = %self.record.id, "could not load tool analysis: {}", e);
            }
        }
    }

    async fn refresh(&self) {
        self.reload_analysis().await;

        if self.state() != SandboxState::Degraded {
            return;
        }
        let client = self
            .client
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(client) = client else {
            return;
        };
        if self.discover_tools(client.as_ref()).await.is_ok() {
            self.set_state(SandboxState::Ready);
            self.progress(PluginPhase::Ready, None);
        }
    }

    fn spawn_refresh(self: &Arc<Self>) {
        let mut slot = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let sandbox = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let period = self.config.analysis_refresh_interval();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(sandbox) = sandbox.upgrade() else {
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sandbox.refresh() => {}
                }
            }
        }));
    }

    /// Stop background work, then the container. Waits for the container to exit.
    pub async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let result = self.container.stop().await;

        let client = self
            .client
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(client) = client {
            client.close().await;
        }

        self.set_state(SandboxState::Stopped);
        result
    }

    /// Live tools joined with whatever classification is cached.
    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        tools
            .iter()
            .map(|tool| {
                ToolDescriptor::new(
                    &self.record.id,
                    &self.record.display_name,
                    tool,
                    cache.get(&tool.name),
                )
            })
            .collect()
    }
}

impl Drop for PluginSandbox {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
