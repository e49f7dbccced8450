//! Container engine abstraction.
//!
//! Everything that talks to the engine's remote API goes through
//! [`ContainerEngine`]. The single configured client lives in an
//! [`EngineSlot`], which stays empty until the runtime has published its
//! socket; callers that reach for it earlier get `EngineNotReady` straight away.

mod remote;

pub use remote::{BollardConnector, BollardEngine};

use crate::{Result, SandholdError};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Everything needed to create one plugin container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    pub env: Vec<String>,
    pub container_port: u16,
    pub host_port: u16,
    pub labels: HashMap<String, String>,
}

/// What the engine reports about an existing container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub host_port: Option<u16>,
}

/// One progress message from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub layer: Option<String>,
    pub status: Option<String>,
    pub current: Option<u64>,
    pub total: Option<u64>,
}

/// Callback receiving pull progress as the engine reports it.
pub type ProgressFn<'a> = &'a (dyn Fn(PullProgress) + Send + Sync);

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Pull `image` unconditionally, reporting progress as it arrives.
    async fn pull_image(&self, image: &str, progress: ProgressFn<'_>) -> Result<()>;

    /// `Ok(None)` when no container with that name exists.
    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>>;

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    async fn start_container(&self, name: &str) -> Result<()>;

    /// Ask the container to stop, giving it `grace` before the engine escalates.
    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()>;

    async fn kill_container(&self, name: &str) -> Result<()>;

    /// Last `tail` lines of combined stdout/stderr.
    async fn container_logs(&self, name: &str, tail: usize) -> Result<Vec<String>>;

    /// Live output from the container, until it exits or the stream is dropped.
    fn follow_logs(&self, name: &str) -> BoxStream<'static, Result<Bytes>>;
}

/// Builds an engine client once the runtime has a socket to offer.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, socket_path: &Path) -> Result<Arc<dyn ContainerEngine>>;
}

/// Holder for the shared engine client.
#[derive(Clone, Default)]
pub struct EngineSlot {
    inner: Arc<RwLock<Option<Arc<dyn ContainerEngine>>>>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, engine: Arc<dyn ContainerEngine>) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(engine);
    }

    pub fn clear(&self) {
        let mut slot = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    pub fn is_ready(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The configured client, or `EngineNotReady` if none is installed yet.
    pub fn get(&self) -> Result<Arc<dyn ContainerEngine>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(SandholdError::EngineNotReady)
    }
}

impl std::fmt::Debug for EngineSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineSlot")
            .field("ready", &self.is_ready())
            .finish()
    }
}
