//! Container runtime lifecycle.
//!
//! One [`RuntimeManager`] owns the VM or daemon that hosts the container
//! engine. The platform-specific work sits behind [`MachineDriver`].

mod podman;
mod service;

pub use podman::PodmanMachine;
pub use service::PodmanService;

use crate::config::{DriverKind, SandholdConfig};
use crate::{Result, SandholdError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::RwLock;
use tokio::sync::Mutex;

/// Install/run state of the engine host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineStatus {
    pub installed: bool,
    pub running: bool,
    pub socket_path: Option<PathBuf>,
}

#[async_trait]
pub trait MachineDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current state, without changing anything.
    async fn probe(&self) -> Result<MachineStatus>;

    async fn install(&self) -> Result<()>;

    /// Start the engine and return the socket it listens on.
    async fn start(&self) -> Result<PathBuf>;

    async fn stop(&self) -> Result<()>;
}

/// Build the driver named by the config.
pub fn driver_for(config: &SandholdConfig) -> Box<dyn MachineDriver> {
    match config.driver.resolve() {
        DriverKind::PodmanService => Box::new(PodmanService::new()),
        DriverKind::PodmanMachine | DriverKind::Auto => {
            Box::new(PodmanMachine::new(config.machine_name.clone()))
        }
    }
}

/// Owns the engine host for the life of the process.
pub struct RuntimeManager {
    driver: Box<dyn MachineDriver>,
    status: RwLock<MachineStatus>,
    /// Serialises ensure_running/stop against each other
    op_lock: Mutex<()>,
}

impl RuntimeManager {
    pub fn new(driver: Box<dyn MachineDriver>) -> Self {
        Self {
            driver,
            status: RwLock::new(MachineStatus::default()),
            op_lock: Mutex::new(()),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// Install if missing, start if stopped, and return the engine socket.
    ///
    /// A no-op when the engine is already up.
    pub async fn ensure_running(&self) -> Result<PathBuf> {
        let _guard = self.op_lock.lock().await;

        let current = self.driver.probe().await.map_err(into_install_error)?;
        if current.running {
            if let Some(socket) = current.socket_path.clone() {
                tracing::debug!(driver = self.driver.name(), "runtime already running");
                self.publish(current);
                return Ok(socket);
            }
        }

        if !current.installed {
            tracing::info!(driver = self.driver.name(), "installing container runtime");
            self.driver.install().await.map_err(into_install_error)?;
            self.publish(MachineStatus {
                installed: true,
                ..MachineStatus::default()
            });
        }

        tracing::info!(driver = self.driver.name(), "starting container runtime");
        let socket = self.driver.start().await.map_err(into_install_error)?;
        tracing::info!(socket = %socket.display(), "container runtime ready");

        self.publish(MachineStatus {
            installed: true,
            running: true,
            socket_path: Some(socket.clone()),
        });
        Ok(socket)
    }

    /// Stop the engine host. A no-op when it is not running.
    pub async fn stop(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        let current = self.driver.probe().await?;
        if !current.running {
            self.publish(MachineStatus {
                running: false,
                socket_path: None,
                ..current
            });
            return Ok(());
        }

        tracing::info!(driver = self.driver.name(), "stopping container runtime");
        self.driver.stop().await?;
        self.publish(MachineStatus {
            installed: current.installed,
            running: false,
            socket_path: None,
        });
        Ok(())
    }

    pub fn status(&self) -> MachineStatus {
        self.status
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, status: MachineStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

fn into_install_error(err: SandholdError) -> SandholdError {
    match err {
        SandholdError::RuntimeInstall(_) => err,
        other => SandholdError::RuntimeInstall(other.to_string()),
    }
}
