//! Native rootless `podman system service` driver (Linux).
//!
//! There is nothing to install beyond the podman binary itself. If the user
//! session already runs the API socket we use it; otherwise we spawn a
//! service process and own it until `stop`.

use super::podman::run_podman;
use super::{MachineDriver, MachineStatus};
use crate::{Result, SandholdError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const SOCKET_WAIT: Duration = Duration::from_secs(30);
const SOCKET_POLL: Duration = Duration::from_millis(100);

/// Where the rootless API socket lives for the current user.
pub fn default_service_socket() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            // SAFETY: getuid has no preconditions and cannot fail.
            let uid = unsafe { libc::getuid() };
            PathBuf::from(format!("/run/user/{}", uid))
        });
    runtime_dir.join("podman").join("podman.sock")
}

/// Drain the service's stderr into the log so a chatty podman never blocks
/// on a full pipe. Resolves to the number of lines read once the pipe closes.
fn forward_stderr<R>(stderr: R) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut count = 0;
        while let Ok(Some(line)) = lines.next_line().await {
            count += 1;
            tracing::debug!(target: "sandhold::podman", "{}", line);
        }
        count
    })
}

pub struct PodmanService {
    socket_path: PathBuf,
    /// Service process we spawned, if any
    child: Mutex<Option<Child>>,
}

impl PodmanService {
    pub fn new() -> Self {
        Self::with_socket(default_service_socket())
    }

    pub fn with_socket(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            child: Mutex::new(None),
        }
    }

    async fn podman_available(&self) -> bool {
        match run_podman(&["--version"], VERSION_TIMEOUT).await {
            Ok(output) => output.status.success(),
            Err(e) => {
                tracing::debug!("podman not available: {}", e);
                false
            }
        }
    }

    async fn child_alive(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.as_mut() {
            Some(process) => match process.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    tracing::warn!("podman service exited: {}", status);
                    *child = None;
                    false
                }
                Err(e) => {
                    tracing::warn!("could not poll podman service: {}", e);
                    false
                }
            },
            None => false,
        }
    }

    async fn wait_for_socket(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.socket_path.exists() {
                return Ok(());
            }
            if !self.child_alive().await {
                return Err(SandholdError::RuntimeInstall(
                    "podman service exited before creating its socket".to_string(),
                ));
            }
            tokio::time::sleep(SOCKET_POLL).await;
        }
        Err(SandholdError::RuntimeInstall(format!(
            "socket {} did not appear within {}s",
            self.socket_path.display(),
            SOCKET_WAIT.as_secs()
        )))
    }
}

impl Default for PodmanService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineDriver for PodmanService {
    fn name(&self) -> &'static str {
        "podman-service"
    }

    async fn probe(&self) -> Result<MachineStatus> {
        if !self.podman_available().await {
            return Ok(MachineStatus::default());
        }
        let running = self.socket_path.exists();
        Ok(MachineStatus {
            installed: true,
            running,
            socket_path: running.then(|| self.socket_path.clone()),
        })
    }

    async fn install(&self) -> Result<()> {
        if self.podman_available().await {
            return Ok(());
        }
        Err(SandholdError::RuntimeInstall(
            "podman is not installed; install it with your distribution's package manager"
                .to_string(),
        ))
    }

    async fn start(&self) -> Result<PathBuf> {
        if self.socket_path.exists() {
            return Ok(self.socket_path.clone());
        }

        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        {
            let mut child = self.child.lock().await;
            if child.is_none() {
                let uri = format!("unix://{}", self.socket_path.display());
                tracing::debug!("executing: podman system service --time=0 {}", uri);
                let mut process = Command::new("podman")
                    .args(["system", "service", "--time=0", uri.as_str()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        SandholdError::RuntimeInstall(format!("failed to spawn podman service: {}", e))
                    })?;
                tracing::info!(pid = ?process.id(), "spawned podman service");
                if let Some(stderr) = process.stderr.take() {
                    forward_stderr(stderr);
                }
                *child = Some(process);
            }
        }

        self.wait_for_socket().await?;
        Ok(self.socket_path.clone())
    }

    async fn stop(&self) -> Result<()> {
        let Some(mut process) = self.child.lock().await.take() else {
            // Not ours to stop
            tracing::debug!("podman service was not started by us; leaving it running");
            return Ok(());
        };

        process.kill().await?;
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        Ok(())
    }
}
