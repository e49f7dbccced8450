//! `podman machine` driver: the engine runs rootless inside a small VM.

use super::{MachineDriver, MachineStatus};
use crate::{Result, SandholdError};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
/// First boot downloads the machine image, so init/start get a long leash.
const BOOT_TIMEOUT: Duration = Duration::from_secs(600);
const STOP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MachineInspect {
    #[serde(default)]
    state: String,
    #[serde(default)]
    connection_info: Option<ConnectionInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ConnectionInfo {
    #[serde(default)]
    podman_socket: Option<SocketInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SocketInfo {
    path: PathBuf,
}

/// Parse `podman machine inspect` output (a JSON array of machines).
fn parse_inspect(stdout: &[u8]) -> Result<MachineStatus> {
    let machines: Vec<MachineInspect> = serde_json::from_slice(stdout)?;
    let Some(machine) = machines.into_iter().next() else {
        return Ok(MachineStatus::default());
    };

    let running = machine.state.eq_ignore_ascii_case("running");
    let socket_path = machine
        .connection_info
        .and_then(|c| c.podman_socket)
        .map(|s| s.path)
        .filter(|_| running);

    Ok(MachineStatus {
        installed: true,
        running,
        socket_path,
    })
}

/// Run `podman <args>` with a timeout, logging whatever it prints.
pub(super) async fn run_podman(args: &[&str], timeout: Duration) -> Result<Output> {
    tracing::debug!("executing: podman {}", args.join(" "));

    let output = tokio::time::timeout(timeout, Command::new("podman").args(args).output())
        .await
        .map_err(|_| {
            SandholdError::RuntimeInstall(format!(
                "podman {} timed out after {}s",
                args.join(" "),
                timeout.as_secs()
            ))
        })?
        .map_err(|e| SandholdError::RuntimeInstall(format!("failed to run podman: {}", e)))?;

    if !output.stdout.is_empty() {
        tracing::debug!("podman stdout: {}", String::from_utf8_lossy(&output.stdout).trim());
    }
    if !output.stderr.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            tracing::debug!("podman stderr: {}", stderr.trim());
        } else {
            tracing::info!("podman stderr: {}", stderr.trim());
        }
    }

    Ok(output)
}

fn failure(args: &[&str], output: &Output) -> SandholdError {
    SandholdError::RuntimeInstall(format!(
        "podman {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    ))
}

/// A named `podman machine` VM.
pub struct PodmanMachine {
    name: String,
}

impl PodmanMachine {
    pub fn new(name: String) -> Self {
        Self { name }
    }

    async fn inspect(&self) -> Result<MachineStatus> {
        let args = ["machine", "inspect", self.name.as_str()];
        let output = run_podman(&args, QUERY_TIMEOUT).await?;
        if output.status.success() {
            return parse_inspect(&output.stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("does not exist") || stderr.contains("no such") {
            return Ok(MachineStatus::default());
        }
        Err(failure(&args, &output))
    }
}

#[async_trait]
impl MachineDriver for PodmanMachine {
    fn name(&self) -> &'static str {
        "podman-machine"
    }

    async fn probe(&self) -> Result<MachineStatus> {
        self.inspect().await
    }

    async fn install(&self) -> Result<()> {
        let args = ["machine", "init", "--rootful=false", self.name.as_str()];
        let output = run_podman(&args, BOOT_TIMEOUT).await?;
        if !output.status.success() {
            return Err(failure(&args, &output));
        }
        Ok(())
    }

    async fn start(&self) -> Result<PathBuf> {
        let args = ["machine", "start", self.name.as_str()];
        let output = run_podman(&args, BOOT_TIMEOUT).await?;
        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if !output.status.success() && !stderr.contains("already running") {
            return Err(failure(&args, &output));
        }

        self.inspect().await?.socket_path.ok_or_else(|| {
            SandholdError::RuntimeInstall(format!(
                "machine '{}' started but reported no socket",
                self.name
            ))
        })
    }

    async fn stop(&self) -> Result<()> {
        let args = ["machine", "stop", self.name.as_str()];
        let output = run_podman(&args, STOP_TIMEOUT).await?;
        if !output.status.success() {
            return Err(failure(&args, &output));
        }
        Ok(())
    }
}
