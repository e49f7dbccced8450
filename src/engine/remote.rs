//! Engine client over the runtime's Unix socket.
//!
//! Podman serves a Docker-compatible API next to its libpod one on the same
//! socket, so bollard drives both engines.

use super::{
    ContainerEngine, ContainerInfo, ContainerSpec, EngineConnector, ProgressFn, PullProgress,
};
use crate::{Result, SandholdError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// `ContainerEngine` backed by a bollard client.
#[derive(Clone)]
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect(socket_path: &Path, timeout_secs: u64) -> Result<Self> {
        let path = socket_path.to_string_lossy();
        let docker = Docker::connect_with_unix(&path, timeout_secs, bollard::API_DEFAULT_VERSION)?;
        Ok(Self { docker })
    }
}

fn port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

fn is_not_found(err: &BollardError) -> bool {
    matches!(
        err,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn pull_image(&self, image: &str, progress: ProgressFn<'_>) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| SandholdError::ImagePull(e.to_string()))?;
            let (current, total) = info
                .progress_detail
                .map(|d| (d.current, d.total))
                .unwrap_or((None, None));
            progress(PullProgress {
                layer: info.id,
                status: info.status,
                current: current.and_then(|v| u64::try_from(v).ok()),
                total: total.and_then(|v| u64::try_from(v).ok()),
            });
        }
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let response = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let running = response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        // Published ports only show up in network settings while the container
        // runs; fall back to the requested bindings otherwise.
        let published = response
            .network_settings
            .as_ref()
            .and_then(|n| n.ports.clone())
            .into_iter()
            .chain(
                response
                    .host_config
                    .as_ref()
                    .and_then(|h| h.port_bindings.clone()),
            );
        let host_port = published
            .flat_map(|ports| ports.into_values())
            .flatten()
            .flatten()
            .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()));

        Ok(Some(ContainerInfo {
            id: response.id.unwrap_or_default(),
            running,
            host_port,
        }))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let key = port_key(spec.container_port);

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        );

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(key, HashMap::new());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: spec.cmd.clone(),
            env: Some(spec.env.clone()),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in &response.warnings {
            tracing::warn!(container = %spec.name, "engine warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn stop_container(&self, name: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: i64::try_from(grace.as_secs()).unwrap_or(i64::MAX),
        };
        match self.docker.stop_container(name, Some(options)).await {
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    async fn kill_container(&self, name: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        self.docker.kill_container(name, Some(options)).await?;
        Ok(())
    }

    async fn container_logs(&self, name: &str, tail: usize) -> Result<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(name, Some(options));

        let mut raw = Vec::new();
        while let Some(chunk) = stream.next().await {
            raw.extend_from_slice(&chunk?.into_bytes());
        }
        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(str::to_string)
            .collect())
    }

    fn follow_logs(&self, name: &str) -> BoxStream<'static, Result<Bytes>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            tail: "0".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(name, Some(options))
            .map(|chunk| chunk.map(|c| c.into_bytes()).map_err(SandholdError::from))
            .boxed()
    }
}

/// Connects a [`BollardEngine`] and checks it answers before handing it out.
pub struct BollardConnector {
    timeout_secs: u64,
}

impl BollardConnector {
    pub fn new(timeout_secs: u64) -> Self {
        Self { timeout_secs }
    }
}

#[async_trait]
impl EngineConnector for BollardConnector {
    async fn connect(&self, socket_path: &Path) -> Result<Arc<dyn ContainerEngine>> {
        let engine = BollardEngine::connect(socket_path, self.timeout_secs)?;
        engine
            .ping()
            .await
            .map_err(|e| SandholdError::RuntimeInstall(format!("engine did not answer: {}", e)))?;
        tracing::debug!(socket = %socket_path.display(), "engine client connected");
        Ok(Arc::new(engine))
    }
}
