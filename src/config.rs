//! Sandhold configuration.

use crate::{Result, SandholdError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Shared image every plugin container runs from unless its record names another.
pub const DEFAULT_BASE_IMAGE: &str = "docker.io/archestra/mcp-server-base:0.0.1";

/// Which machine driver brings up the container engine.
///
/// Parsed from a closed set of names; anything else is rejected when the
/// config is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DriverKind {
    /// Pick per platform: native service on Linux, a VM elsewhere.
    Auto,
    /// `podman machine` VM.
    PodmanMachine,
    /// Native rootless `podman system service`.
    PodmanService,
}

impl DriverKind {
    pub const NAMES: [&'static str; 3] = ["auto", "podman-machine", "podman-service"];

    pub fn as_str(self) -> &'static str {
        match self {
            DriverKind::Auto => "auto",
            DriverKind::PodmanMachine => "podman-machine",
            DriverKind::PodmanService => "podman-service",
        }
    }

    /// Resolve `Auto` to the concrete driver for this platform.
    pub fn resolve(self) -> DriverKind {
        match self {
            DriverKind::Auto if cfg!(target_os = "linux") => DriverKind::PodmanService,
            DriverKind::Auto => DriverKind::PodmanMachine,
            other => other,
        }
    }
}

impl FromStr for DriverKind {
    type Err = SandholdError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(DriverKind::Auto),
            "podman-machine" => Ok(DriverKind::PodmanMachine),
            "podman-service" => Ok(DriverKind::PodmanService),
            other => Err(SandholdError::Config(format!(
                "unknown runtime driver '{}' (expected one of: {})",
                other,
                Self::NAMES.join(", ")
            ))),
        }
    }
}

impl TryFrom<String> for DriverKind {
    type Error = SandholdError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<DriverKind> for String {
    fn from(kind: DriverKind) -> Self {
        kind.as_str().to_string()
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What to do when a plugin never answers its liveness probe.
///
/// `Proceed` keeps the container and carries on with tool discovery, on the
/// assumption that the server may still come up later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthPolicy {
    #[default]
    Proceed,
    Fail,
}

/// Runtime config for the orchestrator and its components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandholdConfig {
    pub base_image: String,
    pub machine_name: String,
    pub driver: DriverKind,
    pub health_check_attempts: u32,
    pub health_check_interval_ms: u64,
    pub health_policy: HealthPolicy,
    pub stop_grace_secs: u64,
    pub stop_escalation_ms: u64,
    pub status_broadcast_interval_ms: u64,
    pub analysis_refresh_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub engine_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
}

impl Default for SandholdConfig {
    fn default() -> Self {
        Self {
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            machine_name: "sandhold-machine".to_string(),
            driver: DriverKind::Auto,
            health_check_attempts: 30,
            health_check_interval_ms: 1_000,
            health_policy: HealthPolicy::Proceed,
            stop_grace_secs: 10,
            stop_escalation_ms: 15_000,
            status_broadcast_interval_ms: 1_000,
            analysis_refresh_interval_ms: 5_000,
            request_timeout_secs: 30,
            engine_timeout_secs: 120,
            data_dir: default_data_dir(),
            database_path: None,
            socket_path: None,
        }
    }
}

impl SandholdConfig {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| SandholdError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load `<data_dir>/config.json` when present, defaults otherwise.
    pub fn load_default() -> Result<Self> {
        let path = default_data_dir().join("config.json");
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn stop_escalation(&self) -> Duration {
        Duration::from_millis(self.stop_escalation_ms)
    }

    pub fn status_broadcast_interval(&self) -> Duration {
        Duration::from_millis(self.status_broadcast_interval_ms)
    }

    pub fn analysis_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.analysis_refresh_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("sandhold.db"))
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(crate::daemon::default_socket_path)
    }
}

/// `~/.sandhold`, or `./.sandhold` when no home directory can be found.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sandhold")
}
