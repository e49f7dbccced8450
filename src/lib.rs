//! Sandhold: sandbox orchestration for MCP plugin servers
//!
//! Runs each installed plugin in its own container on a rootless engine that
//! lives inside a local VM (or a native engine service), and keeps one
//! consistent view of runtime, container and tool state for the rest of the app.

pub mod cli;
pub mod config;
pub mod container;
pub mod daemon;
pub mod engine;
pub mod events;
pub mod image;
pub mod orchestrator;
pub mod protocol;
pub mod runtime;
pub mod sandbox;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandholdError {
    #[error("Container runtime failed to install or start: {0}")]
    RuntimeInstall(String),

    #[error("Base image pull failed: {0}")]
    ImagePull(String),

    #[error("Container for plugin '{plugin_id}' failed to start: {reason}")]
    ContainerStart { plugin_id: String, reason: String },

    #[error("Plugin '{plugin_id}' did not pass its health check after {attempts} attempts")]
    HealthCheckExhausted { plugin_id: String, attempts: u32 },

    #[error("Plugin not registered: {0}")]
    PluginNotRegistered(String),

    #[error("Container engine is not ready (no socket published yet)")]
    EngineNotReady,

    #[error("Container '{0}' did not exit after stop and kill")]
    StopTimeout(String),

    #[error("Startup is already in progress")]
    StartupInProgress,

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Daemon error: {0}")]
    Daemon(String),
}

impl From<bollard::errors::Error> for SandholdError {
    fn from(err: bollard::errors::Error) -> Self {
        SandholdError::Engine(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SandholdError>;
