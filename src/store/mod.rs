//! Read-only views of the app database.
//!
//! Plugin definitions and tool classifications are written by other parts of
//! the app. The sandbox only ever reads them, through the two traits here.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_CONTAINER_PORT: u16 = 8080;

/// One installed plugin, as defined elsewhere in the app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    pub id: String,
    pub display_name: String,
    /// Dedicated image; `None` runs `command args` on the shared base image
    pub container_image: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub container_port: u16,
}

impl PluginRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            container_image: None,
            command: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            container_port: DEFAULT_CONTAINER_PORT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    #[default]
    Awaiting,
    InProgress,
    Error,
    Completed,
}

impl AnalysisStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::Awaiting => "awaiting",
            AnalysisStatus::InProgress => "in_progress",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "awaiting" => Some(AnalysisStatus::Awaiting),
            "in_progress" => Some(AnalysisStatus::InProgress),
            "error" => Some(AnalysisStatus::Error),
            "completed" => Some(AnalysisStatus::Completed),
            _ => None,
        }
    }
}

/// Classification of one tool, produced out of band by the analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolAnalysis {
    pub tool_name: String,
    pub status: AnalysisStatus,
    pub is_read: Option<bool>,
    pub is_write: Option<bool>,
    pub idempotent: Option<bool>,
    pub reversible: Option<bool>,
    pub analyzed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PluginRecordStore: Send + Sync {
    async fn get_all(&self) -> Result<Vec<PluginRecord>>;

    async fn get(&self, id: &str) -> Result<Option<PluginRecord>> {
        Ok(self.get_all().await?.into_iter().find(|r| r.id == id))
    }
}

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    async fn get_by_plugin_id(&self, plugin_id: &str) -> Result<Vec<ToolAnalysis>>;
}
