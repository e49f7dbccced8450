//! Tool descriptors and the per-plugin classification cache.

use crate::protocol::RemoteTool;
use crate::store::{AnalysisStatus, ToolAnalysis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const TOOL_ID_SEPARATOR: &str = "__";

/// Globally unique tool id: `<plugin_id>__<tool_name>`.
pub fn tool_id(plugin_id: &str, tool_name: &str) -> String {
    format!("{}{}{}", plugin_id, TOOL_ID_SEPARATOR, tool_name)
}

/// Classification flags as shown to the UI. `None` means not known yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolClassification {
    pub status: AnalysisStatus,
    pub is_read: Option<bool>,
    pub is_write: Option<bool>,
    pub idempotent: Option<bool>,
    pub reversible: Option<bool>,
}

impl From<&ToolAnalysis> for ToolClassification {
    fn from(analysis: &ToolAnalysis) -> Self {
        Self {
            status: analysis.status,
            is_read: analysis.is_read,
            is_write: analysis.is_write,
            idempotent: analysis.idempotent,
            reversible: analysis.reversible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub plugin_id: String,
    pub plugin_name: String,
    pub analysis: ToolClassification,
}

impl ToolDescriptor {
    pub fn new(
        plugin_id: &str,
        plugin_name: &str,
        tool: &RemoteTool,
        analysis: Option<&ToolAnalysis>,
    ) -> Self {
        Self {
            id: tool_id(plugin_id, &tool.name),
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
            plugin_id: plugin_id.to_string(),
            plugin_name: plugin_name.to_string(),
            analysis: analysis.map(ToolClassification::from).unwrap_or_default(),
        }
    }
}

/// Latest known classification per tool name.
///
/// Entries only move forward in time: an analysis replaces the cached one
/// only when its `analyzed_at` is strictly newer.
#[derive(Debug, Default)]
pub struct AnalysisCache {
    entries: HashMap<String, ToolAnalysis>,
}

impl AnalysisCache {
    /// Returns true if the cache changed.
    pub fn apply(&mut self, analysis: ToolAnalysis) -> bool {
        match self.entries.get(&analysis.tool_name) {
            Some(cached) if analysis.analyzed_at <= cached.analyzed_at => false,
            _ => {
                self.entries.insert(analysis.tool_name.clone(), analysis);
                true
            }
        }
    }

    /// Apply a batch, returning how many entries changed.
    pub fn apply_all(&mut self, analyses: impl IntoIterator<Item = ToolAnalysis>) -> usize {
        analyses
            .into_iter()
            .map(|analysis| self.apply(analysis))
            .filter(|changed| *changed)
            .count()
    }

    pub fn get(&self, tool_name: &str) -> Option<&ToolAnalysis> {
        self.entries.get(tool_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
