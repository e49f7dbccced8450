//! Events pushed to observers (the UI, `sandhold watch`).

use crate::orchestrator::StatusSummary;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Startup phase of a single plugin, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginPhase {
    Starting,
    HealthChecking,
    Ready,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SandboxEvent {
    /// Periodic full snapshot
    Status { summary: Box<StatusSummary> },

    /// One plugin moved through its startup
    PluginProgress {
        plugin_id: String,
        phase: PluginPhase,
        message: Option<String>,
    },

    /// A failure the user should see
    Error { message: String },
}

/// Fire-and-forget push to whoever is listening.
pub trait BroadcastSink: Send + Sync {
    fn broadcast(&self, event: SandboxEvent);
}

/// `BroadcastSink` backed by a tokio broadcast channel.
///
/// Slow subscribers lag and drop old events rather than holding up the sender.
#[derive(Clone)]
pub struct ChannelBroadcaster {
    tx: broadcast::Sender<SandboxEvent>,
}

impl ChannelBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChannelBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl BroadcastSink for ChannelBroadcaster {
    fn broadcast(&self, event: SandboxEvent) {
        // Err only means nobody is subscribed right now
        let _ = self.tx.send(event);
    }
}
