//! Shared base image.
//!
//! Every startup force-pulls the image. The engine's "image exists" answer
//! is not trusted: it reports true against corrupted local storage, and the
//! engine caches layers anyway so a repeat pull is cheap.

use crate::engine::{ContainerEngine, PullProgress};
use crate::{Result, SandholdError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

const PULL_STARTED: &str = "Pulling base image";
const PULL_INITIATED: &str = "Pull initiated";
const PULL_DONE: &str = "Base image ready";

/// Band of the percentage scale given over to layer progress.
const LAYER_FLOOR: u8 = 5;
const LAYER_CEILING: u8 = 95;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePullStatus {
    pub percentage: u8,
    pub message: Option<String>,
    pub error: Option<String>,
}

/// Folds per-layer engine progress into one percentage that never goes back.
#[derive(Debug, Default)]
struct PullTracker {
    layers: HashMap<String, (u64, u64)>,
    percentage: u8,
}

impl PullTracker {
    fn observe(&mut self, progress: &PullProgress) -> u8 {
        if let Some(layer) = &progress.layer {
            let entry = self.layers.entry(layer.clone()).or_insert((0, 0));
            if let (Some(current), Some(total)) = (progress.current, progress.total) {
                if total > 0 {
                    *entry = (current.min(total), total);
                }
            }
            let finished = progress.status.as_deref().is_some_and(|s| {
                s.starts_with("Pull complete") || s.starts_with("Already exists")
            });
            if finished {
                let total = entry.1.max(1);
                *entry = (total, total);
            }
        }

        let (current, total) = self
            .layers
            .values()
            .fold((0u64, 0u64), |(c, t), (lc, lt)| (c + lc, t + lt));
        let span = u64::from(LAYER_CEILING - LAYER_FLOOR);
        let scaled = match total {
            0 => LAYER_FLOOR,
            _ => LAYER_FLOOR + (current.saturating_mul(span) / total).min(span) as u8,
        };

        self.percentage = self.percentage.max(scaled).max(LAYER_FLOOR);
        self.percentage
    }
}

pub struct BaseImage {
    image: String,
    status: watch::Sender<ImagePullStatus>,
}

impl BaseImage {
    pub fn new(image: impl Into<String>) -> Self {
        let (status, _) = watch::channel(ImagePullStatus::default());
        Self {
            image: image.into(),
            status,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn status(&self) -> ImagePullStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes as they happen.
    pub fn subscribe(&self) -> watch::Receiver<ImagePullStatus> {
        self.status.subscribe()
    }

    /// Force-pull the image, publishing progress milestones along the way.
    pub async fn pull(&self, engine: &dyn ContainerEngine) -> Result<()> {
        self.status.send_replace(ImagePullStatus {
            percentage: 0,
            message: Some(PULL_STARTED.to_string()),
            error: None,
        });
        tracing::info!(image = %self.image, "pulling base image");

        let tracker = Mutex::new(PullTracker::default());
        let on_progress = |progress: PullProgress| {
            let percentage = tracker
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .observe(&progress);
            self.status.send_if_modified(|status| {
                let message = if status.percentage == 0 {
                    Some(PULL_INITIATED.to_string())
                } else {
                    progress.status.clone().or_else(|| status.message.clone())
                };
                let changed = status.percentage != percentage || status.message != message;
                status.percentage = percentage;
                status.message = message;
                changed
            });
        };

        match engine.pull_image(&self.image, &on_progress).await {
            Ok(()) => {
                self.status.send_replace(ImagePullStatus {
                    percentage: 100,
                    message: Some(PULL_DONE.to_string()),
                    error: None,
                });
                tracing::info!(image = %self.image, "base image ready");
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    SandholdError::ImagePull(reason) => reason,
                    other => other.to_string(),
                };
                tracing::error!(image = %self.image, "base image pull failed: {}", reason);
                self.status.send_replace(ImagePullStatus {
                    percentage: 0,
                    message: None,
                    error: Some(reason.clone()),
                });
                Err(SandholdError::ImagePull(reason))
            }
        }
    }
}
