//! Canonical event taxonomy and wire-name constants.
//!
//! Single source of truth for which wire names the pipeline understands and
//! what they mean once normalized.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Wire names
// ---------------------------------------------------------------------------

pub const WIRE_TRAINING_CONNECTED: &str = "training_connected";
pub const WIRE_TRAINING_PROGRESS: &str = "training_training";
pub const WIRE_TRAINING_COMPLETED: &str = "training_completed";
pub const WIRE_TRAINING_FAILED: &str = "training_failed";

/// Task id used when an event arrives for an agent with no known task.
pub const UNKNOWN_TASK_ID: &str = "unknown";

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Progress,
    Completed,
    Failed,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Extraction,
    Embedding,
    Completion,
    Other,
}

impl TrainingPhase {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
            Self::Completion => "completion",
            Self::Other => "other",
        }
    }
}

impl FromStr for TrainingPhase {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "extraction" | "extracting" => Self::Extraction,
            "embedding" | "embeddings" => Self::Embedding,
            "completion" | "completing" | "finalizing" => Self::Completion,
            _ => Self::Other,
        })
    }
}

/// Progress details attached to `progress` frames. Every field is optional
/// on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMetadata {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, alias = "processedCount", alias = "processed_count")]
    pub processed: Option<u64>,
    #[serde(default, alias = "totalCount", alias = "total_count")]
    pub total: Option<u64>,
    #[serde(default, alias = "currentSource")]
    pub current_source: Option<String>,
}

impl ProgressMetadata {
    pub fn phase(&self) -> Option<TrainingPhase> {
        self.phase.as_deref().and_then(|raw| raw.parse().ok())
    }

    /// processed / total clamped to `[0, 1]`; `None` without a usable total.
    pub fn fraction(&self) -> Option<f64> {
        let total = self.total.filter(|total| *total > 0)?;
        let processed = self.processed.unwrap_or(0);
        Some((processed as f64 / total as f64).clamp(0.0, 1.0))
    }
}

// ---------------------------------------------------------------------------
// Canonical event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub kind: EventKind,
    pub agent_id: String,
    pub task_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalEvent {
    /// Hash of the event's logical content, ignoring its timestamp. Two
    /// deliveries of the same server frame share a key.
    pub fn content_key(&self) -> String {
        let progress = self.progress.clone().unwrap_or_default();
        let parts = [
            self.kind.as_str().to_string(),
            self.agent_id.clone(),
            self.task_id.clone(),
            self.status.clone(),
            progress.phase.unwrap_or_default(),
            progress.processed.map(|v| v.to_string()).unwrap_or_default(),
            progress.total.map(|v| v.to_string()).unwrap_or_default(),
            progress.message.unwrap_or_default(),
            self.error_message.clone().unwrap_or_default(),
        ];

        let mut hasher = Sha256::new();
        for part in &parts {
            hasher.update(part.as_bytes());
            hasher.update([0x1f]);
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}
