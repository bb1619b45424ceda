//! Maps raw stream frames onto canonical training events.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::bus::event_types::{
    CanonicalEvent, EventKind, ProgressMetadata, UNKNOWN_TASK_ID, WIRE_TRAINING_COMPLETED,
    WIRE_TRAINING_CONNECTED, WIRE_TRAINING_FAILED, WIRE_TRAINING_PROGRESS,
};

use super::sse::SseEvent;

/// Wire event name → canonical kind.
const EVENT_TABLE: &[(&str, EventKind)] = &[
    (WIRE_TRAINING_CONNECTED, EventKind::Connected),
    (WIRE_TRAINING_PROGRESS, EventKind::Progress),
    (WIRE_TRAINING_COMPLETED, EventKind::Completed),
    (WIRE_TRAINING_FAILED, EventKind::Failed),
];

pub fn canonical_kind(event_name: &str) -> Option<EventKind> {
    EVENT_TABLE
        .iter()
        .find(|(name, _)| *name == event_name)
        .map(|(_, kind)| *kind)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown event name: {0}")]
    UnknownEvent(String),
    #[error("malformed payload for {event}: {message}")]
    MalformedPayload { event: String, message: String },
    #[error("payload for agent {payload_agent} arrived on the stream for agent {stream_agent}")]
    AgentMismatch {
        stream_agent: String,
        payload_agent: String,
    },
}

/// Resolves the task an agent's events belong to.
pub trait TaskLookup: Send + Sync {
    fn task_for(&self, agent_id: &str) -> Option<String>;
}

#[derive(Debug, Default, Deserialize)]
struct WirePayload {
    #[serde(default, alias = "agentId")]
    agent_id: Option<serde_json::Value>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    progress: Option<ProgressMetadata>,
    #[serde(default, alias = "error_message", alias = "errorMessage")]
    error: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
    /// Progress fields sent at the top level instead of under `progress`.
    #[serde(flatten)]
    inline_progress: ProgressMetadata,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EventNormalizer;

impl EventNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Convert a frame from `agent_id`'s stream into a canonical event.
    pub fn normalize(
        &self,
        agent_id: &str,
        frame: &SseEvent,
        tasks: &dyn TaskLookup,
    ) -> Result<CanonicalEvent, ProtocolError> {
        let kind = canonical_kind(&frame.event_type)
            .ok_or_else(|| ProtocolError::UnknownEvent(frame.event_type.clone()))?;

        let raw = frame.data.trim();
        let payload: WirePayload = if raw.is_empty() {
            WirePayload::default()
        } else {
            serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedPayload {
                event: frame.event_type.clone(),
                message: e.to_string(),
            })?
        };

        if let Some(payload_agent) = payload.agent_id.as_ref().and_then(agent_id_string) {
            if payload_agent != agent_id {
                return Err(ProtocolError::AgentMismatch {
                    stream_agent: agent_id.to_string(),
                    payload_agent,
                });
            }
        }

        let task_id = tasks.task_for(agent_id).unwrap_or_else(|| {
            warn!(agent_id, "no task mapped for training event, using sentinel");
            UNKNOWN_TASK_ID.to_string()
        });

        let progress = match payload.progress {
            Some(progress) => Some(progress),
            None if payload.inline_progress != ProgressMetadata::default() => {
                Some(payload.inline_progress)
            }
            None => None,
        };

        let status = payload
            .status
            .filter(|status| !status.trim().is_empty())
            .unwrap_or_else(|| default_status(kind).to_string());

        let error_message = match kind {
            EventKind::Failed => Some(
                payload
                    .error
                    .or_else(|| progress.as_ref().and_then(|p| p.message.clone()))
                    .unwrap_or_else(|| "Training failed".to_string()),
            ),
            _ => payload.error,
        };

        Ok(CanonicalEvent {
            kind,
            agent_id: agent_id.to_string(),
            task_id,
            status,
            progress,
            error_message,
            timestamp: parse_timestamp(payload.timestamp.as_ref()).unwrap_or_else(Utc::now),
        })
    }

    /// Like [`normalize`](Self::normalize) but logs and drops bad frames.
    pub fn normalize_or_drop(
        &self,
        agent_id: &str,
        frame: &SseEvent,
        tasks: &dyn TaskLookup,
    ) -> Option<CanonicalEvent> {
        match self.normalize(agent_id, frame, tasks) {
            Ok(event) => Some(event),
            Err(e @ ProtocolError::UnknownEvent(_)) => {
                debug!(agent_id, "dropping training frame: {e}");
                None
            }
            Err(e) => {
                warn!(agent_id, "dropping training frame: {e}");
                None
            }
        }
    }
}

fn default_status(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Connected | EventKind::Progress => "training",
        EventKind::Completed => "completed",
        EventKind::Failed => "failed",
    }
}

fn agent_id_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Epoch milliseconds or RFC 3339.
fn parse_timestamp(value: Option<&serde_json::Value>) -> Option<DateTime<Utc>> {
    match value? {
        serde_json::Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    }
}
