//! Durable record of in-flight training tasks, one per agent.
//!
//! Records are stored as JSON under `training_task:<agent_id>` in any
//! [`KeyValueStore`], so the same store logic runs against SQLite or memory.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{queries, Database, DbError};

const TASK_KEY_PREFIX: &str = "training_task:";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0}")]
    Db(#[from] DbError),
    #[error("invalid record for {key}: {message}")]
    Serialization { key: String, message: String },
    #[error("store lock poisoned")]
    Poisoned,
}

// ---------------------------------------------------------------------------
// Key/value seam
// ---------------------------------------------------------------------------

/// Minimal durable key/value medium.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn put(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Returns whether a value was present.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

pub struct SqliteKvStore {
    db: Arc<Database>,
}

impl SqliteKvStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl KeyValueStore for SqliteKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(queries::get_entry(&self.db, key)?)
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        Ok(queries::upsert_entry(&self.db, key, value, &now)?)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(queries::delete_entry(&self.db, key)?)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(queries::list_keys_with_prefix(&self.db, prefix)?)
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Task records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Training,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Training => "training",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status only moves forward: training to a terminal status.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Training, Self::Training)
                | (Self::Training, Self::Completed)
                | (Self::Training, Self::Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrainingTask {
    pub agent_id: String,
    pub task_id: String,
    pub agent_name: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

/// On-disk layout of a task record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedTask {
    task_id: String,
    agent_name: String,
    timestamp: i64,
    status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_updated_at: Option<i64>,
}

impl PersistedTask {
    fn from_task(task: &TrainingTask) -> Self {
        Self {
            task_id: task.task_id.clone(),
            agent_name: task.agent_name.clone(),
            timestamp: task.started_at.timestamp_millis(),
            status: task.status,
            last_updated_at: Some(task.last_updated_at.timestamp_millis()),
        }
    }

    fn into_task(self, agent_id: String) -> TrainingTask {
        let started_at = millis_to_datetime(self.timestamp);
        let last_updated_at = self
            .last_updated_at
            .map(millis_to_datetime)
            .unwrap_or(started_at);
        TrainingTask {
            agent_id,
            task_id: self.task_id,
            agent_name: self.agent_name,
            status: self.status,
            started_at,
            last_updated_at,
        }
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn task_key(agent_id: &str) -> String {
    format!("{TASK_KEY_PREFIX}{agent_id}")
}

#[derive(Clone)]
pub struct TaskStore {
    kv: Arc<dyn KeyValueStore>,
}

impl TaskStore {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryKvStore::new()))
    }

    /// Create (or replace) the agent's record with status `training`.
    pub fn record_start(
        &self,
        agent_id: &str,
        task_id: &str,
        agent_name: &str,
    ) -> Result<TrainingTask, StoreError> {
        let now = Utc::now();
        let task = TrainingTask {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            agent_name: agent_name.to_string(),
            status: TaskStatus::Training,
            started_at: now,
            last_updated_at: now,
        };
        self.write(&task)?;
        tracing::debug!(agent_id, task_id, "recorded training start");
        Ok(task)
    }

    /// Returns `None` when no record exists. Backward transitions leave the
    /// record untouched.
    pub fn update_status(
        &self,
        agent_id: &str,
        status: TaskStatus,
    ) -> Result<Option<TrainingTask>, StoreError> {
        let Some(mut task) = self.get(agent_id)? else {
            return Ok(None);
        };

        if !task.status.can_transition_to(status) {
            tracing::warn!(
                agent_id,
                from = %task.status,
                to = %status,
                "ignoring backward training status transition"
            );
            return Ok(Some(task));
        }

        task.status = status;
        task.last_updated_at = Utc::now();
        self.write(&task)?;
        Ok(Some(task))
    }

    pub fn remove(&self, agent_id: &str) -> Result<bool, StoreError> {
        let removed = self.kv.delete(&task_key(agent_id))?;
        if removed {
            tracing::debug!(agent_id, "removed training record");
        }
        Ok(removed)
    }

    pub fn get(&self, agent_id: &str) -> Result<Option<TrainingTask>, StoreError> {
        let key = task_key(agent_id);
        let Some(raw) = self.kv.get(&key)? else {
            return Ok(None);
        };
        let persisted: PersistedTask =
            serde_json::from_str(&raw).map_err(|e| StoreError::Serialization {
                key: key.clone(),
                message: e.to_string(),
            })?;
        Ok(Some(persisted.into_task(agent_id.to_string())))
    }

    /// Every readable record, oldest start first. Unreadable records are skipped.
    pub fn get_all(&self) -> Result<Vec<TrainingTask>, StoreError> {
        let mut tasks = Vec::new();
        for key in self.kv.keys_with_prefix(TASK_KEY_PREFIX)? {
            let Some(agent_id) = key.strip_prefix(TASK_KEY_PREFIX) else {
                continue;
            };
            match self.get(agent_id) {
                Ok(Some(task)) => tasks.push(task),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping training record: {e}"),
            }
        }
        tasks.sort_by_key(|task| task.started_at);
        Ok(tasks)
    }

    /// Whether the agent has a job still in `training`.
    pub fn is_in_flight(&self, agent_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .get(agent_id)?
            .is_some_and(|task| task.status == TaskStatus::Training))
    }

    fn write(&self, task: &TrainingTask) -> Result<(), StoreError> {
        let key = task_key(&task.agent_id);
        let raw = serde_json::to_string(&PersistedTask::from_task(task)).map_err(|e| {
            StoreError::Serialization {
                key: key.clone(),
                message: e.to_string(),
            }
        })?;
        self.kv.put(&key, &raw)
    }
}
