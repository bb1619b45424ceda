//! Per-agent training state machine.
//!
//! The orchestrator is the component the CLI (or any embedding app) talks to:
//! - Issues start and cancel requests against the backend
//! - Persists the in-flight task and subscribes to the agent's stream
//! - Applies terminal events: persisted status, unsubscribe, delayed cleanup
//! - Re-attaches to jobs that were still training when the process stopped
//!
//! States move `Idle → Starting → Training → Completed | Failed`; cancelling
//! returns any state to `Idle`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bus::{CanonicalEvent, EventKind};
use crate::db::{TaskStatus, TaskStore, TrainingTask};
use crate::TrainingError;

use super::api::TrainingApi;
use super::registry::{EventCallback, SubscriptionRegistry};

/// How long a finished job's record is kept before removal.
pub const DEFAULT_REMOVAL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TrainingState {
    Idle,
    Starting,
    Training { task_id: String },
    Completed { task_id: String },
    Failed { message: String },
}

impl TrainingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Receives the events of one training run.
pub trait TrainingListener: Send + Sync {
    fn on_connected(&self, _event: &CanonicalEvent) {}

    fn on_progress(&self, _event: &CanonicalEvent) {}

    /// Called once the completed status is persisted. Consumers refresh
    /// whatever depends on the trained knowledge here.
    fn on_completed(&self, _event: &CanonicalEvent) {}

    fn on_failed(&self, _event: &CanonicalEvent) {}
}

/// Listener that ignores everything.
pub struct NoopListener;

impl TrainingListener for NoopListener {}

struct PendingRemoval {
    id: u64,
    handle: JoinHandle<()>,
}

struct OrchestratorInner {
    api: Arc<dyn TrainingApi>,
    registry: Arc<SubscriptionRegistry>,
    tasks: TaskStore,
    removal_grace: Duration,
    states: Mutex<HashMap<String, TrainingState>>,
    listeners: Mutex<HashMap<String, Arc<dyn TrainingListener>>>,
    removals: Mutex<HashMap<String, PendingRemoval>>,
    next_removal_id: AtomicU64,
}

#[derive(Clone)]
pub struct TrainingOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl TrainingOrchestrator {
    pub fn new(
        api: Arc<dyn TrainingApi>,
        registry: Arc<SubscriptionRegistry>,
        tasks: TaskStore,
        removal_grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                api,
                registry,
                tasks,
                removal_grace,
                states: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                removals: Mutex::new(HashMap::new()),
                next_removal_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self, agent_id: &str) -> TrainingState {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .unwrap_or(TrainingState::Idle)
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.inner.tasks
    }

    /// Start a training job and follow it. Resolves once the backend has
    /// accepted the job and the stream subscription is in place.
    ///
    /// Fails with `TrainingError::AlreadyTraining` while the agent has a
    /// start in flight or a job being followed.
    pub async fn start_training(
        &self,
        agent_id: &str,
        source_ids: &[String],
        agent_name: &str,
        listener: Arc<dyn TrainingListener>,
    ) -> Result<String, TrainingError> {
        self.begin_start(agent_id)?;
        info!(agent_id, sources = source_ids.len(), "starting training");

        let task_id = match self.inner.api.start_training(agent_id, source_ids).await {
            Ok(task_id) => task_id,
            Err(e) => {
                error!(agent_id, "training start request failed: {e}");
                self.set_state(
                    agent_id,
                    TrainingState::Failed {
                        message: e.to_string(),
                    },
                );
                return Err(TrainingError::StartRequest(e));
            }
        };

        if self.state(agent_id) != TrainingState::Starting {
            // Cancelled while the start request was in flight.
            warn!(agent_id, %task_id, "training start superseded, cancelling new job");
            if let Err(e) = self.inner.api.cancel_training(agent_id, &task_id).await {
                warn!(agent_id, %task_id, "failed to cancel superseded job: {e}");
            }
            return Err(TrainingError::Cancelled);
        }

        // The previous run's record is about to be replaced.
        self.abort_removal(agent_id);
        if let Err(e) = self.inner.tasks.record_start(agent_id, &task_id, agent_name) {
            self.set_state(
                agent_id,
                TrainingState::Failed {
                    message: e.to_string(),
                },
            );
            self.schedule_removal(agent_id);
            return Err(e.into());
        }

        self.attach(agent_id, &task_id, listener);
        Ok(task_id)
    }

    /// Stop following the agent's job and ask the backend to cancel it.
    ///
    /// Local state is cleared before the cancel request is sent, so a failed
    /// request still leaves the agent idle. Calling this again is a no-op.
    pub async fn cancel_training(&self, agent_id: &str) -> Result<(), TrainingError> {
        let previous = self.set_state(agent_id, TrainingState::Idle);
        self.abort_removal(agent_id);
        self.take_listener(agent_id);

        let record = match self.inner.tasks.get(agent_id) {
            Ok(record) => record,
            Err(e) => {
                warn!(agent_id, "failed to read training record: {e}");
                None
            }
        };

        let active_task = match &previous {
            Some(TrainingState::Training { task_id }) => Some(task_id.clone()),
            _ => record
                .as_ref()
                .filter(|task| task.status == TaskStatus::Training)
                .map(|task| task.task_id.clone()),
        };

        if let Some(task_id) = self
            .inner
            .registry
            .task_id(agent_id)
            .or_else(|| active_task.clone())
        {
            self.inner.registry.unsubscribe(agent_id, &task_id);
        }
        if let Err(e) = self.inner.tasks.remove(agent_id) {
            warn!(agent_id, "failed to remove training record: {e}");
        }

        let Some(task_id) = active_task else {
            debug!(agent_id, "nothing to cancel");
            return Ok(());
        };

        info!(agent_id, %task_id, "cancelling training");
        self.inner
            .api
            .cancel_training(agent_id, &task_id)
            .await
            .map_err(TrainingError::CancelRequest)
    }

    /// Follow every persisted job that was still training, and finish the
    /// cleanup of records that had already reached a terminal status.
    pub fn resume_in_flight(
        &self,
        listener: Arc<dyn TrainingListener>,
    ) -> Result<Vec<TrainingTask>, TrainingError> {
        let mut resumed = Vec::new();
        for task in self.inner.tasks.get_all()? {
            if task.status.is_terminal() {
                debug!(agent_id = %task.agent_id, "scheduling cleanup of finished record");
                self.schedule_removal(&task.agent_id);
                continue;
            }
            if self.inner.registry.is_subscribed(&task.agent_id) {
                continue;
            }
            info!(agent_id = %task.agent_id, task_id = %task.task_id, "resuming in-flight training");
            self.attach(&task.agent_id, &task.task_id, listener.clone());
            resumed.push(task);
        }
        Ok(resumed)
    }

    fn attach(&self, agent_id: &str, task_id: &str, listener: Arc<dyn TrainingListener>) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), listener);
        self.set_state(
            agent_id,
            TrainingState::Training {
                task_id: task_id.to_string(),
            },
        );

        let weak: Weak<OrchestratorInner> = Arc::downgrade(&self.inner);
        let callback: EventCallback = Arc::new(move |event: &CanonicalEvent| {
            if let Some(inner) = weak.upgrade() {
                TrainingOrchestrator { inner }.handle_event(event);
            }
        });
        self.inner.registry.subscribe(agent_id, task_id, callback);
    }

    fn handle_event(&self, event: &CanonicalEvent) {
        let agent_id = event.agent_id.as_str();
        let task_id = match self.state(agent_id) {
            TrainingState::Training { task_id } => task_id,
            other => {
                debug!(agent_id, state = ?other, kind = %event.kind, "ignoring event outside training");
                return;
            }
        };

        match event.kind {
            EventKind::Connected => {
                debug!(agent_id, "training stream connected");
                if let Some(listener) = self.listener(agent_id) {
                    listener.on_connected(event);
                }
            }
            EventKind::Progress => {
                if let Some(listener) = self.listener(agent_id) {
                    listener.on_progress(event);
                }
            }
            EventKind::Completed => {
                info!(agent_id, %task_id, "training completed");
                self.finish(agent_id, &task_id, TaskStatus::Completed);
                self.set_state(agent_id, TrainingState::Completed { task_id });
                if let Some(listener) = self.take_listener(agent_id) {
                    listener.on_completed(event);
                }
            }
            EventKind::Failed => {
                let message = event
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Training failed".to_string());
                warn!(agent_id, %task_id, "training failed: {message}");
                self.finish(agent_id, &task_id, TaskStatus::Failed);
                self.set_state(agent_id, TrainingState::Failed { message });
                if let Some(listener) = self.take_listener(agent_id) {
                    listener.on_failed(event);
                }
            }
        }
    }

    fn finish(&self, agent_id: &str, task_id: &str, status: TaskStatus) {
        if let Err(e) = self.inner.tasks.update_status(agent_id, status) {
            warn!(agent_id, "failed to persist {status} status: {e}");
        }
        self.inner.registry.unsubscribe(agent_id, task_id);
        self.schedule_removal(agent_id);
    }

    /// Remove the agent's record after the grace delay, unless it has gone
    /// back to training by then.
    fn schedule_removal(&self, agent_id: &str) {
        let id = self.inner.next_removal_id.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.clone();
        let agent = agent_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(inner.removal_grace).await;
            match inner.tasks.get(&agent) {
                Ok(Some(task)) if task.status.is_terminal() => {
                    if let Err(e) = inner.tasks.remove(&agent) {
                        warn!(agent_id = %agent, "failed to remove training record: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(agent_id = %agent, "failed to read training record: {e}"),
            }
            let mut removals = inner.removals.lock().unwrap_or_else(PoisonError::into_inner);
            if removals.get(&agent).is_some_and(|pending| pending.id == id) {
                removals.remove(&agent);
            }
        });

        let previous = self
            .inner
            .removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), PendingRemoval { id, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn abort_removal(&self, agent_id: &str) {
        let pending = self
            .inner
            .removals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);
        if let Some(pending) = pending {
            debug!(agent_id, "aborting scheduled record removal");
            pending.handle.abort();
        }
    }

    /// Move the agent to `Starting` unless a run is already in progress.
    fn begin_start(&self, agent_id: &str) -> Result<(), TrainingError> {
        let mut states = self.inner.states.lock().unwrap_or_else(PoisonError::into_inner);
        match states.get(agent_id) {
            Some(TrainingState::Starting | TrainingState::Training { .. }) => {
                warn!(agent_id, "training already in progress");
                Err(TrainingError::AlreadyTraining(agent_id.to_string()))
            }
            _ => {
                states.insert(agent_id.to_string(), TrainingState::Starting);
                Ok(())
            }
        }
    }

    fn set_state(&self, agent_id: &str, state: TrainingState) -> Option<TrainingState> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(agent_id.to_string(), state)
    }

    fn listener(&self, agent_id: &str) -> Option<Arc<dyn TrainingListener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
    }

    fn take_listener(&self, agent_id: &str) -> Option<Arc<dyn TrainingListener>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
    }
}
