//! Training runtime: subscriptions, orchestration, and the dispatch loop.
//!
//! `TrainingMonitor` owns one instance of every pipeline component and a
//! single dispatch task. Frames from every agent's transport arrive on one
//! channel; for each frame the loop drops stale connections, normalizes,
//! appends to the event log, and hands the event to the registry.

pub mod api;
pub mod orchestrator;
pub mod registry;


use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{CanonicalEvent, EventKind, EventLogStore};
use crate::config::MonitorConfig;
use crate::db::{Database, SqliteKvStore, TaskStore};
use crate::stream::{
    ConnectionManager, ConnectionStatus, ConnectionUpdate, EventNormalizer, HttpSseTransport,
    InboundFrame, TaskLookup, TrainingTransport, TransportConfig,
};
use crate::TrainingError;

pub use api::{ApiError, HttpTrainingApi, TrainingApi};
pub use orchestrator::{NoopListener, TrainingListener, TrainingOrchestrator, TrainingState};
pub use registry::{EventCallback, SubscriptionRegistry};

/// Error text reported when an agent's stream cannot be kept alive.
pub const CONNECTION_LOST_MESSAGE: &str = "connection lost";

pub struct TrainingMonitor {
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    event_log: Arc<EventLogStore>,
    orchestrator: TrainingOrchestrator,
    dispatcher: JoinHandle<()>,
}

impl TrainingMonitor {
    /// Wire the HTTP transport, HTTP API and sqlite task store from config.
    pub fn from_config(config: &MonitorConfig) -> Result<Self, TrainingError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| {
            TrainingError::DataDir(format!(
                "failed to create data directory {}: {e}",
                config.data_dir.display()
            ))
        })?;
        let db = Arc::new(Database::open(config.db_path())?);
        let tasks = TaskStore::new(Arc::new(SqliteKvStore::new(db)));

        let transport = HttpSseTransport::new(&config.api_url, TransportConfig::default())?;
        let api = HttpTrainingApi::new(&config.api_url, &config.api_token)
            .map_err(TrainingError::Api)?;

        Ok(Self::new(Arc::new(transport), Arc::new(api), tasks, config))
    }

    /// Assemble the pipeline around the given seams. Must be called from
    /// within a tokio runtime.
    pub fn new(
        transport: Arc<dyn TrainingTransport>,
        api: Arc<dyn TrainingApi>,
        tasks: TaskStore,
        config: &MonitorConfig,
    ) -> Self {
        let (connections, frames) = ConnectionManager::new(transport, config.reconnect_policy());
        let connections = Arc::new(connections);
        let registry = Arc::new(SubscriptionRegistry::new(
            connections.clone(),
            config.api_token.clone(),
        ));
        let event_log = Arc::new(EventLogStore::with_capacity(config.event_log_capacity));
        let orchestrator =
            TrainingOrchestrator::new(api, registry.clone(), tasks, config.removal_grace());

        let dispatcher = tokio::spawn(dispatch_loop(
            frames,
            connections.status_updates(),
            connections.clone(),
            registry.clone(),
            event_log.clone(),
        ));
        info!(api_url = %config.api_url, "training monitor started");

        Self {
            connections,
            registry,
            event_log,
            orchestrator,
            dispatcher,
        }
    }

    pub fn orchestrator(&self) -> &TrainingOrchestrator {
        &self.orchestrator
    }

    pub fn event_log(&self) -> &Arc<EventLogStore> {
        &self.event_log
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn tasks(&self) -> &TaskStore {
        self.orchestrator.tasks()
    }

    /// Stop dispatching and close every transport.
    pub fn shutdown(&self) {
        self.dispatcher.abort();
        self.connections.close_all();
        info!("training monitor stopped");
    }
}

impl Drop for TrainingMonitor {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch_loop(
    mut frames: mpsc::UnboundedReceiver<InboundFrame>,
    mut status: broadcast::Receiver<ConnectionUpdate>,
    connections: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    event_log: Arc<EventLogStore>,
) {
    let normalizer = EventNormalizer::new();
    loop {
        tokio::select! {
            biased;

            inbound = frames.recv() => {
                let Some(inbound) = inbound else { break };
                if !connections.is_current(&inbound.agent_id, inbound.generation) {
                    debug!(
                        agent_id = %inbound.agent_id,
                        generation = inbound.generation,
                        "dropping frame from stale connection"
                    );
                    continue;
                }
                let Some(event) =
                    normalizer.normalize_or_drop(&inbound.agent_id, &inbound.frame, registry.as_ref())
                else {
                    continue;
                };
                deliver(&event_log, &registry, event);
            }
            update = status.recv() => match update {
                Ok(update) => handle_status(&event_log, &registry, update),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "connection status updates lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("training dispatch loop finished");
}

fn deliver(event_log: &EventLogStore, registry: &SubscriptionRegistry, event: CanonicalEvent) {
    event_log.append(event.clone());
    registry.dispatch(&event);
}

/// A transport that gave up on a subscribed agent fails its job.
fn handle_status(event_log: &EventLogStore, registry: &SubscriptionRegistry, update: ConnectionUpdate) {
    let ConnectionStatus::Closed(reason) = update.status else {
        return;
    };
    if !reason.is_permanent_failure() {
        return;
    }
    let Some(task_id) = registry.task_for(&update.agent_id) else {
        return;
    };

    warn!(agent_id = %update.agent_id, %task_id, status = %update.status, "training stream lost");
    let event = CanonicalEvent {
        kind: EventKind::Failed,
        agent_id: update.agent_id,
        task_id,
        status: "failed".to_string(),
        progress: None,
        error_message: Some(CONNECTION_LOST_MESSAGE.to_string()),
        timestamp: Utc::now(),
    };
    deliver(event_log, registry, event);
}
