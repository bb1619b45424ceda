//! Shared fixtures for the pipeline tests.
//!
//! `ChannelTransport` hands each connect a fresh channel the test writes
//! frames into; `StubApi` and `RecordingListener` stand in for the backend
//! and the UI.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bus::{CanonicalEvent, EventKind};
use crate::runtime::api::{ApiError, TrainingApi};
use crate::runtime::orchestrator::TrainingListener;
use crate::stream::{FrameStream, SseEvent, TrainingTransport, TransportError};

type FrameSender = mpsc::UnboundedSender<Result<SseEvent, TransportError>>;

// ============================================================================
// Transport
// ============================================================================

pub(crate) struct ChannelTransport {
    streams: Mutex<HashMap<String, FrameSender>>,
    connects: Mutex<HashMap<String, usize>>,
    refuse_with: Mutex<Option<TransportError>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            connects: Mutex::new(HashMap::new()),
            refuse_with: Mutex::new(None),
        }
    }

    /// Make every following connect fail with `error`.
    pub fn refuse_connects(&self, error: TransportError) {
        *self.refuse_with.lock().unwrap() = Some(error);
    }

    /// Push a frame onto the agent's live stream. Returns false when the
    /// agent has no live stream.
    pub fn send(&self, agent_id: &str, event_type: &str, data: &str) -> bool {
        self.streams
            .lock()
            .unwrap()
            .get(agent_id)
            .is_some_and(|tx| tx.send(Ok(SseEvent::new(event_type, data))).is_ok())
    }

    /// Break the agent's live stream with a transport error.
    pub fn fail(&self, agent_id: &str, error: TransportError) -> bool {
        self.streams
            .lock()
            .unwrap()
            .remove(agent_id)
            .is_some_and(|tx| tx.send(Err(error)).is_ok())
    }

    pub fn connect_count(&self, agent_id: &str) -> usize {
        self.connects
            .lock()
            .unwrap()
            .get(agent_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn is_streaming(&self, agent_id: &str) -> bool {
        self.streams
            .lock()
            .unwrap()
            .get(agent_id)
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Yield until the agent's connection task has an open stream.
    pub async fn wait_connected(&self, agent_id: &str) {
        for _ in 0..1_000 {
            if self.is_streaming(agent_id) {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("agent {agent_id} never connected");
    }
}

#[async_trait]
impl TrainingTransport for ChannelTransport {
    async fn connect(
        &self,
        agent_id: &str,
        _token: &str,
        _last_event_id: Option<&str>,
    ) -> Result<FrameStream, TransportError> {
        *self
            .connects
            .lock()
            .unwrap()
            .entry(agent_id.to_string())
            .or_default() += 1;

        if let Some(error) = self.refuse_with.lock().unwrap().clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().insert(agent_id.to_string(), tx);
        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

// ============================================================================
// Backend API
// ============================================================================

#[derive(Default)]
pub(crate) struct StubApi {
    pub start_error: Mutex<Option<ApiError>>,
    pub cancel_error: Mutex<Option<ApiError>>,
    pub starts: Mutex<Vec<(String, Vec<String>)>>,
    pub cancels: Mutex<Vec<(String, String)>>,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_start(error: ApiError) -> Self {
        let api = Self::default();
        *api.start_error.lock().unwrap() = Some(error);
        api
    }

    pub fn cancels(&self) -> Vec<(String, String)> {
        self.cancels.lock().unwrap().clone()
    }
}

#[async_trait]
impl TrainingApi for StubApi {
    async fn start_training(
        &self,
        agent_id: &str,
        source_ids: &[String],
    ) -> Result<String, ApiError> {
        if let Some(error) = self.start_error.lock().unwrap().clone() {
            return Err(error);
        }
        let mut starts = self.starts.lock().unwrap();
        starts.push((agent_id.to_string(), source_ids.to_vec()));
        Ok(format!("task-{agent_id}-{}", starts.len()))
    }

    async fn cancel_training(&self, agent_id: &str, task_id: &str) -> Result<(), ApiError> {
        self.cancels
            .lock()
            .unwrap()
            .push((agent_id.to_string(), task_id.to_string()));
        match self.cancel_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Listener
// ============================================================================

#[derive(Default)]
pub(crate) struct RecordingListener {
    events: Mutex<Vec<CanonicalEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CanonicalEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(|event| event.kind).collect()
    }

    fn record(&self, event: &CanonicalEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl TrainingListener for RecordingListener {
    fn on_connected(&self, event: &CanonicalEvent) {
        self.record(event);
    }

    fn on_progress(&self, event: &CanonicalEvent) {
        self.record(event);
    }

    fn on_completed(&self, event: &CanonicalEvent) {
        self.record(event);
    }

    fn on_failed(&self, event: &CanonicalEvent) {
        self.record(event);
    }
}
