//! Per-agent stream connections with exponential-backoff reconnection.
//!
//! This module provides:
//! - One transport slot per agent; opening again replaces the old transport
//! - Reconnection with delays `base * 2^(i-1)` up to a fixed attempt ceiling
//! - Connection status broadcast to any number of observers
//!
//! Frames from every agent are funnelled into a single channel so that the
//! dispatcher sees each agent's frames in arrival order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::sse::SseEvent;
use super::transport::{TrainingTransport, TransportError};

/// Base delay for exponential backoff.
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Reconnect attempts before the connection is given up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

const STATUS_CHANNEL_CAPACITY: usize = 128;

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_RECONNECT_BASE,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once the
    /// ceiling has been passed.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2_u32.checked_pow(attempt - 1)?;
        self.base_delay.checked_mul(factor)
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// `close`/`close_all` was called, or the slot was replaced.
    Requested,
    /// Every reconnect attempt failed.
    RetriesExhausted,
    /// The server refused the stream in a way retrying cannot fix.
    Rejected,
}

impl CloseReason {
    /// Whether the caller must treat the job as permanently failed.
    pub const fn is_permanent_failure(&self) -> bool {
        matches!(self, Self::RetriesExhausted | Self::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closed(CloseReason),
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Open => write!(f, "open"),
            ConnectionStatus::Closed(CloseReason::Requested) => write!(f, "closed"),
            ConnectionStatus::Closed(CloseReason::RetriesExhausted) => {
                write!(f, "closed (retries exhausted)")
            }
            ConnectionStatus::Closed(CloseReason::Rejected) => write!(f, "closed (rejected)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionUpdate {
    pub agent_id: String,
    pub status: ConnectionStatus,
    /// Reconnect attempt this update belongs to; 0 for the initial connect.
    pub attempt: u32,
}

/// A raw frame tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub agent_id: String,
    pub generation: u64,
    pub frame: SseEvent,
}

// ============================================================================
// Connection Manager
// ============================================================================

struct ConnectionSlot {
    generation: u64,
    attempts: Arc<AtomicU32>,
    handle: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<String, ConnectionSlot>>>;

/// Owns every live training stream, keyed by agent.
pub struct ConnectionManager {
    transport: Arc<dyn TrainingTransport>,
    policy: ReconnectPolicy,
    slots: Slots,
    frames_tx: mpsc::UnboundedSender<InboundFrame>,
    status_tx: broadcast::Sender<ConnectionUpdate>,
    next_generation: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager and the receiving end of its frame channel.
    pub fn new(
        transport: Arc<dyn TrainingTransport>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<InboundFrame>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        let manager = Self {
            transport,
            policy,
            slots: Arc::new(Mutex::new(HashMap::new())),
            frames_tx,
            status_tx,
            next_generation: AtomicU64::new(1),
        };
        (manager, frames_rx)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Open the agent's stream, closing any transport it already has.
    ///
    /// Must be called from within a tokio runtime; the connection runs on its
    /// own task and this call returns immediately.
    pub fn open(&self, agent_id: &str, token: &str) {
        self.close(agent_id);

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let attempts = Arc::new(AtomicU32::new(0));
        let task = ConnectionTask {
            agent_id: agent_id.to_string(),
            token: token.to_string(),
            generation,
            transport: self.transport.clone(),
            policy: self.policy,
            attempts: attempts.clone(),
            frames_tx: self.frames_tx.clone(),
            status_tx: self.status_tx.clone(),
            slots: self.slots.clone(),
            last_event_id: None,
        };

        // The slot is inserted before the task can run, so a task finishing
        // immediately still finds (and removes) its own slot.
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = tokio::spawn(task.run());
        slots.insert(
            agent_id.to_string(),
            ConnectionSlot {
                generation,
                attempts,
                handle,
            },
        );
        debug!(agent_id, generation, "opened training stream slot");
    }

    /// Terminate the agent's transport. Returns whether one was live.
    pub fn close(&self, agent_id: &str) -> bool {
        let slot = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id);

        let Some(slot) = slot else {
            return false;
        };

        slot.handle.abort();
        slot.attempts.store(0, Ordering::SeqCst);
        info!(agent_id, "closed training stream");
        self.emit(agent_id, ConnectionStatus::Closed(CloseReason::Requested), 0);
        true
    }

    /// Tear down every transport.
    pub fn close_all(&self) {
        let agents: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        for agent_id in agents {
            self.close(&agent_id);
        }
    }

    /// Whether the agent currently owns a transport slot.
    pub fn is_open(&self, agent_id: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    /// Whether `generation` is the agent's live connection. Frames from a
    /// replaced or closed connection fail this check.
    pub fn is_current(&self, agent_id: &str, generation: u64) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .is_some_and(|slot| slot.generation == generation)
    }

    pub fn active_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        agents.sort();
        agents
    }

    /// Consecutive failed reconnect attempts for the agent's live connection.
    pub fn attempts(&self, agent_id: &str) -> Option<u32> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .map(|slot| slot.attempts.load(Ordering::SeqCst))
    }

    /// Observe connection status transitions for every agent.
    pub fn status_updates(&self) -> broadcast::Receiver<ConnectionUpdate> {
        self.status_tx.subscribe()
    }

    fn emit(&self, agent_id: &str, status: ConnectionStatus, attempt: u32) {
        emit_status(&self.status_tx, agent_id, status, attempt);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        for (_, slot) in slots.drain() {
            slot.handle.abort();
        }
    }
}

fn emit_status(
    status_tx: &broadcast::Sender<ConnectionUpdate>,
    agent_id: &str,
    status: ConnectionStatus,
    attempt: u32,
) {
    debug!(agent_id, %status, attempt, "training stream status");
    // No observers is fine.
    let _ = status_tx.send(ConnectionUpdate {
        agent_id: agent_id.to_string(),
        status,
        attempt,
    });
}

// ============================================================================
// Connection Task
// ============================================================================

struct ConnectionTask {
    agent_id: String,
    token: String,
    generation: u64,
    transport: Arc<dyn TrainingTransport>,
    policy: ReconnectPolicy,
    attempts: Arc<AtomicU32>,
    frames_tx: mpsc::UnboundedSender<InboundFrame>,
    status_tx: broadcast::Sender<ConnectionUpdate>,
    slots: Slots,
    /// Last frame id seen on this subscription, sent back on reconnect.
    last_event_id: Option<String>,
}

enum SessionEnd {
    Failed(TransportError),
    DispatcherGone,
}

impl ConnectionTask {
    async fn run(mut self) {
        loop {
            let attempt = self.attempts.load(Ordering::SeqCst);
            emit_status(
                &self.status_tx,
                &self.agent_id,
                ConnectionStatus::Connecting,
                attempt,
            );

            let connected = self
                .transport
                .connect(&self.agent_id, &self.token, self.last_event_id.as_deref())
                .await;
            let failure = match connected {
                Ok(stream) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    emit_status(&self.status_tx, &self.agent_id, ConnectionStatus::Open, 0);
                    match self.pump(stream).await {
                        SessionEnd::Failed(e) => e,
                        SessionEnd::DispatcherGone => {
                            debug!(agent_id = %self.agent_id, "frame dispatcher gone, stopping stream");
                            self.release(CloseReason::Requested);
                            return;
                        }
                    }
                }
                Err(e) => e,
            };

            if !failure.is_retryable() {
                error!(
                    "training stream for agent {} rejected: {}",
                    self.agent_id, failure
                );
                self.release(CloseReason::Rejected);
                return;
            }

            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.policy.delay_for(attempt) {
                Some(delay) => {
                    warn!(
                        "training stream for agent {} lost ({}), reconnecting in {:?} (attempt {}/{})",
                        self.agent_id, failure, delay, attempt, self.policy.max_attempts
                    );
                    sleep(delay).await;
                }
                None => {
                    error!(
                        "training stream for agent {} failed after {} reconnect attempts: {}",
                        self.agent_id, self.policy.max_attempts, failure
                    );
                    self.release(CloseReason::RetriesExhausted);
                    return;
                }
            }
        }
    }

    async fn pump(&mut self, mut stream: super::transport::FrameStream) -> SessionEnd {
        loop {
            match stream.next().await {
                Some(Ok(frame)) => {
                    if let Some(id) = &frame.id {
                        self.last_event_id = Some(id.clone());
                    }
                    let inbound = InboundFrame {
                        agent_id: self.agent_id.clone(),
                        generation: self.generation,
                        frame,
                    };
                    if self.frames_tx.send(inbound).is_err() {
                        return SessionEnd::DispatcherGone;
                    }
                }
                Some(Err(e)) => return SessionEnd::Failed(e),
                None => return SessionEnd::Failed(TransportError::StreamEnded),
            }
        }
    }

    /// Drop this task's slot (unless it was already replaced) and announce
    /// the terminal status.
    fn release(&self, reason: CloseReason) {
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let owns_slot = slots
                .get(&self.agent_id)
                .is_some_and(|slot| slot.generation == self.generation);
            if !owns_slot {
                return;
            }
            slots.remove(&self.agent_id);
        }
        emit_status(
            &self.status_tx,
            &self.agent_id,
            ConnectionStatus::Closed(reason),
            self.attempts.load(Ordering::SeqCst),
        );
    }
}
