use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::event_types::CanonicalEvent;

pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 100;

const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: String,
    /// Strictly increasing across the store's lifetime, never reused.
    pub seq: u64,
    pub event: CanonicalEvent,
    pub received_at: DateTime<Utc>,
    pub agent_id: String,
}

struct LogInner {
    entries: VecDeque<EventLogEntry>,
    next_seq: u64,
}

/// Bounded FIFO of recent canonical events.
pub struct EventLogStore {
    capacity: usize,
    inner: Mutex<LogInner>,
    tx: broadcast::Sender<EventLogEntry>,
}

impl EventLogStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            capacity,
            inner: Mutex::new(LogInner {
                entries: VecDeque::with_capacity(capacity),
                next_seq: 1,
            }),
            tx,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an event, evicting the oldest entries beyond capacity, and push
    /// the new entry to live subscribers.
    pub fn append(&self, event: CanonicalEvent) -> EventLogEntry {
        let entry = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = EventLogEntry {
                id: Uuid::new_v4().to_string(),
                seq: inner.next_seq,
                agent_id: event.agent_id.clone(),
                event,
                received_at: Utc::now(),
            };
            inner.next_seq += 1;
            inner.entries.push_back(entry.clone());
            while inner.entries.len() > self.capacity {
                inner.entries.pop_front();
            }
            entry
        };

        // No receivers is the normal case for headless use.
        let _ = self.tx.send(entry.clone());
        entry
    }

    /// Most recent first, optionally restricted to one agent.
    pub fn query(&self, agent_id: Option<&str>, limit: usize) -> Vec<EventLogEntry> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .rev()
            .filter(|entry| agent_id.map_or(true, |id| entry.agent_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Entries with `seq > after`, oldest first. Sampling consumers keep the
    /// last seen `seq` as their cursor.
    pub fn entries_since(&self, after: u64) -> Vec<EventLogEntry> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .iter()
            .filter(|entry| entry.seq > after)
            .cloned()
            .collect()
    }

    pub fn latest_for(&self, agent_id: &str) -> Option<EventLogEntry> {
        self.query(Some(agent_id), 1).into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry. Sequence numbers keep counting.
    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clear();
    }

    /// Live feed of appended entries.
    pub fn subscribe(&self) -> broadcast::Receiver<EventLogEntry> {
        self.tx.subscribe()
    }
}

impl Default for EventLogStore {
    fn default() -> Self {
        Self::new()
    }
}
