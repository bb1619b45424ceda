//! Per-agent subscriptions and the agent → task mapping.
//!
//! The registry owns the lifecycle of each agent's transport: subscribing
//! opens it, unsubscribing closes it, and the last unsubscribe tears down
//! every transport the connection manager still holds.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::bus::CanonicalEvent;
use crate::stream::{ConnectionManager, TaskLookup};

pub type EventCallback = Arc<dyn Fn(&CanonicalEvent) + Send + Sync>;

struct Subscription {
    task_id: String,
    callback: EventCallback,
}

pub struct SubscriptionRegistry {
    connections: Arc<ConnectionManager>,
    token: String,
    subs: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new(connections: Arc<ConnectionManager>, token: impl Into<String>) -> Self {
        Self {
            connections,
            token: token.into(),
            subs: Mutex::new(HashMap::new()),
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Register `callback` for the agent's events and open its transport.
    /// A later subscribe for the same agent replaces this one.
    pub fn subscribe(&self, agent_id: &str, task_id: &str, callback: EventCallback) {
        let replaced = self
            .subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                agent_id.to_string(),
                Subscription {
                    task_id: task_id.to_string(),
                    callback,
                },
            );
        if let Some(previous) = replaced {
            debug!(
                agent_id,
                previous_task = %previous.task_id,
                task_id,
                "replacing training subscription"
            );
        }

        info!(agent_id, task_id, "subscribed to training stream");
        self.connections.open(agent_id, &self.token);
    }

    /// Drop the agent's subscription if it still belongs to `task_id`.
    /// Returns whether an entry was removed; calling again is a no-op.
    pub fn unsubscribe(&self, agent_id: &str, task_id: &str) -> bool {
        let (removed, now_empty) = {
            let mut subs = self.subs.lock().unwrap_or_else(PoisonError::into_inner);
            match subs.get(agent_id) {
                Some(sub) if sub.task_id != task_id => {
                    debug!(
                        agent_id,
                        task_id,
                        current_task = %sub.task_id,
                        "unsubscribe for superseded task ignored"
                    );
                    return false;
                }
                Some(_) => {
                    subs.remove(agent_id);
                    (true, subs.is_empty())
                }
                None => (false, subs.is_empty()),
            }
        };

        self.connections.close(agent_id);
        if now_empty {
            self.connections.close_all();
        }
        if removed {
            info!(agent_id, task_id, "unsubscribed from training stream");
        }
        removed
    }

    /// Deliver `event` to its agent's callback. Returns whether one was found.
    ///
    /// The callback runs without the registry lock held, so it may call
    /// back into `unsubscribe`.
    pub fn dispatch(&self, event: &CanonicalEvent) -> bool {
        let callback = self
            .subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.agent_id)
            .map(|sub| sub.callback.clone());

        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => {
                debug!(agent_id = %event.agent_id, kind = %event.kind, "no subscriber for training event");
                false
            }
        }
    }

    pub fn task_id(&self, agent_id: &str) -> Option<String> {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .map(|sub| sub.task_id.clone())
    }

    pub fn is_subscribed(&self, agent_id: &str) -> bool {
        self.subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(agent_id)
    }

    pub fn subscribed_agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .subs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        agents.sort();
        agents
    }
}

impl TaskLookup for SubscriptionRegistry {
    fn task_for(&self, agent_id: &str) -> Option<String> {
        self.task_id(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use tokio::sync::mpsc;

    use super::*;
    use crate::bus::EventKind;
    use crate::stream::{InboundFrame, ReconnectPolicy};
    use crate::testing::ChannelTransport;

    fn registry() -> (
        Arc<ChannelTransport>,
        SubscriptionRegistry,
        mpsc::UnboundedReceiver<InboundFrame>,
    ) {
        let transport = Arc::new(ChannelTransport::new());
        let (manager, frames) =
            ConnectionManager::new(transport.clone(), ReconnectPolicy::default());
        (
            transport,
            SubscriptionRegistry::new(Arc::new(manager), "token"),
            frames,
        )
    }

    fn event(agent_id: &str, kind: EventKind) -> CanonicalEvent {
        CanonicalEvent {
            kind,
            agent_id: agent_id.to_string(),
            task_id: "t".to_string(),
            status: "completed".to_string(),
            progress: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    fn counting() -> (Arc<AtomicUsize>, EventCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        (
            count,
            Arc::new(move |_: &CanonicalEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test]
    async fn test_subscribe_opens_transport_and_maps_task() {
        let (transport, registry, _frames) = registry();
        let (_, callback) = counting();

        registry.subscribe("a", "task-1", callback);

        assert!(registry.connections().is_open("a"));
        assert_eq!(registry.task_for("a"), Some("task-1".to_string()));
        transport.wait_connected("a").await;
        assert_eq!(transport.connect_count("a"), 1);
    }

    #[tokio::test]
    async fn test_dispatch_only_reaches_matching_agent() {
        let (_transport, registry, _frames) = registry();
        let (a_count, a_callback) = counting();
        let (b_count, b_callback) = counting();
        registry.subscribe("a", "task-a", a_callback);
        registry.subscribe("b", "task-b", b_callback);

        assert!(registry.dispatch(&event("a", EventKind::Completed)));
        assert!(!registry.dispatch(&event("c", EventKind::Completed)));

        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_last_subscribe_wins() {
        let (_transport, registry, _frames) = registry();
        let (first, first_callback) = counting();
        let (second, second_callback) = counting();
        registry.subscribe("a", "task-1", first_callback);
        registry.subscribe("a", "task-2", second_callback);

        registry.dispatch(&event("a", EventKind::Progress));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(registry.task_id("a"), Some("task-2".to_string()));
        assert_eq!(registry.connections().active_agents(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_task_scoped() {
        let (_transport, registry, _frames) = registry();
        let (_, callback) = counting();
        registry.subscribe("a", "task-2", callback);

        assert!(!registry.unsubscribe("a", "task-1"));
        assert!(registry.is_subscribed("a"));
        assert!(registry.connections().is_open("a"));

        assert!(registry.unsubscribe("a", "task-2"));
        assert!(!registry.unsubscribe("a", "task-2"));
        assert!(!registry.is_subscribed("a"));
        assert!(!registry.connections().is_open("a"));
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_every_transport() {
        let (_transport, registry, _frames) = registry();
        let (_, a_callback) = counting();
        registry.subscribe("a", "task-a", a_callback);
        // A transport with no subscription behind it.
        registry.connections().open("orphan", "token");

        registry.unsubscribe("a", "task-a");

        assert!(registry.connections().active_agents().is_empty());
    }

    #[tokio::test]
    async fn test_callback_may_unsubscribe_reentrantly() {
        let (_transport, registry, _frames) = registry();
        let registry = Arc::new(registry);
        let handle = Arc::downgrade(&registry);
        registry.subscribe(
            "a",
            "task-1",
            Arc::new(move |event: &CanonicalEvent| {
                if let Some(registry) = handle.upgrade() {
                    registry.unsubscribe(&event.agent_id, "task-1");
                }
            }),
        );

        assert!(registry.dispatch(&event("a", EventKind::Completed)));
        assert!(!registry.is_subscribed("a"));
        assert!(!registry.dispatch(&event("a", EventKind::Completed)));
    }
}
