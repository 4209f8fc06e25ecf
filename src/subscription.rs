// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Registry
//!
//! In-memory bookkeeping of which queues are subscribed, with what handlers,
//! and under which broker consumer tag. Purely synchronous: every operation
//! is a single critical section over the registry, and lifecycle events are
//! dispatched only after the mutation completed.
//!
//! The blocked set is orthogonal to the subscription map: a queue can be
//! blocked while its descriptor still exists, and blocking alone never tears
//! a consumer down.

use crate::{
    config::SubscriptionOptions,
    events::{BusEvent, EventBus},
    handler::Handlers,
};
use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

/// A subscription descriptor.
///
/// `consumer_tag` is present exactly while a broker consumer is registered
/// for the queue.
#[derive(Clone)]
pub struct Subscription {
    pub queue: String,
    pub handlers: Handlers,
    pub options: SubscriptionOptions,
    pub consumer_tag: Option<String>,
}

struct Registry {
    subscriptions: HashMap<String, Subscription>,
    blocked: HashSet<String>,
}

/// Queue-name keyed subscription registry.
pub struct SubscriptionManager {
    registry: Mutex<Registry>,
    events: EventBus,
}

impl SubscriptionManager {
    pub(crate) fn new(events: EventBus) -> Self {
        Self {
            registry: Mutex::new(Registry {
                subscriptions: HashMap::new(),
                blocked: HashSet::new(),
            }),
            events,
        }
    }

    /// Inserts a descriptor for `queue`. Returns false on collision.
    pub fn create(&self, queue: &str, handlers: Handlers, options: SubscriptionOptions) -> bool {
        let inserted = {
            let mut registry = self.registry.lock().unwrap();
            if registry.subscriptions.contains_key(queue) {
                false
            } else {
                registry.subscriptions.insert(
                    queue.to_owned(),
                    Subscription {
                        queue: queue.to_owned(),
                        handlers,
                        options,
                        consumer_tag: None,
                    },
                );
                true
            }
        };

        if inserted {
            self.events
                .publish(BusEvent::SubscriptionCreated { queue: queue.to_owned() });
        }

        inserted
    }

    /// Attaches a consumer tag to an existing descriptor. Returns false when
    /// no descriptor exists.
    pub fn tag(&self, queue: &str, consumer_tag: &str) -> bool {
        let tagged = {
            let mut registry = self.registry.lock().unwrap();
            match registry.subscriptions.get_mut(queue) {
                Some(subscription) => {
                    subscription.consumer_tag = Some(consumer_tag.to_owned());
                    true
                }
                None => false,
            }
        };

        if tagged {
            self.events.publish(BusEvent::SubscriptionTagged {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.to_owned(),
            });
        }

        tagged
    }

    /// A copy of the descriptor for `queue`.
    pub fn get(&self, queue: &str) -> Option<Subscription> {
        self.registry.lock().unwrap().subscriptions.get(queue).cloned()
    }

    /// True when a descriptor exists and, unless `require_tag` is false, has
    /// an active consumer tag.
    pub fn contains(&self, queue: &str, require_tag: bool) -> bool {
        let registry = self.registry.lock().unwrap();
        match registry.subscriptions.get(queue) {
            Some(subscription) => !require_tag || subscription.consumer_tag.is_some(),
            None => false,
        }
    }

    /// Removes the consumer tag if present. Returns true when a tag was
    /// cleared.
    pub fn clear(&self, queue: &str) -> bool {
        let cleared = {
            let mut registry = self.registry.lock().unwrap();
            match registry.subscriptions.get_mut(queue) {
                Some(subscription) => subscription.consumer_tag.take().is_some(),
                None => false,
            }
        };

        if cleared {
            self.events
                .publish(BusEvent::SubscriptionCleared { queue: queue.to_owned() });
        }

        cleared
    }

    /// Deletes the descriptor. Returns true when one existed.
    pub fn remove(&self, queue: &str) -> bool {
        let removed = {
            let mut registry = self.registry.lock().unwrap();
            registry.subscriptions.remove(queue).is_some()
        };

        if removed {
            self.events
                .publish(BusEvent::SubscriptionRemoved { queue: queue.to_owned() });
        }

        removed
    }

    /// Clears the consumer tag of every descriptor, emitting one cleared
    /// event per entry.
    pub fn clear_all(&self) {
        let cleared: Vec<String> = {
            let mut registry = self.registry.lock().unwrap();
            registry
                .subscriptions
                .values_mut()
                .filter_map(|subscription| {
                    if subscription.consumer_tag.take().is_some() {
                        Some(subscription.queue.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };

        for queue in cleared {
            self.events.publish(BusEvent::SubscriptionCleared { queue });
        }
    }

    /// Snapshot of every descriptor.
    pub fn list(&self) -> Vec<Subscription> {
        self.registry
            .lock()
            .unwrap()
            .subscriptions
            .values()
            .cloned()
            .collect()
    }

    /// Adds `queue` to the blocked set. Returns true iff it was newly
    /// blocked.
    pub fn block(&self, queue: &str) -> bool {
        let blocked = self.registry.lock().unwrap().blocked.insert(queue.to_owned());

        if blocked {
            self.events
                .publish(BusEvent::SubscriptionBlocked { queue: queue.to_owned() });
        }

        blocked
    }

    /// Removes `queue` from the blocked set. Returns true iff it was blocked.
    pub fn unblock(&self, queue: &str) -> bool {
        let unblocked = self.registry.lock().unwrap().blocked.remove(queue);

        if unblocked {
            self.events
                .publish(BusEvent::SubscriptionUnblocked { queue: queue.to_owned() });
        }

        unblocked
    }

    /// True when `queue` refuses new subscription attempts.
    pub fn is_blocked(&self, queue: &str) -> bool {
        self.registry.lock().unwrap().blocked.contains(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BusEvent;

    fn manager() -> (SubscriptionManager, tokio::sync::broadcast::Receiver<BusEvent>) {
        let events = EventBus::new(64, false);
        let listener = events.subscribe();
        (SubscriptionManager::new(events), listener)
    }

    #[test]
    fn create_inserts_once_per_queue() {
        let (manager, _listener) = manager();

        assert!(manager.create("orders", Handlers::new(), SubscriptionOptions::default()));
        assert!(!manager.create("orders", Handlers::new(), SubscriptionOptions::default()));
        assert_eq!(manager.list().len(), 1);
    }

    #[test]
    fn contains_requires_a_tag_by_default() {
        let (manager, _listener) = manager();
        manager.create("orders", Handlers::new(), SubscriptionOptions::default());

        assert!(!manager.contains("orders", true));
        assert!(manager.contains("orders", false));

        assert!(manager.tag("orders", "tag-1"));
        assert!(manager.contains("orders", true));
        assert_eq!(
            manager.get("orders").unwrap().consumer_tag.as_deref(),
            Some("tag-1")
        );
    }

    #[test]
    fn tag_fails_without_a_descriptor() {
        let (manager, _listener) = manager();

        assert!(!manager.tag("orders", "tag-1"));
    }

    #[test]
    fn clear_removes_only_the_tag() {
        let (manager, _listener) = manager();
        manager.create("orders", Handlers::new(), SubscriptionOptions::default());
        manager.tag("orders", "tag-1");

        assert!(manager.clear("orders"));
        assert!(!manager.clear("orders"));
        assert!(manager.contains("orders", false));
        assert!(!manager.contains("orders", true));
    }

    #[test]
    fn remove_deletes_the_descriptor() {
        let (manager, _listener) = manager();
        manager.create("orders", Handlers::new(), SubscriptionOptions::default());

        assert!(manager.remove("orders"));
        assert!(!manager.remove("orders"));
        assert!(!manager.contains("orders", false));
    }

    #[test]
    fn clear_all_strips_every_tag() {
        let (manager, _listener) = manager();
        for queue in ["a", "b", "c"] {
            manager.create(queue, Handlers::new(), SubscriptionOptions::default());
            manager.tag(queue, "tag");
        }

        manager.clear_all();

        for queue in ["a", "b", "c"] {
            assert!(!manager.contains(queue, true));
            assert!(manager.contains(queue, false));
        }
    }

    #[test]
    fn get_returns_a_defensive_copy() {
        let (manager, _listener) = manager();
        manager.create("orders", Handlers::new(), SubscriptionOptions::default());

        let mut copy = manager.get("orders").unwrap();
        copy.consumer_tag = Some("local-only".to_owned());

        assert!(manager.get("orders").unwrap().consumer_tag.is_none());
    }

    #[test]
    fn blocking_is_orthogonal_to_subscription_state() {
        let (manager, _listener) = manager();
        manager.create("orders", Handlers::new(), SubscriptionOptions::default());

        assert!(manager.block("orders"));
        assert!(!manager.block("orders"));
        assert!(manager.is_blocked("orders"));
        // the descriptor is untouched by blocking
        assert!(manager.contains("orders", false));

        assert!(manager.unblock("orders"));
        assert!(!manager.unblock("orders"));
        assert!(!manager.is_blocked("orders"));
    }

    #[tokio::test]
    async fn lifecycle_events_fire_after_mutation() {
        let (manager, mut listener) = manager();

        manager.create("orders", Handlers::new(), SubscriptionOptions::default());
        manager.tag("orders", "tag-1");
        manager.clear("orders");
        manager.remove("orders");
        manager.block("orders");
        manager.unblock("orders");

        let expected = [
            BusEvent::SubscriptionCreated { queue: "orders".to_owned() },
            BusEvent::SubscriptionTagged {
                queue: "orders".to_owned(),
                consumer_tag: "tag-1".to_owned(),
            },
            BusEvent::SubscriptionCleared { queue: "orders".to_owned() },
            BusEvent::SubscriptionRemoved { queue: "orders".to_owned() },
            BusEvent::SubscriptionBlocked { queue: "orders".to_owned() },
            BusEvent::SubscriptionUnblocked { queue: "orders".to_owned() },
        ];

        for event in expected {
            assert_eq!(listener.recv().await.unwrap(), event);
        }
    }
}
