// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Partition Serial Dispatcher
//!
//! An in-process scheduler that serializes handler invocations per logical
//! partition while allowing parallelism across partitions. Each pushed
//! delegate lands in a FIFO queue keyed by `<queue>:<partition>`; one drain
//! task per key invokes delegates strictly in push order, and the key is
//! evicted from the registry once its queue runs dry.
//!
//! The partition of a message is picked by resolving the configured selector
//! templates against its decoded payload; messages that resolve to no value
//! share the `"default"` partition.

use crate::{
    errors::BusError,
    events::{EventBus, LogLevel},
    routing,
};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, error};

/// A queued handler invocation.
pub type DispatchDelegate = BoxFuture<'static, Result<(), BusError>>;

struct PartitionQueue {
    pending: VecDeque<DispatchDelegate>,
}

/// Per-partition FIFO scheduler. Cloneable and shareable across tasks.
pub struct SerialDispatcher {
    selectors: Vec<String>,
    queues: Arc<Mutex<HashMap<String, PartitionQueue>>>,
    events: EventBus,
}

impl SerialDispatcher {
    /// Creates a dispatcher with the given ordered partition-key selectors.
    pub fn new(selectors: Vec<String>, events: EventBus) -> Self {
        Self {
            selectors,
            queues: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Enqueues a delegate under the partition resolved from `payload`.
    ///
    /// Within one partition key, delegates run strictly in push order and
    /// never overlap; across keys they interleave freely. A failing delegate
    /// is logged and never stalls the ones behind it.
    pub fn push(&self, queue_name: &str, payload: Option<&Value>, delegate: DispatchDelegate) {
        let partition = routing::partition_value(&self.selectors, payload);
        let key = routing::dispatch_key(queue_name, &partition);

        let spawn_drain = {
            let mut queues = self.queues.lock().unwrap();
            match queues.get_mut(&key) {
                Some(queue) => {
                    queue.pending.push_back(delegate);
                    false
                }
                None => {
                    let mut pending = VecDeque::new();
                    pending.push_back(delegate);
                    queues.insert(key.clone(), PartitionQueue { pending });
                    true
                }
            }
        };

        if spawn_drain {
            debug!(key, "starting partition drain");
            self.spawn_drain(key);
        }
    }

    /// Number of partition queues currently registered. Returns to zero once
    /// every pushed delegate has completed.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().unwrap().len()
    }

    /// Polls until the registry drains or the timeout elapses. Returns true
    /// when the dispatcher went idle in time.
    pub async fn drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.queue_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn spawn_drain(&self, key: String) {
        let queues = self.queues.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            loop {
                // take the head without holding the registry across the await
                let next = {
                    let mut map = queues.lock().unwrap();
                    match map.get_mut(&key) {
                        Some(queue) => match queue.pending.pop_front() {
                            Some(delegate) => delegate,
                            None => {
                                map.remove(&key);
                                break;
                            }
                        },
                        None => break,
                    }
                };

                if let Err(err) = next.await {
                    error!(error = err.to_string(), key, "dispatched delegate failed");
                    events.log(
                        LogLevel::Error,
                        format!("delegate on `{}` failed: {}", key, err),
                    );
                }
            }

            debug!(key, "partition drained");
        });
    }
}
