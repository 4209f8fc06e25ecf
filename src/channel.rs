// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Management
//!
//! A named registry of AMQP channels layered over the connection registry.
//! Each [`ChannelContext`] stores the *name* of its owning connection rather
//! than the connection itself, so contexts can be recycled during recovery
//! without ownership cycles. A context also tracks the consumers registered
//! on its channel; the recovery coordinator replays that roster after
//! re-establishing the channel.

use crate::{
    config::{ConnectionOptions, SubscriptionOptions},
    connection::ConnectionManager,
    errors::BusError,
    events::{BusEvent, EventBus},
    handler::Handlers,
};
use lapin::{
    options::{BasicQosOptions, ConfirmSelectOptions},
    Channel,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tracing::{debug, error};

/// Configuration applied when a channel is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Number of unacknowledged messages allowed on the channel
    pub prefetch_limit: u16,
    /// Enable publisher confirms
    pub confirm: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            prefetch_limit: 5,
            confirm: false,
        }
    }
}

/// A consumer registered on a channel: everything needed to re-establish it.
#[derive(Clone)]
pub struct ConsumerRegistration {
    pub queue: String,
    pub handlers: Handlers,
    pub options: SubscriptionOptions,
}

impl std::fmt::Debug for ConsumerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerRegistration")
            .field("queue", &self.queue)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("options", &self.options)
            .finish()
    }
}

/// A named channel descriptor.
///
/// The live handle is absent until `create` succeeds and is cleared when the
/// channel dies; the descriptor and its consumer roster survive so recovery
/// can re-establish them.
#[derive(Debug)]
pub struct ChannelContext {
    name: String,
    connection_name: String,
    options: ChannelOptions,
    handle: tokio::sync::Mutex<Option<Channel>>,
    consumers: Mutex<HashMap<String, ConsumerRegistration>>,
}

impl ChannelContext {
    fn new(name: &str, connection_name: &str, options: ChannelOptions) -> Self {
        Self {
            name: name.to_owned(),
            connection_name: connection_name.to_owned(),
            options,
            handle: tokio::sync::Mutex::new(None),
            consumers: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning connection; resolve it through the connection
    /// manager when the live connection is needed.
    pub fn connection_name(&self) -> &str {
        &self.connection_name
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// The live channel, if any.
    pub async fn channel(&self) -> Option<Channel> {
        self.handle.lock().await.clone()
    }

    pub(crate) async fn clear(&self) {
        self.handle.lock().await.take();
    }

    /// Snapshot of the consumer roster as (consumer tag, registration) pairs.
    pub(crate) fn consumers(&self) -> Vec<(String, ConsumerRegistration)> {
        self.consumers
            .lock()
            .unwrap()
            .iter()
            .map(|(tag, registration)| (tag.clone(), registration.clone()))
            .collect()
    }
}

/// Named channel registry.
pub struct ChannelManager {
    contexts: Mutex<HashMap<String, Arc<ChannelContext>>>,
    connections: Arc<ConnectionManager>,
    events: EventBus,
}

impl ChannelManager {
    pub(crate) fn new(connections: Arc<ConnectionManager>, events: EventBus) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            connections,
            events,
        }
    }

    /// Access to the underlying connection registry.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Creates or returns the named channel.
    ///
    /// Ensures the owning connection exists first (creating it through the
    /// connection manager when `connection_options` are supplied or a
    /// descriptor is already registered), then opens the channel and applies
    /// its prefetch limit. Idempotent under the per-channel lock.
    pub async fn create(
        &self,
        name: &str,
        connection_name: &str,
        options: ChannelOptions,
        connection_options: Option<ConnectionOptions>,
    ) -> Result<Arc<ChannelContext>, BusError> {
        let context = {
            let mut contexts = self.contexts.lock().unwrap();
            match contexts.get(name) {
                Some(context) => context.clone(),
                None => {
                    let context =
                        Arc::new(ChannelContext::new(name, connection_name, options));
                    contexts.insert(name.to_owned(), context.clone());
                    context
                }
            }
        };

        let mut handle = context.handle.lock().await;

        if let Some(channel) = handle.as_ref() {
            if channel.status().connected() {
                drop(handle);
                return Ok(context);
            }
        }

        let connection_context = self
            .connections
            .create(context.connection_name(), connection_options)
            .await?;
        let connection = connection_context
            .connection()
            .await
            .ok_or_else(|| BusError::ConnectionError("connection handle is absent".to_owned()))?;

        debug!(name, "creating amqp channel");
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), name, "error to create the channel");
                return Err(BusError::ChannelError(err.to_string()));
            }
        };

        let prefetch = context.options().prefetch_limit;
        if prefetch > 0 {
            channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await
                .map_err(|err| BusError::ChannelError(err.to_string()))?;
        }

        if context.options().confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| BusError::ChannelError(err.to_string()))?;
        }

        *handle = Some(channel);
        drop(handle);

        self.events
            .publish(BusEvent::ChannelCreated { name: name.to_owned() });

        Ok(context)
    }

    /// True when a descriptor is registered under `name`, live or not.
    pub fn contains(&self, name: &str) -> bool {
        self.contexts.lock().unwrap().contains_key(name)
    }

    /// The descriptor registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ChannelContext>> {
        self.contexts.lock().unwrap().get(name).cloned()
    }

    /// The live channel registered under `name`.
    pub async fn get_channel(&self, name: &str) -> Option<Channel> {
        match self.get(name) {
            Some(context) => context.channel().await,
            None => None,
        }
    }

    /// Closes the named channel, keeping the descriptor and its roster.
    pub async fn close(&self, name: &str) -> Result<(), BusError> {
        let Some(context) = self.get(name) else {
            return Ok(());
        };

        let mut handle = context.handle.lock().await;
        if let Some(channel) = handle.take() {
            if let Err(err) = channel.close(200, "closing").await {
                debug!(error = err.to_string(), name, "channel was already closed");
            }
            drop(handle);
            self.events
                .publish(BusEvent::ChannelClosed { name: name.to_owned() });
        }

        Ok(())
    }

    /// Closes and forgets the named descriptor.
    pub async fn remove(&self, name: &str) -> Result<(), BusError> {
        self.close(name).await?;
        self.contexts.lock().unwrap().remove(name);
        Ok(())
    }

    /// Records a consumer on the channel's roster. Returns false when no
    /// descriptor is registered under `name`.
    pub fn add_consumer(
        &self,
        name: &str,
        consumer_tag: &str,
        registration: ConsumerRegistration,
    ) -> bool {
        match self.get(name) {
            Some(context) => {
                context
                    .consumers
                    .lock()
                    .unwrap()
                    .insert(consumer_tag.to_owned(), registration);
                true
            }
            None => false,
        }
    }

    /// Drops a consumer from the channel's roster. Returns false when either
    /// the descriptor or the tag is unknown.
    pub fn remove_consumer(&self, name: &str, consumer_tag: &str) -> bool {
        match self.get(name) {
            Some(context) => context
                .consumers
                .lock()
                .unwrap()
                .remove(consumer_tag)
                .is_some(),
            None => false,
        }
    }

    /// Snapshot of every registered channel descriptor.
    pub(crate) fn list(&self) -> Vec<Arc<ChannelContext>> {
        self.contexts.lock().unwrap().values().cloned().collect()
    }

    /// Names of every registered descriptor.
    pub(crate) fn names(&self) -> Vec<String> {
        self.contexts.lock().unwrap().keys().cloned().collect()
    }
}
