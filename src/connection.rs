// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! A named registry of broker connections. Each name maps to a
//! [`ConnectionContext`] whose identity survives disconnects: closing a
//! connection leaves the descriptor (and its options) in place so the same
//! name reconnects with the same configuration during recovery. Creation for
//! a given name is serialized through the context's lock, so concurrent
//! callers of `create` receive the same live connection.

use crate::{
    config::ConnectionOptions,
    errors::BusError,
    events::{BusEvent, EventBus, RecoverySignal},
};
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

/// A named connection descriptor.
///
/// The live handle is absent until `create` succeeds and is cleared when the
/// broker drops the connection; only the owning [`ConnectionManager`] mutates
/// it.
#[derive(Debug)]
pub struct ConnectionContext {
    name: String,
    options: ConnectionOptions,
    handle: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl ConnectionContext {
    fn new(name: &str, options: ConnectionOptions) -> Self {
        Self {
            name: name.to_owned(),
            options,
            handle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// The live connection, if any.
    pub async fn connection(&self) -> Option<Arc<Connection>> {
        self.handle.lock().await.clone()
    }

    /// Drops the live handle without closing it; recovery calls this when the
    /// broker already tore the transport down.
    pub(crate) async fn clear(&self) {
        self.handle.lock().await.take();
    }
}

/// Named connection registry.
pub struct ConnectionManager {
    contexts: Mutex<HashMap<String, Arc<ConnectionContext>>>,
    events: EventBus,
    recovery: UnboundedSender<RecoverySignal>,
}

impl ConnectionManager {
    pub(crate) fn new(events: EventBus, recovery: UnboundedSender<RecoverySignal>) -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            events,
            recovery,
        }
    }

    /// Creates or returns the named connection.
    ///
    /// Idempotent: a live connection under `name` is returned as-is, and
    /// concurrent creates for the same name wait on the context lock and
    /// receive the same result. Registering a brand-new name requires
    /// `options`; reconnecting an existing descriptor does not.
    pub async fn create(
        &self,
        name: &str,
        options: Option<ConnectionOptions>,
    ) -> Result<Arc<ConnectionContext>, BusError> {
        let context = {
            let mut contexts = self.contexts.lock().unwrap();
            match contexts.get(name) {
                Some(context) => context.clone(),
                None => {
                    let options = options.ok_or(BusError::MissingConnectionOptions)?;
                    let context = Arc::new(ConnectionContext::new(name, options));
                    contexts.insert(name.to_owned(), context.clone());
                    context
                }
            }
        };

        let mut handle = context.handle.lock().await;

        if let Some(connection) = handle.as_ref() {
            if connection.status().connected() {
                drop(handle);
                return Ok(context);
            }
        }

        let connection = Arc::new(self.connect_with_retry(&context).await?);
        self.watch(&context, &connection);
        *handle = Some(connection);
        drop(handle);

        self.events
            .publish(BusEvent::ConnectionCreated { name: name.to_owned() });

        Ok(context)
    }

    /// True when a descriptor is registered under `name`, live or not.
    pub fn contains(&self, name: &str) -> bool {
        self.contexts.lock().unwrap().contains_key(name)
    }

    /// The descriptor registered under `name`.
    pub fn get(&self, name: &str) -> Option<Arc<ConnectionContext>> {
        self.contexts.lock().unwrap().get(name).cloned()
    }

    /// The live connection registered under `name`.
    pub async fn get_connection(&self, name: &str) -> Option<Arc<Connection>> {
        match self.get(name) {
            Some(context) => context.connection().await,
            None => None,
        }
    }

    /// Closes the named connection, keeping the descriptor so the identity
    /// survives reconnects. Closing an already-closed connection succeeds.
    pub async fn close(&self, name: &str) -> Result<(), BusError> {
        let Some(context) = self.get(name) else {
            return Ok(());
        };

        let mut handle = context.handle.lock().await;
        if let Some(connection) = handle.take() {
            if let Err(err) = connection.close(200, "closing").await {
                debug!(
                    error = err.to_string(),
                    name, "connection was already closed"
                );
            }
            drop(handle);
            self.events
                .publish(BusEvent::ConnectionClosed { name: name.to_owned() });
        }

        Ok(())
    }

    /// Closes and forgets the named descriptor.
    pub async fn remove(&self, name: &str) -> Result<(), BusError> {
        self.close(name).await?;
        self.contexts.lock().unwrap().remove(name);
        Ok(())
    }

    /// Names of every registered descriptor.
    pub(crate) fn names(&self) -> Vec<String> {
        self.contexts.lock().unwrap().keys().cloned().collect()
    }

    async fn connect_with_retry(
        &self,
        context: &ConnectionContext,
    ) -> Result<Connection, BusError> {
        let uri = context.options().uri();
        let retries = context.options().connection_retry_count;
        let delay = Duration::from_millis(context.options().retry_delay_ms);

        for attempt in 0..=retries {
            debug!(name = context.name(), attempt, "connecting to broker");

            let properties = ConnectionProperties::default()
                .with_connection_name(LongString::from(context.name().to_owned()));

            match Connection::connect(&uri, properties).await {
                Ok(connection) => {
                    debug!(name = context.name(), "amqp connected");
                    return Ok(connection);
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        name = context.name(),
                        attempt,
                        "failure to connect"
                    );
                    self.events.publish(BusEvent::ConnectionError {
                        name: context.name().to_owned(),
                        error: err.to_string(),
                    });

                    if attempt < retries {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(BusError::ConnectionRetry)
    }

    /// Registers the broker error callback feeding the recovery coordinator.
    fn watch(&self, context: &ConnectionContext, connection: &Connection) {
        let name = context.name().to_owned();
        let events = self.events.clone();
        let recovery = self.recovery.clone();

        connection.on_error(move |err| {
            warn!(
                error = err.to_string(),
                name, "broker connection errored, requesting recovery"
            );
            events.publish(BusEvent::ConnectionError {
                name: name.clone(),
                error: err.to_string(),
            });
            let _ = recovery.send(RecoverySignal::Connection(name.clone()));
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn manager() -> ConnectionManager {
        let (recovery, _rx) = mpsc::unbounded_channel();
        ConnectionManager::new(EventBus::new(16, false), recovery)
    }

    fn unreachable_options() -> ConnectionOptions {
        ConnectionOptions {
            server: "127.0.0.1".to_owned(),
            port: 1,
            connection_retry_count: 2,
            retry_delay_ms: 10,
            ..ConnectionOptions::default()
        }
    }

    #[tokio::test]
    async fn create_without_options_for_unknown_name_fails() {
        let manager = manager();

        assert_eq!(
            manager.create("default", None).await.unwrap_err(),
            BusError::MissingConnectionOptions
        );
        assert!(!manager.contains("default"));
    }

    #[tokio::test]
    async fn create_against_unreachable_broker_exhausts_retries() {
        let manager = manager();

        let result = manager
            .create("default", Some(unreachable_options()))
            .await;

        assert_eq!(result.unwrap_err(), BusError::ConnectionRetry);
        // the descriptor stays registered so a later create can retry it
        assert!(manager.contains("default"));
        assert!(manager.get_connection("default").await.is_none());
    }

    #[tokio::test]
    async fn retry_failures_emit_connection_error_events() {
        let (recovery, _rx) = mpsc::unbounded_channel();
        let events = EventBus::new(32, false);
        let mut listener = events.subscribe();
        let manager = ConnectionManager::new(events, recovery);

        let _ = manager.create("default", Some(unreachable_options())).await;

        let mut error_events = 0;
        while let Ok(event) = listener.try_recv() {
            if matches!(event, BusEvent::ConnectionError { .. }) {
                error_events += 1;
            }
        }
        // one initial attempt plus two retries
        assert_eq!(error_events, 3);
    }

    #[tokio::test]
    async fn close_and_remove_are_noops_for_unknown_names() {
        let manager = manager();

        assert_eq!(manager.close("missing").await, Ok(()));
        assert_eq!(manager.remove("missing").await, Ok(()));
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_names() {
        let manager = manager();

        assert!(manager.get("missing").is_none());
        assert!(manager.get_connection("missing").await.is_none());
    }
}
