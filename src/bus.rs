// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # The Bus Facade
//!
//! The public API of the library. A [`BunnyBus`] owns the connection, channel
//! and subscription registries, the partition dispatcher and the event bus,
//! and wires them into the publish and subscribe flows. It also runs the
//! auto-recovery coordinator: broker-side connection errors and dying
//! consumer streams are coalesced into recovery passes that re-establish
//! connections, channels, topology, bindings and consumers underneath the
//! application.
//!
//! Well-known names: connections default to `"default"`, publishing and
//! administration share the `"bunnybus-publisher"` channel, each subscribed
//! queue consumes on `"subscribe:<queue>"`, and every subscription gets a
//! durable `<queue>_error` sidecar queue.

use crate::{
    channel::{ChannelManager, ChannelOptions, ConsumerRegistration},
    config::{BusConfig, SubscriptionOptions},
    connection::ConnectionManager,
    consumer::{self, ConsumeContext},
    dispatcher::SerialDispatcher,
    errors::BusError,
    events::{BusEvent, EventBus, LogLevel, RecoverySignal},
    exchange::ExchangeDefinition,
    handler::Handlers,
    message::{self, MessageHeaders},
    publisher,
    queue::{QueueBinding, QueueDefinition},
    routing,
    subscription::SubscriptionManager,
    topology::{self, QueueStats},
};
use lapin::{
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicGetOptions},
    types::FieldTable,
    Channel,
};
use serde::Serialize;
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Name of the connection used unless a caller registers its own
pub const DEFAULT_CONNECTION_NAME: &str = "default";

/// Channel shared by publishing and the administrative passthroughs
pub const PUBLISH_CHANNEL_NAME: &str = "bunnybus-publisher";

/// Bound on how long `stop` waits for in-flight handler invocations
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the channel consuming a queue.
pub fn queue_channel_name(queue: &str) -> String {
    format!("subscribe:{}", queue)
}

/// Name of the error-queue sidecar of a queue.
pub fn error_queue_name(queue: &str) -> String {
    format!("{}_error", queue)
}

/// Per-call options for `publish` and `send`.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overrides the route key derived from the message's `event` field
    pub route_key: Option<String>,
    /// Producer tag propagated into the `source` header
    pub source: Option<String>,
    /// Reuses an existing transaction id instead of minting a fresh one
    pub transaction_id: Option<String>,
    /// Reuses an existing creation timestamp instead of stamping now
    pub created_at: Option<String>,
    /// Arbitrary user headers carried with the message
    pub headers: BTreeMap<String, Value>,
}

/// Full-shape subscribe parameters.
#[derive(Clone)]
pub struct SubscribeRequest {
    pub queue: String,
    pub handlers: Handlers,
    pub options: SubscriptionOptions,
}

/// A message pulled off a queue with `get`.
#[derive(Debug, Clone)]
pub struct GottenMessage {
    pub queue: String,
    pub payload: Value,
    pub headers: MessageHeaders,
    /// Messages remaining on the queue after this one
    pub message_count: u32,
    /// Delivery tag on the shared publisher channel, for `ack_message`
    pub delivery_tag: u64,
    pub redelivered: bool,
}

/// The opinionated publish/subscribe facade over AMQP 0-9-1.
#[derive(Clone)]
pub struct BunnyBus {
    inner: Arc<BusInner>,
}

pub(crate) struct BusInner {
    config: BusConfig,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    subscriptions: Arc<SubscriptionManager>,
    dispatcher: Arc<SerialDispatcher>,
    events: EventBus,
    recovery_tx: UnboundedSender<RecoverySignal>,
    /// Serializes recovery passes; concurrent close notifications coalesce
    recovering: tokio::sync::Mutex<()>,
}

impl BunnyBus {
    /// Creates a bus. Connections are established lazily on first use.
    pub fn new(config: BusConfig) -> Self {
        let events = EventBus::new(128, config.silence);
        let (recovery_tx, recovery_rx) = mpsc::unbounded_channel();

        let connections = Arc::new(ConnectionManager::new(events.clone(), recovery_tx.clone()));
        let channels = Arc::new(ChannelManager::new(connections.clone(), events.clone()));
        let subscriptions = Arc::new(SubscriptionManager::new(events.clone()));
        let dispatcher = Arc::new(SerialDispatcher::new(
            config.partition_key_selectors.clone(),
            events.clone(),
        ));

        let inner = Arc::new(BusInner {
            config,
            connections,
            channels,
            subscriptions,
            dispatcher,
            events,
            recovery_tx,
            recovering: tokio::sync::Mutex::new(()),
        });

        spawn_recovery_loop(Arc::downgrade(&inner), recovery_rx);

        Self { inner }
    }

    /// The bus's event surface.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The named connection registry.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.inner.connections
    }

    /// The named channel registry.
    pub fn channels(&self) -> &Arc<ChannelManager> {
        &self.inner.channels
    }

    /// The subscription registry.
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.inner.subscriptions
    }

    /// The partition dispatcher.
    pub fn dispatcher(&self) -> &Arc<SerialDispatcher> {
        &self.inner.dispatcher
    }

    /// Publishes a message through the global topic exchange.
    ///
    /// The route key comes from the options or the message's `event` field;
    /// a message with neither fails with [`BusError::NoRouteKey`] before any
    /// broker work happens. Headers get a fresh transaction id and creation
    /// timestamp unless the options carry existing ones.
    pub async fn publish<T: Serialize>(
        &self,
        message: &T,
        options: Option<PublishOptions>,
    ) -> Result<(), BusError> {
        let options = options.unwrap_or_default();
        let payload = serde_json::to_value(message).map_err(|_| BusError::EncodePayloadError)?;
        let route_key = routing::route_key_of(&payload, options.route_key.as_deref())
            .ok_or(BusError::NoRouteKey)?;

        let inner = &self.inner;
        let channel = inner.publish_channel().await?;

        topology::assert_exchange(&channel, &inner.global_exchange_definition()).await?;

        let headers = inner.build_headers(&route_key, &options);
        let bytes = message::encode_payload(&payload)?;
        publisher::publish_message(
            &channel,
            &inner.config.global_exchange,
            &route_key,
            &bytes,
            &headers,
        )
        .await?;

        debug!(route_key, transaction_id = headers.transaction_id, "message published");
        inner.events.publish(BusEvent::MessagePublished {
            route_key,
            transaction_id: headers.transaction_id,
        });

        Ok(())
    }

    /// Sends a message straight to a queue through the default exchange,
    /// bypassing the topic exchange.
    pub async fn send<T: Serialize>(
        &self,
        message: &T,
        queue: &str,
        options: Option<PublishOptions>,
    ) -> Result<(), BusError> {
        let options = options.unwrap_or_default();
        let payload = serde_json::to_value(message).map_err(|_| BusError::EncodePayloadError)?;
        let route_key = routing::route_key_of(&payload, options.route_key.as_deref())
            .unwrap_or_else(|| queue.to_owned());

        let inner = &self.inner;
        let channel = inner.publish_channel().await?;

        topology::assert_queue(&channel, &QueueDefinition::new(queue).durable()).await?;

        let headers = inner.build_headers(&route_key, &options);
        let bytes = message::encode_payload(&payload)?;
        publisher::publish_message(&channel, "", queue, &bytes, &headers).await?;

        inner.events.publish(BusEvent::MessagePublished {
            route_key,
            transaction_id: headers.transaction_id,
        });

        Ok(())
    }

    /// Subscribes a queue with a pattern-to-handler mapping and default
    /// options.
    pub async fn subscribe(&self, queue: &str, handlers: Handlers) -> Result<(), BusError> {
        self.subscribe_with(SubscribeRequest {
            queue: queue.to_owned(),
            handlers,
            options: SubscriptionOptions::default(),
        })
        .await
    }

    /// Subscribes a queue.
    ///
    /// Declares the global exchange, the durable primary queue and its
    /// `<queue>_error` sidecar, binds the primary queue under every handler
    /// pattern (wildcards allowed), registers a broker consumer and tags the
    /// subscription with its consumer tag.
    pub async fn subscribe_with(&self, request: SubscribeRequest) -> Result<(), BusError> {
        let inner = &self.inner;
        let queue = request.queue.clone();

        if inner.subscriptions.contains(&queue, true) {
            return Err(BusError::SubscriptionExist(queue));
        }
        if inner.subscriptions.is_blocked(&queue) {
            return Err(BusError::SubscriptionBlocked(queue));
        }

        // An untagged descriptor left behind by an earlier unsubscribe must
        // not mask the new handlers and options: drop it and insert fresh so
        // get/list keep reporting what the live consumer dispatches against.
        if !inner
            .subscriptions
            .create(&queue, request.handlers.clone(), request.options.clone())
        {
            inner.subscriptions.remove(&queue);
            inner
                .subscriptions
                .create(&queue, request.handlers.clone(), request.options.clone());
        }

        let registration = ConsumerRegistration {
            queue: queue.clone(),
            handlers: request.handlers,
            options: request.options,
        };
        inner
            .establish_consumer(&queue_channel_name(&queue), &registration)
            .await?;

        inner.events.publish(BusEvent::QueueSubscribed { queue });

        Ok(())
    }

    /// Cancels the queue's broker consumer and clears its consumer tag.
    /// Unsubscribing a queue that was never subscribed is a no-op.
    pub async fn unsubscribe(&self, queue: &str) -> Result<(), BusError> {
        let inner = &self.inner;
        let Some(subscription) = inner.subscriptions.get(queue) else {
            return Ok(());
        };

        let channel_name = queue_channel_name(queue);

        if let Some(consumer_tag) = subscription.consumer_tag {
            if let Some(channel) = inner.channels.get_channel(&channel_name).await {
                if let Err(err) = channel
                    .basic_cancel(&consumer_tag, BasicCancelOptions { nowait: false })
                    .await
                {
                    warn!(
                        error = err.to_string(),
                        queue, "failed to cancel consumer, clearing the tag anyway"
                    );
                }
            }
            inner.channels.remove_consumer(&channel_name, &consumer_tag);
            inner.subscriptions.clear(queue);
        }

        inner
            .events
            .publish(BusEvent::QueueUnsubscribed { queue: queue.to_owned() });

        Ok(())
    }

    /// Pulls a single message off a queue (broker `basic.get`). Returns
    /// `None` when the queue is empty. The delivery stays unacknowledged
    /// until `ack_message` or `requeue_message`.
    pub async fn get(&self, queue: &str) -> Result<Option<GottenMessage>, BusError> {
        let channel = self.inner.publish_channel().await?;

        match channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error getting message");
                Err(BusError::ConsumeError(queue.to_owned()))
            }
            Ok(None) => Ok(None),
            Ok(Some(get_message)) => {
                let headers = MessageHeaders::from_field_table(
                    get_message.delivery.properties.headers().as_ref(),
                );
                let payload = message::decode_payload(&get_message.delivery.data)?;

                Ok(Some(GottenMessage {
                    queue: queue.to_owned(),
                    payload,
                    headers,
                    message_count: get_message.message_count,
                    delivery_tag: get_message.delivery.delivery_tag,
                    redelivered: get_message.delivery.redelivered,
                }))
            }
        }
    }

    /// Republishes a message to its queue with requeue accounting applied:
    /// same transaction id and creation timestamp, `retryCount` bumped,
    /// `requeuedAt` stamped. Acks the original delivery when a tag is given.
    /// Channels are re-established transparently if they closed in between.
    #[doc(hidden)]
    pub async fn requeue_message(
        &self,
        queue: &str,
        payload: &Value,
        headers: &MessageHeaders,
        delivery_tag: Option<u64>,
    ) -> Result<(), BusError> {
        let channel = self.inner.publish_channel().await?;

        let mut headers = headers.clone();
        headers.stamp_requeued();

        let bytes = message::encode_payload(payload)?;
        publisher::publish_message(&channel, "", queue, &bytes, &headers).await?;

        if let Some(tag) = delivery_tag {
            self.ack_on(&channel, tag).await?;
        }

        Ok(())
    }

    /// Routes a message to an error queue with `erroredAt` and the reason
    /// stamped. Without an explicit target the configured fallback error
    /// queue is used.
    #[doc(hidden)]
    pub async fn reject_message(
        &self,
        payload: &Value,
        headers: &MessageHeaders,
        error_queue: Option<&str>,
        reason: Option<&str>,
        delivery_tag: Option<u64>,
    ) -> Result<(), BusError> {
        let inner = &self.inner;
        let target = error_queue.unwrap_or(&inner.config.error_queue);
        let channel = inner.publish_channel().await?;

        topology::assert_queue(&channel, &QueueDefinition::new(target).durable()).await?;

        let mut headers = headers.clone();
        headers.stamp_errored(reason);

        let bytes = message::encode_payload(payload)?;
        publisher::publish_message(&channel, "", target, &bytes, &headers).await?;

        if let Some(tag) = delivery_tag {
            self.ack_on(&channel, tag).await?;
        }

        Ok(())
    }

    /// Acknowledges a delivery obtained through `get`.
    #[doc(hidden)]
    pub async fn ack_message(&self, delivery_tag: u64) -> Result<(), BusError> {
        let channel = self.inner.publish_channel().await?;
        self.ack_on(&channel, delivery_tag).await
    }

    /// Declares an exchange.
    pub async fn create_exchange(&self, def: &ExchangeDefinition) -> Result<(), BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::assert_exchange(&channel, def).await
    }

    /// Deletes an exchange.
    pub async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::delete_exchange(&channel, name, if_unused).await
    }

    /// Declares a queue. Returns the number of messages sitting in it.
    pub async fn create_queue(&self, def: &QueueDefinition) -> Result<u32, BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::assert_queue(&channel, def).await
    }

    /// Deletes a queue. Returns the number of messages dropped with it.
    pub async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::delete_queue(&channel, name, if_unused, if_empty).await
    }

    /// Purges a queue. Returns the number of messages removed.
    pub async fn purge_queue(&self, name: &str) -> Result<u32, BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::purge_queue(&channel, name).await
    }

    /// Checks that a queue exists, returning its counters.
    pub async fn check_queue(&self, name: &str) -> Result<QueueStats, BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::check_queue(&channel, name).await
    }

    /// Checks that an exchange exists.
    pub async fn check_exchange(&self, name: &str) -> Result<(), BusError> {
        let channel = self.inner.publish_channel().await?;
        topology::check_exchange(&channel, name).await
    }

    /// Blocks a queue from new subscription attempts. Returns true iff it was
    /// newly blocked.
    pub fn block(&self, queue: &str) -> bool {
        self.inner.subscriptions.block(queue)
    }

    /// Unblocks a queue. Returns true iff it was blocked.
    pub fn unblock(&self, queue: &str) -> bool {
        self.inner.subscriptions.unblock(queue)
    }

    /// Drains in-flight handler invocations (bounded), then closes every
    /// channel and connection. Descriptors survive, so the bus can be used
    /// again afterwards.
    pub async fn stop(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        inner.events.log(LogLevel::Info, "stopping bus");

        for subscription in inner.subscriptions.list() {
            self.unsubscribe(&subscription.queue).await?;
        }

        if !inner.dispatcher.drained(STOP_DRAIN_TIMEOUT).await {
            warn!("dispatcher still busy after drain timeout, abandoning pending invocations");
        }

        for name in inner.channels.names() {
            inner.channels.close(&name).await?;
        }
        for name in inner.connections.names() {
            inner.connections.close(&name).await?;
        }

        inner.events.log(LogLevel::Info, "bus stopped");

        Ok(())
    }

    async fn ack_on(&self, channel: &Channel, delivery_tag: u64) -> Result<(), BusError> {
        match channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                Err(BusError::AckMessageError)
            }
            _ => Ok(()),
        }
    }
}

impl Default for BunnyBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl BusInner {
    fn global_exchange_definition(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.config.global_exchange)
            .topic()
            .durable()
    }

    fn build_headers(&self, route_key: &str, options: &PublishOptions) -> MessageHeaders {
        let mut headers = MessageHeaders::new(route_key, options.source.as_deref());

        if let Some(transaction_id) = &options.transaction_id {
            headers.transaction_id = transaction_id.clone();
        }
        if let Some(created_at) = &options.created_at {
            headers.created_at = created_at.clone();
        }
        headers.custom = options.headers.clone();

        headers
    }

    /// The shared publisher/administration channel, created on first use and
    /// re-established transparently after transport failures.
    async fn publish_channel(&self) -> Result<Channel, BusError> {
        let context = self
            .channels
            .create(
                PUBLISH_CHANNEL_NAME,
                DEFAULT_CONNECTION_NAME,
                ChannelOptions {
                    prefetch_limit: self.config.prefetch_limit,
                    confirm: self.config.publisher_confirms,
                },
                Some(self.config.connection.clone()),
            )
            .await?;

        context
            .channel()
            .await
            .ok_or_else(|| BusError::ChannelError("channel handle is absent".to_owned()))
    }

    /// Opens (or reopens) a consume channel, asserts topology and bindings,
    /// registers the broker consumer and spawns its consume loop. Shared by
    /// `subscribe` and the recovery coordinator.
    async fn establish_consumer(
        &self,
        channel_name: &str,
        registration: &ConsumerRegistration,
    ) -> Result<(), BusError> {
        let queue = &registration.queue;

        let context = self
            .channels
            .create(
                channel_name,
                DEFAULT_CONNECTION_NAME,
                ChannelOptions {
                    prefetch_limit: self.config.prefetch_limit,
                    confirm: false,
                },
                Some(self.config.connection.clone()),
            )
            .await?;
        let channel = context
            .channel()
            .await
            .ok_or_else(|| BusError::ChannelError("channel handle is absent".to_owned()))?;

        topology::assert_exchange(&channel, &self.global_exchange_definition()).await?;
        topology::assert_queue(&channel, &QueueDefinition::new(queue).durable()).await?;
        topology::assert_queue(
            &channel,
            &QueueDefinition::new(&error_queue_name(queue)).durable(),
        )
        .await?;

        for pattern in registration.handlers.keys() {
            topology::bind_queue(
                &channel,
                &QueueBinding::new(queue)
                    .exchange(&self.config.global_exchange)
                    .routing_key(pattern),
            )
            .await?;
        }

        let consumer_tag = format!("{}.{}", queue, Uuid::new_v4().simple());
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: self.config.auto_acknowledgement,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                BusError::ConsumeError(queue.clone())
            })?;

        self.subscriptions.tag(queue, &consumer_tag);
        self.channels
            .add_consumer(channel_name, &consumer_tag, registration.clone());

        let ctx = Arc::new(ConsumeContext {
            queue: queue.clone(),
            channel_name: channel_name.to_owned(),
            error_queue: error_queue_name(queue),
            handlers: registration.handlers.clone(),
            auto_ack: self.config.auto_acknowledgement,
            max_retry_count: registration
                .options
                .max_retry_count
                .or(self.config.max_retry_count),
            validate_publisher: registration
                .options
                .validate_publisher
                .unwrap_or(self.config.validate_publisher),
            events: self.events.clone(),
            dispatcher: self.dispatcher.clone(),
            channels: self.channels.clone(),
            subscriptions: self.subscriptions.clone(),
            recovery: self.recovery_tx.clone(),
        });
        consumer::spawn_consumer(ctx, consumer, channel);

        Ok(())
    }

    /// One recovery pass over the coalesced failure signals.
    async fn recover(&self, targets: &HashSet<RecoverySignal>) -> Result<(), BusError> {
        let mut channel_names = HashSet::new();

        for signal in targets {
            match signal {
                RecoverySignal::Connection(name) => {
                    if let Some(context) = self.connections.get(name) {
                        context.clear().await;
                    }
                    // every channel riding on the connection is affected
                    for context in self.channels.list() {
                        if context.connection_name() == name {
                            channel_names.insert(context.name().to_owned());
                        }
                    }
                    self.connections.create(name, None).await?;
                }
                RecoverySignal::Channel(name) => {
                    channel_names.insert(name.clone());
                }
            }
        }

        for channel_name in channel_names {
            let Some(context) = self.channels.get(&channel_name) else {
                continue;
            };
            context.clear().await;

            let consumers = context.consumers();
            if consumers.is_empty() {
                // no consumers ride this channel; it reopens on next use
                continue;
            }

            for (stale_tag, registration) in consumers {
                self.channels.remove_consumer(&channel_name, &stale_tag);
                self.subscriptions.clear(&registration.queue);
                self.establish_consumer(&channel_name, &registration).await?;
                debug!(
                    queue = registration.queue,
                    channel = channel_name,
                    "consumer re-established"
                );
            }
        }

        Ok(())
    }
}

/// Runs the recovery coordinator until the bus is dropped.
fn spawn_recovery_loop(inner: Weak<BusInner>, mut signals: UnboundedReceiver<RecoverySignal>) {
    tokio::spawn(async move {
        while let Some(first) = signals.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };

            // coalesce the burst of notifications a single failure produces
            let mut targets = HashSet::new();
            targets.insert(first);
            while let Ok(extra) = signals.try_recv() {
                targets.insert(extra);
            }

            let _guard = inner.recovering.lock().await;
            inner.events.publish(BusEvent::Recovering);
            inner.events.log(LogLevel::Warn, "transport failure detected, recovering");

            let retries = inner.config.connection.connection_retry_count;
            let delay = Duration::from_millis(inner.config.connection.retry_delay_ms);
            let mut outcome = Ok(());

            for attempt in 0..=retries {
                outcome = inner.recover(&targets).await;
                match &outcome {
                    Ok(_) => break,
                    Err(err) => {
                        warn!(
                            error = err.to_string(),
                            attempt, "recovery pass failed"
                        );
                        if attempt < retries {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }

            match outcome {
                Ok(_) => {
                    inner.events.publish(BusEvent::Recovered);
                    inner.events.log(LogLevel::Info, "recovery complete");
                }
                Err(err) => {
                    error!(error = err.to_string(), "recovery failed");
                    inner.events.publish(BusEvent::RecoveryFailed {
                        reason: err.to_string(),
                    });
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_without_a_route_key_fails_synchronously() {
        let bus = BunnyBus::default();

        let result = bus.publish(&json!({"name": "bunnybus"}), None).await;

        assert_eq!(result.unwrap_err(), BusError::NoRouteKey);
        // the failure happened before any connection descriptor was created
        assert!(!bus.connections().contains(DEFAULT_CONNECTION_NAME));
    }

    #[tokio::test]
    async fn subscribe_on_a_blocked_queue_is_refused() {
        let bus = BunnyBus::default();
        assert!(bus.block("orders"));

        let result = bus.subscribe("orders", Handlers::new()).await;

        assert_eq!(
            result.unwrap_err(),
            BusError::SubscriptionBlocked("orders".to_owned())
        );

        assert!(bus.unblock("orders"));
    }

    #[tokio::test]
    async fn subscribe_against_a_tagged_subscription_is_refused() {
        let bus = BunnyBus::default();
        bus.subscriptions()
            .create("orders", Handlers::new(), SubscriptionOptions::default());
        bus.subscriptions().tag("orders", "tag-1");

        let result = bus.subscribe("orders", Handlers::new()).await;

        assert_eq!(
            result.unwrap_err(),
            BusError::SubscriptionExist("orders".to_owned())
        );
    }

    #[tokio::test]
    async fn resubscribing_refreshes_a_cleared_descriptor() {
        use crate::config::ConnectionOptions;
        use crate::handler::handler_fn;

        // unreachable broker so the subscribe attempt fails fast after the
        // registry was updated
        let bus = BunnyBus::new(BusConfig {
            connection: ConnectionOptions {
                server: "127.0.0.1".to_owned(),
                port: 1,
                connection_retry_count: 0,
                retry_delay_ms: 10,
                ..ConnectionOptions::default()
            },
            ..BusConfig::default()
        });

        // descriptor without a tag, as left behind by an unsubscribe
        bus.subscriptions()
            .create("orders", Handlers::new(), SubscriptionOptions::default());

        let mut handlers = Handlers::new();
        handlers.insert(
            "order.created".to_owned(),
            handler_fn(|_message, ops| Box::pin(async move { ops.ack().await })),
        );
        let _ = bus
            .subscribe_with(SubscribeRequest {
                queue: "orders".to_owned(),
                handlers,
                options: SubscriptionOptions {
                    max_retry_count: Some(9),
                    ..SubscriptionOptions::default()
                },
            })
            .await;

        // the stale descriptor was replaced even though the broker was down
        let stored = bus.subscriptions().get("orders").unwrap();
        assert_eq!(stored.handlers.len(), 1);
        assert!(stored.handlers.contains_key("order.created"));
        assert_eq!(stored.options.max_retry_count, Some(9));
    }

    #[tokio::test]
    async fn unsubscribe_without_a_subscription_is_a_noop() {
        let bus = BunnyBus::default();

        assert_eq!(bus.unsubscribe("missing").await, Ok(()));
    }

    #[tokio::test]
    async fn stop_on_an_idle_bus_succeeds() {
        let bus = BunnyBus::default();

        assert_eq!(bus.stop().await, Ok(()));
        assert_eq!(bus.dispatcher().queue_count(), 0);
    }

    #[test]
    fn well_known_names_follow_the_convention() {
        assert_eq!(queue_channel_name("orders"), "subscribe:orders");
        assert_eq!(error_queue_name("orders"), "orders_error");
    }
}
