// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handlers and Delivery Resolution
//!
//! Applications subscribe with a mapping from routing pattern to
//! [`EventHandler`]. Each consumed message reaches its handler together with a
//! [`MessageOps`] capability object through which the delivery is resolved:
//! exactly one of `ack`, `reject` or `requeue` completes per delivery. A
//! handler that returns an error without resolving has the delivery rejected
//! to the error queue on its behalf.

use crate::{
    errors::BusError,
    events::{EventBus, LogLevel},
    message::MessageHeaders,
    publisher,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{options::BasicAckOptions, Channel};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
};
use tracing::{error, warn};

/// A message as delivered to a handler: decoded payload plus envelope.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    /// Queue the message was consumed from
    pub queue: String,
    /// Resolved event key of the message
    pub route_key: String,
    /// Decoded JSON payload
    pub payload: Value,
    /// Envelope headers (transaction id, retry accounting, user headers)
    pub headers: MessageHeaders,
    /// Broker redelivery flag
    pub redelivered: bool,
}

/// Handles messages consumed from a subscribed queue.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Processes one message. The delivery should be resolved through `ops`;
    /// returning an error without resolving rejects it to the error queue.
    async fn handle(&self, message: ConsumedMessage, ops: MessageOps) -> Result<(), BusError>;
}

/// Routing pattern to handler mapping registered at subscribe time.
pub type Handlers = HashMap<String, Arc<dyn EventHandler>>;

/// Adapter turning a closure into an [`EventHandler`].
pub struct FnHandler<F> {
    delegate: F,
}

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(ConsumedMessage, MessageOps) -> BoxFuture<'static, Result<(), BusError>> + Send + Sync,
{
    async fn handle(&self, message: ConsumedMessage, ops: MessageOps) -> Result<(), BusError> {
        (self.delegate)(message, ops).await
    }
}

/// Wraps a closure as a shareable [`EventHandler`].
pub fn handler_fn<F>(delegate: F) -> Arc<dyn EventHandler>
where
    F: Fn(ConsumedMessage, MessageOps) -> BoxFuture<'static, Result<(), BusError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnHandler { delegate })
}

/// Re-resolves a live channel when the one a delivery arrived on has died
/// between receive and resolution.
pub(crate) type ChannelProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Channel, BusError>> + Send + Sync>;

/// Single-use resolution capability handed to a handler.
///
/// Each method consumes the capability; the delivery can therefore be
/// resolved at most once from handler code.
pub struct MessageOps {
    shared: Arc<OpsShared>,
}

impl MessageOps {
    pub(crate) fn new(shared: Arc<OpsShared>) -> Self {
        Self { shared }
    }

    /// Acknowledges the delivery, removing it from the queue.
    pub async fn ack(self) -> Result<(), BusError> {
        self.shared.ack().await
    }

    /// Routes the message to the error queue with `erroredAt` and the reason
    /// stamped into its headers, then acknowledges the original delivery.
    pub async fn reject(self, reason: Option<&str>) -> Result<(), BusError> {
        self.shared.reject(reason).await
    }

    /// Republishes the message to its queue with `retryCount` incremented and
    /// `requeuedAt` stamped, then acknowledges the original delivery. Past the
    /// configured retry cap this behaves as a reject.
    pub async fn requeue(self) -> Result<(), BusError> {
        self.shared.requeue().await
    }
}

/// Shared delivery-resolution state.
///
/// The consume pipeline keeps a second handle so it can reject deliveries a
/// failing handler left unresolved.
pub(crate) struct OpsShared {
    pub(crate) channel: Channel,
    pub(crate) reopen: ChannelProvider,
    pub(crate) delivery_tag: u64,
    pub(crate) queue: String,
    pub(crate) error_queue: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) headers: MessageHeaders,
    pub(crate) auto_ack: bool,
    pub(crate) max_retry_count: Option<u32>,
    pub(crate) resolved: AtomicBool,
    pub(crate) events: EventBus,
}

impl OpsShared {
    fn take_resolution(&self) -> Result<(), BusError> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Err(BusError::DeliveryResolved);
        }
        Ok(())
    }

    pub(crate) async fn ack(&self) -> Result<(), BusError> {
        self.take_resolution()?;
        self.ack_original().await
    }

    pub(crate) async fn reject(&self, reason: Option<&str>) -> Result<(), BusError> {
        self.take_resolution()?;
        self.route_to_error_queue(reason).await
    }

    pub(crate) async fn requeue(&self) -> Result<(), BusError> {
        self.take_resolution()?;

        if let Some(max) = self.max_retry_count {
            if self.headers.retry_count >= max {
                warn!(
                    queue = self.queue,
                    transaction_id = self.headers.transaction_id,
                    retry_count = self.headers.retry_count,
                    "retry cap reached, routing to error queue"
                );
                return self.route_to_error_queue(Some("Exceeded max retry count")).await;
            }
        }

        let mut headers = self.headers.clone();
        headers.stamp_requeued();

        let channel = self.publish_channel().await?;
        publisher::publish_message(&channel, "", &self.queue, &self.payload, &headers).await?;

        self.ack_original().await
    }

    /// Rejects the delivery unless the handler already resolved it. Used by
    /// the consume pipeline after a handler error; never fails a second
    /// resolution.
    pub(crate) async fn reject_if_unresolved(&self, reason: Option<&str>) -> Result<(), BusError> {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.route_to_error_queue(reason).await
    }

    async fn route_to_error_queue(&self, reason: Option<&str>) -> Result<(), BusError> {
        let mut headers = self.headers.clone();
        headers.stamp_errored(reason);

        self.events.log(
            LogLevel::Warn,
            format!(
                "rejecting message {} to `{}`",
                headers.transaction_id, self.error_queue
            ),
        );

        let channel = self.publish_channel().await?;
        publisher::publish_message(&channel, "", &self.error_queue, &self.payload, &headers)
            .await?;

        self.ack_original().await
    }

    /// Channel to republish on; falls back to reopening when the delivery
    /// channel died between receive and resolution.
    async fn publish_channel(&self) -> Result<Channel, BusError> {
        if self.channel.status().connected() {
            return Ok(self.channel.clone());
        }
        (self.reopen)().await
    }

    /// Acks the original delivery tag on its own channel. Delivery tags are
    /// channel-scoped: when that channel is gone the broker will redeliver
    /// instead, which at-least-once semantics tolerate.
    async fn ack_original(&self) -> Result<(), BusError> {
        if self.auto_ack {
            return Ok(());
        }

        if !self.channel.status().connected() {
            warn!(
                queue = self.queue,
                delivery_tag = self.delivery_tag,
                "delivery channel is gone, skipping ack and relying on redelivery"
            );
            return Ok(());
        }

        match self
            .channel
            .basic_ack(self.delivery_tag, BasicAckOptions { multiple: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error whiling ack msg");
                Err(BusError::AckMessageError)
            }
            _ => Ok(()),
        }
    }
}
