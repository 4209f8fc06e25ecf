// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Arrival Pipeline
//!
//! Turns broker deliveries into handler invocations:
//!
//! 1. decode the JSON payload; undecodable messages go to the error queue
//!    with the reason recorded,
//! 2. resolve the handler by route key (exact match first, then the best
//!    wildcard pattern); unroutable messages go to the error queue,
//! 3. enqueue the invocation into the partition dispatcher so handlers for
//!    one partition never overlap,
//! 4. invoke the handler with a single-use resolution capability; a handler
//!    error rejects the delivery on its behalf.
//!
//! A consumer whose stream ends while its subscription is still tagged lost
//! its channel; the pipeline reports that to the recovery coordinator.

use crate::{
    channel::ChannelManager,
    dispatcher::SerialDispatcher,
    errors::BusError,
    events::{EventBus, RecoverySignal},
    handler::{ChannelProvider, ConsumedMessage, Handlers, MessageOps, OpsShared},
    message::{self, MessageHeaders, BUS_VERSION},
    otel, routing,
    subscription::SubscriptionManager,
};
use futures_util::StreamExt;
use lapin::{message::Delivery, Channel, Consumer};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{
    borrow::Cow,
    sync::{atomic::AtomicBool, Arc},
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

/// Everything a consumer loop needs to process deliveries for one queue.
pub(crate) struct ConsumeContext {
    pub(crate) queue: String,
    pub(crate) channel_name: String,
    pub(crate) error_queue: String,
    pub(crate) handlers: Handlers,
    pub(crate) auto_ack: bool,
    pub(crate) max_retry_count: Option<u32>,
    pub(crate) validate_publisher: bool,
    pub(crate) events: EventBus,
    pub(crate) dispatcher: Arc<SerialDispatcher>,
    pub(crate) channels: Arc<ChannelManager>,
    pub(crate) subscriptions: Arc<SubscriptionManager>,
    pub(crate) recovery: UnboundedSender<RecoverySignal>,
}

/// Spawns the consume loop for a registered broker consumer.
pub(crate) fn spawn_consumer(ctx: Arc<ConsumeContext>, mut consumer: Consumer, channel: Channel) {
    tokio::spawn(async move {
        while let Some(result) = consumer.next().await {
            match result {
                Ok(delivery) => {
                    if let Err(err) = handle_delivery(&ctx, &channel, delivery).await {
                        error!(error = err.to_string(), queue = ctx.queue, "error consume msg");
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), queue = ctx.queue, "errors consume msg")
                }
            }
        }

        // The stream only ends when the consumer was cancelled or the channel
        // died. A still-tagged subscription means the latter.
        if ctx.subscriptions.contains(&ctx.queue, true) {
            warn!(
                queue = ctx.queue,
                channel = ctx.channel_name,
                "consumer stream ended unexpectedly, requesting recovery"
            );
            let _ = ctx
                .recovery
                .send(RecoverySignal::Channel(ctx.channel_name.clone()));
        }
    });
}

async fn handle_delivery(
    ctx: &Arc<ConsumeContext>,
    channel: &Channel,
    delivery: Delivery,
) -> Result<(), BusError> {
    let headers = MessageHeaders::from_field_table(delivery.properties.headers().as_ref());
    let ops_shared = build_ops(ctx, channel, &delivery, headers.clone());

    let payload = match message::decode_payload(&delivery.data) {
        Ok(value) => value,
        Err(_) => {
            warn!(queue = ctx.queue, "received a payload that is not valid JSON");
            return ops_shared
                .reject_if_unresolved(Some("Could not decode JSON"))
                .await;
        }
    };

    // prefer the envelope's route key; foreign messages only have the AMQP one
    let route_key = if headers.route_key.is_empty() {
        delivery.routing_key.as_str().to_owned()
    } else {
        headers.route_key.clone()
    };

    if ctx.validate_publisher && !compatible_publisher(&headers.bus_version) {
        warn!(
            queue = ctx.queue,
            publisher_version = headers.bus_version,
            "message published by an incompatible library version"
        );
        return ops_shared
            .reject_if_unresolved(Some("Invalid bunnyBus publisher"))
            .await;
    }

    let Some(handler) = routing::resolve_handler(&ctx.handlers, &route_key) else {
        debug!(route_key, queue = ctx.queue, "no handler found, routing to error queue");
        return ops_shared.reject_if_unresolved(Some("No handler found")).await;
    };

    let consumed = ConsumedMessage {
        queue: ctx.queue.clone(),
        route_key: route_key.clone(),
        payload: payload.clone(),
        headers,
        redelivered: delivery.redelivered,
    };

    let delegate = Box::pin(async move {
        let tracer = global::tracer("amqp consumer");
        let (_otel_ctx, mut span) = otel::consumer_span(&consumed.headers, &tracer, &route_key);

        let ops = MessageOps::new(ops_shared.clone());
        match handler.handle(consumed, ops).await {
            Ok(_) => {
                span.set_status(Status::Ok);
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(reason.clone()),
                });

                // an unresolved failed delivery is an implicit reject
                ops_shared.reject_if_unresolved(Some(&reason)).await?;
                Err(BusError::HandlerError(reason))
            }
        }
    });

    ctx.dispatcher.push(&ctx.queue, Some(&payload), delegate);

    Ok(())
}

fn build_ops(
    ctx: &Arc<ConsumeContext>,
    channel: &Channel,
    delivery: &Delivery,
    headers: MessageHeaders,
) -> Arc<OpsShared> {
    let channels = ctx.channels.clone();
    let channel_name = ctx.channel_name.clone();

    let reopen: ChannelProvider = Arc::new(move || {
        let channels = channels.clone();
        let channel_name = channel_name.clone();

        Box::pin(async move {
            let context = channels
                .get(&channel_name)
                .ok_or_else(|| BusError::ChannelNotFound(channel_name.clone()))?;
            let connection_name = context.connection_name().to_owned();
            let options = context.options().clone();

            let context = channels
                .create(&channel_name, &connection_name, options, None)
                .await?;
            context
                .channel()
                .await
                .ok_or_else(|| BusError::ChannelError("channel handle is absent".to_owned()))
        })
    });

    Arc::new(OpsShared {
        channel: channel.clone(),
        reopen,
        delivery_tag: delivery.delivery_tag,
        queue: ctx.queue.clone(),
        error_queue: ctx.error_queue.clone(),
        payload: delivery.data.clone(),
        headers,
        auto_ack: ctx.auto_ack,
        max_retry_count: ctx.max_retry_count,
        resolved: AtomicBool::new(false),
        events: ctx.events.clone(),
    })
}

/// A publisher is compatible when its version header shares our major
/// version. Foreign messages without the header never validate.
fn compatible_publisher(publisher_version: &str) -> bool {
    let major = |version: &str| version.split('.').next().map(str::to_owned);
    !publisher_version.is_empty() && major(publisher_version) == major(BUS_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publisher_validation_requires_a_matching_major_version() {
        assert!(compatible_publisher(BUS_VERSION));

        let same_major = format!(
            "{}.99.99",
            BUS_VERSION.split('.').next().unwrap()
        );
        assert!(compatible_publisher(&same_major));

        assert!(!compatible_publisher(""));
        assert!(!compatible_publisher("999.0.0"));
    }
}
