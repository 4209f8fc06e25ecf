// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Publishing
//!
//! The single place messages leave through. Builds the AMQP properties every
//! outgoing message carries (JSON content type, persistent delivery, message
//! id, the envelope header table, propagated trace context) and performs the
//! `basic_publish`. Used by the facade's `publish`/`send`, by the requeue and
//! reject paths, and by recovery.

use crate::{errors::BusError, message, message::MessageHeaders, otel};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel,
};
use tracing::error;
use uuid::Uuid;

/// Messages survive broker restarts alongside the durable queues they sit in
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Publishes a payload with its envelope headers.
///
/// Routing follows plain AMQP semantics: a named exchange with a routing key
/// for topic routing, or the default exchange (`""`) with the queue name as
/// the key for direct-to-queue sends.
pub(crate) async fn publish_message(
    channel: &Channel,
    exchange: &str,
    routing_key: &str,
    payload: &[u8],
    headers: &MessageHeaders,
) -> Result<(), BusError> {
    let mut btree = headers.to_btree();
    for (key, value) in otel::current_trace_headers() {
        btree.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
    }

    match channel
        .basic_publish(
            exchange,
            routing_key,
            BasicPublishOptions {
                immediate: false,
                mandatory: false,
            },
            payload,
            BasicProperties::default()
                .with_content_type(ShortString::from(message::JSON_CONTENT_TYPE))
                .with_type(ShortString::from(headers.route_key.as_str()))
                .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
                .with_headers(FieldTable::from(btree)),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                exchange, routing_key, "error publishing message"
            );
            Err(BusError::PublishError)
        }
        _ => Ok(()),
    }
}
