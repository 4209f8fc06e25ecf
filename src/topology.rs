// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Primitives
//!
//! Declare, bind, check, purge and delete operations over exchanges and
//! queues. The subscribe path asserts the global exchange, the primary queue
//! and its `<queue>_error` sidecar through these functions; the facade's
//! administrative passthroughs expose them directly; recovery replays them
//! when re-establishing a channel.

use crate::{
    errors::BusError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Header field specifying message TTL on a queue
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Header field specifying maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";

/// Counters reported by a passive queue declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Declares an exchange from its definition.
pub async fn assert_exchange(
    channel: &Channel,
    def: &ExchangeDefinition,
) -> Result<(), BusError> {
    debug!("creating exchange: {}", def.name);

    match channel
        .exchange_declare(
            &def.name,
            def.kind.clone().into(),
            ExchangeDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                auto_delete: def.auto_delete,
                internal: def.internal,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            Err(BusError::DeclareExchangeError(def.name.clone()))
        }
        _ => Ok(()),
    }
}

/// Declares a queue from its definition. Returns the number of messages the
/// broker reports sitting in it.
pub async fn assert_queue(
    channel: &Channel,
    def: &QueueDefinition,
) -> Result<u32, BusError> {
    debug!("creating queue: {}", def.name);

    let mut queue_args = BTreeMap::new();

    if let Some(ttl) = def.ttl {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max_length) = def.max_length {
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max_length)),
        );
    }

    match channel
        .queue_declare(
            &def.name,
            QueueDeclareOptions {
                passive: def.passive,
                durable: def.durable,
                exclusive: def.exclusive,
                auto_delete: def.auto_delete,
                nowait: false,
            },
            FieldTable::from(queue_args),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            Err(BusError::DeclareQueueError(def.name.clone()))
        }
        Ok(queue) => {
            debug!("queue: {} was created", def.name);
            Ok(queue.message_count())
        }
    }
}

/// Binds a queue to an exchange under a routing pattern.
pub async fn bind_queue(channel: &Channel, binding: &QueueBinding) -> Result<(), BusError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(BusError::BindQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ))
        }
        _ => Ok(()),
    }
}

/// Deletes a queue. Returns the number of messages dropped with it.
pub async fn delete_queue(
    channel: &Channel,
    name: &str,
    if_unused: bool,
    if_empty: bool,
) -> Result<u32, BusError> {
    match channel
        .queue_delete(
            name,
            QueueDeleteOptions {
                if_unused,
                if_empty,
                nowait: false,
            },
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to delete the queue");
            Err(BusError::DeleteError(name.to_owned()))
        }
        Ok(count) => Ok(count),
    }
}

/// Purges a queue. Returns the number of messages removed.
pub async fn purge_queue(channel: &Channel, name: &str) -> Result<u32, BusError> {
    match channel
        .queue_purge(name, QueuePurgeOptions { nowait: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to purge the queue");
            Err(BusError::PurgeError(name.to_owned()))
        }
        Ok(count) => Ok(count),
    }
}

/// Deletes an exchange.
pub async fn delete_exchange(
    channel: &Channel,
    name: &str,
    if_unused: bool,
) -> Result<(), BusError> {
    match channel
        .exchange_delete(
            name,
            ExchangeDeleteOptions {
                if_unused,
                nowait: false,
            },
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "error to delete the exchange");
            Err(BusError::DeleteError(name.to_owned()))
        }
        _ => Ok(()),
    }
}

/// Passively checks a queue, failing when it does not exist. Returns its
/// message and consumer counts.
pub async fn check_queue(channel: &Channel, name: &str) -> Result<QueueStats, BusError> {
    match channel
        .queue_declare(
            name,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "queue check failed");
            Err(BusError::DeclareQueueError(name.to_owned()))
        }
        Ok(queue) => Ok(QueueStats {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        }),
    }
}

/// Passively checks an exchange, failing when it does not exist.
pub async fn check_exchange(channel: &Channel, name: &str) -> Result<(), BusError> {
    match channel
        .exchange_declare(
            name,
            lapin::ExchangeKind::Topic,
            ExchangeDeclareOptions {
                passive: true,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "exchange check failed");
            Err(BusError::DeclareExchangeError(name.to_owned()))
        }
        _ => Ok(()),
    }
}
