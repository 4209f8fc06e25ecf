// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Bus
//!
//! This module provides the error taxonomy for all bus operations. The
//! `BusError` enum covers configuration errors (surfaced synchronously to the
//! caller), transport errors (recovered underneath by the auto-recovery
//! coordinator), subscription errors, payload codec errors, and per-message
//! acknowledgement errors.

use thiserror::Error;

/// Represents errors that can occur during bus operations.
///
/// Configuration and subscription errors propagate to the caller of the public
/// method that raised them. Transport errors are recoverable and feed the
/// recovery coordinator. Per-message errors never kill a consumer.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// `create` was called for an unknown connection without options
    #[error("Expected connectionOptions to be supplied")]
    MissingConnectionOptions,

    /// Connection creation failed after exhausting the configured retries
    #[error("Exceeded maximum attempts of retries")]
    ConnectionRetry,

    /// Error establishing a connection to the broker
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// No channel is currently registered under the given name
    #[error("no channel registered under `{0}`")]
    ChannelNotFound(String),

    /// The message carries no routing key and none was supplied
    #[error("no route key was found in the message or options")]
    NoRouteKey,

    /// An active subscription already exists for the queue
    #[error("subscription already exists for queue `{0}`")]
    SubscriptionExist(String),

    /// The queue is blocked and refuses new subscription attempts
    #[error("subscription for queue `{0}` is blocked")]
    SubscriptionBlocked(String),

    /// No handler matched the message's route key
    #[error("no handler found for route key `{0}`")]
    NoHandlerFound(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindQueueError(String, String),

    /// Error deleting a queue or exchange
    #[error("failure to delete `{0}`")]
    DeleteError(String),

    /// Error purging a queue
    #[error("failure to purge queue `{0}`")]
    PurgeError(String),

    /// Error registering or cancelling a consumer
    #[error("failure to consume from queue `{0}`")]
    ConsumeError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishError,

    /// Error encoding a payload to JSON
    #[error("failure to encode payload")]
    EncodePayloadError,

    /// Payload bytes were not valid JSON
    #[error("Could not decode JSON")]
    DecodePayloadError,

    /// Error acknowledging a delivery
    #[error("failure to ack message")]
    AckMessageError,

    /// The delivery was already resolved by ack, reject or requeue
    #[error("delivery was already resolved")]
    DeliveryResolved,

    /// A handler returned an error for a consumed message
    #[error("handler failed: {0}")]
    HandlerError(String),

    /// Recovery gave up after exhausting its retries
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_messages_are_stable() {
        assert_eq!(
            BusError::MissingConnectionOptions.to_string(),
            "Expected connectionOptions to be supplied"
        );
        assert_eq!(
            BusError::ConnectionRetry.to_string(),
            "Exceeded maximum attempts of retries"
        );
        assert_eq!(BusError::DecodePayloadError.to_string(), "Could not decode JSON");
    }

    #[test]
    fn subscription_errors_carry_the_queue_name() {
        assert_eq!(
            BusError::SubscriptionExist("orders".to_owned()).to_string(),
            "subscription already exists for queue `orders`"
        );
        assert_eq!(
            BusError::SubscriptionBlocked("orders".to_owned()).to_string(),
            "subscription for queue `orders` is blocked"
        );
    }
}
