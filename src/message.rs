// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope and Header Accounting
//!
//! Every message the bus touches carries a header mapping used for tracing,
//! retry accounting and error-queue routing. This module owns that envelope:
//! building fresh headers on publish, converting them to and from the AMQP
//! field table, stamping requeue/reject metadata, and the JSON payload codec.
//!
//! The `transactionId` and `createdAt` headers are stable across requeues;
//! `retryCount` increments on every requeue; `requeuedAt` and `erroredAt` are
//! stamped by the requeue and reject paths respectively.

use crate::errors::BusError;
use chrono::{SecondsFormat, Utc};
use lapin::types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type stamped on every published message
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Library version written into the publisher-version header
pub const BUS_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HEADER_TRANSACTION_ID: &str = "transactionId";
pub const HEADER_CREATED_AT: &str = "createdAt";
pub const HEADER_BUS_VERSION: &str = "bunnyBus";
pub const HEADER_SOURCE: &str = "source";
pub const HEADER_ROUTE_KEY: &str = "routeKey";
pub const HEADER_RETRY_COUNT: &str = "retryCount";
pub const HEADER_REQUEUED_AT: &str = "requeuedAt";
pub const HEADER_ERRORED_AT: &str = "erroredAt";
pub const HEADER_REASON: &str = "reason";

/// The header mapping carried with every message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeaders {
    /// Opaque per-message identifier, stable across requeues
    pub transaction_id: String,
    /// ISO-8601 creation timestamp, stable across requeues
    pub created_at: String,
    /// Version of the library that published the message
    pub bus_version: String,
    /// Optional producer tag
    pub source: Option<String>,
    /// The event key the message was routed with
    pub route_key: String,
    /// Number of requeues this message has been through
    pub retry_count: u32,
    /// ISO-8601 timestamp stamped by the requeue path
    pub requeued_at: Option<String>,
    /// ISO-8601 timestamp stamped by the reject path
    pub errored_at: Option<String>,
    /// Reason recorded by the reject path
    pub reason: Option<String>,
    /// Arbitrary user headers, carried through verbatim
    pub custom: BTreeMap<String, Value>,
}

impl MessageHeaders {
    /// Builds fresh headers for an outgoing message.
    pub fn new(route_key: &str, source: Option<&str>) -> Self {
        Self {
            transaction_id: create_transaction_id(),
            created_at: now_iso8601(),
            bus_version: BUS_VERSION.to_owned(),
            source: source.map(str::to_owned),
            route_key: route_key.to_owned(),
            retry_count: 0,
            requeued_at: None,
            errored_at: None,
            reason: None,
            custom: BTreeMap::new(),
        }
    }

    /// Marks the headers as requeued: bumps `retryCount`, stamps `requeuedAt`.
    /// `transactionId` and `createdAt` are left untouched.
    pub fn stamp_requeued(&mut self) {
        self.retry_count += 1;
        self.requeued_at = Some(now_iso8601());
    }

    /// Marks the headers as errored: stamps `erroredAt` and records the reason.
    pub fn stamp_errored(&mut self, reason: Option<&str>) {
        self.errored_at = Some(now_iso8601());
        if let Some(reason) = reason {
            self.reason = Some(reason.to_owned());
        }
    }

    /// Converts the headers into the AMQP field-table entry map.
    pub fn to_btree(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut btree = BTreeMap::new();

        insert_string(&mut btree, HEADER_TRANSACTION_ID, &self.transaction_id);
        insert_string(&mut btree, HEADER_CREATED_AT, &self.created_at);
        insert_string(&mut btree, HEADER_BUS_VERSION, &self.bus_version);
        insert_string(&mut btree, HEADER_ROUTE_KEY, &self.route_key);
        btree.insert(
            ShortString::from(HEADER_RETRY_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(self.retry_count as i64)),
        );

        if let Some(source) = &self.source {
            insert_string(&mut btree, HEADER_SOURCE, source);
        }
        if let Some(requeued_at) = &self.requeued_at {
            insert_string(&mut btree, HEADER_REQUEUED_AT, requeued_at);
        }
        if let Some(errored_at) = &self.errored_at {
            insert_string(&mut btree, HEADER_ERRORED_AT, errored_at);
        }
        if let Some(reason) = &self.reason {
            insert_string(&mut btree, HEADER_REASON, reason);
        }

        for (key, value) in &self.custom {
            btree.insert(ShortString::from(key.as_str()), json_to_amqp(value));
        }

        btree
    }

    /// Converts the headers into a ready-to-publish field table.
    pub fn to_field_table(&self) -> FieldTable {
        FieldTable::from(self.to_btree())
    }

    /// Reads headers back from a delivery's field table.
    ///
    /// Messages published by foreign producers may be missing the envelope
    /// entirely; absent identity fields are re-minted so downstream accounting
    /// still works, and everything unrecognized lands in `custom`.
    pub fn from_field_table(table: Option<&FieldTable>) -> Self {
        let empty = FieldTable::default();
        let table = table.unwrap_or(&empty);
        let inner = table.inner();

        let mut headers = Self {
            transaction_id: read_string(inner, HEADER_TRANSACTION_ID)
                .unwrap_or_else(create_transaction_id),
            created_at: read_string(inner, HEADER_CREATED_AT).unwrap_or_else(now_iso8601),
            bus_version: read_string(inner, HEADER_BUS_VERSION).unwrap_or_default(),
            source: read_string(inner, HEADER_SOURCE),
            route_key: read_string(inner, HEADER_ROUTE_KEY).unwrap_or_default(),
            retry_count: read_retry_count(inner),
            requeued_at: read_string(inner, HEADER_REQUEUED_AT),
            errored_at: read_string(inner, HEADER_ERRORED_AT),
            reason: read_string(inner, HEADER_REASON),
            custom: BTreeMap::new(),
        };

        const KNOWN: [&str; 9] = [
            HEADER_TRANSACTION_ID,
            HEADER_CREATED_AT,
            HEADER_BUS_VERSION,
            HEADER_SOURCE,
            HEADER_ROUTE_KEY,
            HEADER_RETRY_COUNT,
            HEADER_REQUEUED_AT,
            HEADER_ERRORED_AT,
            HEADER_REASON,
        ];

        for (key, value) in inner {
            if KNOWN.contains(&key.as_str()) {
                continue;
            }
            headers
                .custom
                .insert(key.as_str().to_owned(), amqp_to_json(value));
        }

        headers
    }
}

/// Generates an opaque 40-character transaction id.
pub fn create_transaction_id() -> String {
    let mut id = String::with_capacity(64);
    id.push_str(&Uuid::new_v4().simple().to_string());
    id.push_str(&Uuid::new_v4().simple().to_string());
    id.truncate(40);
    id
}

/// Current UTC time as an ISO-8601 string with millisecond precision.
pub fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Encodes a message payload as UTF-8 JSON.
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Vec<u8>, BusError> {
    serde_json::to_vec(message).map_err(|_| BusError::EncodePayloadError)
}

/// Decodes UTF-8 JSON payload bytes.
pub fn decode_payload(data: &[u8]) -> Result<Value, BusError> {
    serde_json::from_slice(data).map_err(|_| BusError::DecodePayloadError)
}

fn insert_string(btree: &mut BTreeMap<ShortString, AMQPValue>, key: &str, value: &str) {
    btree.insert(
        ShortString::from(key),
        AMQPValue::LongString(LongString::from(value)),
    );
}

fn read_string(inner: &BTreeMap<ShortString, AMQPValue>, key: &str) -> Option<String> {
    match inner.get(key) {
        Some(AMQPValue::LongString(value)) => {
            std::str::from_utf8(value.as_bytes()).ok().map(str::to_owned)
        }
        Some(AMQPValue::ShortString(value)) => Some(value.as_str().to_owned()),
        _ => None,
    }
}

fn read_retry_count(inner: &BTreeMap<ShortString, AMQPValue>) -> u32 {
    match inner.get(HEADER_RETRY_COUNT) {
        Some(value) => match value.as_long_long_int() {
            Some(count) if count > 0 => count as u32,
            Some(_) => 0,
            None => read_string(inner, HEADER_RETRY_COUNT)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
        },
        None => 0,
    }
}

fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Bool(flag) => AMQPValue::Boolean(*flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                AMQPValue::LongLongInt(LongLongInt::from(int))
            } else {
                AMQPValue::Double(number.as_f64().unwrap_or_default())
            }
        }
        Value::String(text) => AMQPValue::LongString(LongString::from(text.as_str())),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(flag) => Value::Bool(*flag),
        AMQPValue::LongLongInt(int) => Value::from(*int),
        AMQPValue::LongInt(int) => Value::from(*int),
        AMQPValue::Double(float) => Value::from(*float),
        AMQPValue::LongString(text) => match std::str::from_utf8(text.as_bytes()) {
            Ok(text) => Value::from(text),
            Err(_) => Value::Null,
        },
        AMQPValue::ShortString(text) => Value::from(text.as_str()),
        other => Value::from(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_are_opaque_and_forty_chars() {
        let first = create_transaction_id();
        let second = create_transaction_id();

        assert_eq!(first.len(), 40);
        assert_eq!(second.len(), 40);
        assert_ne!(first, second);
    }

    #[test]
    fn fresh_headers_carry_identity_and_zero_retries() {
        let headers = MessageHeaders::new("abc.helloworld.xyz", Some("test"));

        assert_eq!(headers.route_key, "abc.helloworld.xyz");
        assert_eq!(headers.source.as_deref(), Some("test"));
        assert_eq!(headers.retry_count, 0);
        assert_eq!(headers.bus_version, BUS_VERSION);
        assert!(headers.requeued_at.is_none());
        assert!(headers.errored_at.is_none());
    }

    #[test]
    fn headers_round_trip_through_the_field_table() {
        let mut headers = MessageHeaders::new("a", Some("test"));
        headers.custom.insert("tenant".to_owned(), Value::from("acme"));
        headers.custom.insert("attempt".to_owned(), Value::from(3));

        let restored = MessageHeaders::from_field_table(Some(&headers.to_field_table()));

        assert_eq!(restored, headers);
    }

    #[test]
    fn requeue_stamp_preserves_identity_and_bumps_retry_count() {
        let mut headers = MessageHeaders::new("a", None);
        let transaction_id = headers.transaction_id.clone();
        let created_at = headers.created_at.clone();

        headers.stamp_requeued();

        assert_eq!(headers.transaction_id, transaction_id);
        assert_eq!(headers.created_at, created_at);
        assert_eq!(headers.retry_count, 1);
        assert!(headers.requeued_at.is_some());
    }

    #[test]
    fn errored_stamp_records_reason() {
        let mut headers = MessageHeaders::new("a", None);

        headers.stamp_errored(Some("No handler found"));

        assert!(headers.errored_at.is_some());
        assert_eq!(headers.reason.as_deref(), Some("No handler found"));
    }

    #[test]
    fn foreign_messages_get_identity_minted() {
        let headers = MessageHeaders::from_field_table(None);

        assert_eq!(headers.transaction_id.len(), 40);
        assert!(!headers.created_at.is_empty());
        assert_eq!(headers.retry_count, 0);
        assert_eq!(headers.route_key, "");
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert_eq!(
            decode_payload(b"{not json"),
            Err(BusError::DecodePayloadError)
        );
    }

    #[test]
    fn payload_codec_round_trips() {
        let payload = serde_json::json!({"event": "a", "name": "bunnybus"});
        let bytes = encode_payload(&payload).unwrap();

        assert_eq!(decode_payload(&bytes).unwrap(), payload);
    }
}
