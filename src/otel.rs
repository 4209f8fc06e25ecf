// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Carries OpenTelemetry trace context through the message envelope so
//! handler spans join the publisher's trace. Propagation keys travel as plain
//! string headers: on publish the current context is rendered into a string
//! map the publisher merges into the wire headers, and on consume the keys
//! are read back out of the envelope's user headers. Because the propagated
//! keys ride in [`MessageHeaders::custom`], requeued and rejected messages
//! keep their original trace context.

use crate::message::MessageHeaders;
use opentelemetry::{
    global::{BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;

/// Injection target for outgoing trace headers.
struct TraceHeaders<'a>(&'a mut BTreeMap<String, String>);

impl Injector for TraceHeaders<'_> {
    fn set(&mut self, key: &str, value: String) {
        // AMQP header names are case-insensitive; normalize on the way out
        self.0.insert(key.to_ascii_lowercase(), value);
    }
}

/// Extraction source over trace headers recovered from the envelope.
struct TraceHeadersRef<'a>(&'a BTreeMap<String, String>);

impl Extractor for TraceHeadersRef<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }
}

/// Renders the current trace context as propagation headers.
pub(crate) fn current_trace_headers() -> BTreeMap<String, String> {
    let mut carrier = BTreeMap::new();

    opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&Context::current(), &mut TraceHeaders(&mut carrier))
    });

    carrier
}

/// Opens a consumer span for a delivery, continuing the publisher's trace
/// when propagation headers arrived with the envelope.
pub(crate) fn consumer_span(
    headers: &MessageHeaders,
    tracer: &BoxedTracer,
    route_key: &str,
) -> (Context, BoxedSpan) {
    let carrier: BTreeMap<String, String> = headers
        .custom
        .iter()
        .filter_map(|(key, value)| Some((key.clone(), value.as_str()?.to_owned())))
        .collect();

    let ctx = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&TraceHeadersRef(&carrier))
    });

    let span = tracer
        .span_builder(route_key.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
