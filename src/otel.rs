// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Extracts the trace context propagated in message headers and opens the
//! consumer span every delivery is processed in.

use crate::channel::Envelope;
use opentelemetry::{
    global::{self, BoxedSpan},
    propagation::Extractor,
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::collections::BTreeMap;

/// Name of the tracer used for consumer spans.
pub const TRACER_NAME: &str = "amqp consumer";

/// Reads trace context entries out of the string headers of a delivery.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(&key.to_lowercase())
            .map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates the span processing a delivery of `queue`.
///
/// The parent context is whatever the publisher injected in the headers, so
/// the handler's work shows up in the publisher's trace.
pub(crate) fn new_span(envelope: &Envelope, queue: &str) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(&envelope.headers))
    });

    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(format!("{} process", queue))
        .with_kind(SpanKind::Consumer)
        .with_attributes(vec![
            KeyValue::new("messaging.system", "rabbitmq"),
            KeyValue::new("messaging.operation.type", "process"),
            KeyValue::new("messaging.destination.name", envelope.exchange.clone()),
            KeyValue::new(
                "messaging.rabbitmq.destination.routing_key",
                envelope.routing_key.clone(),
            ),
            KeyValue::new(
                "messaging.rabbitmq.message.delivery_tag",
                envelope.delivery_tag as i64,
            ),
        ])
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extractor_is_case_insensitive() {
        let mut headers = BTreeMap::new();
        headers.insert("traceparent".to_owned(), "00-abc-def-01".to_owned());
        headers.insert("tracestate".to_owned(), "vendor=1".to_owned());

        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("TraceParent"), Some("00-abc-def-01"));
        assert_eq!(extractor.get("tracestate"), Some("vendor=1"));
        assert_eq!(extractor.get("baggage"), None);

        let mut keys = extractor.keys();
        keys.sort();
        assert_eq!(keys, vec!["traceparent", "tracestate"]);
    }
}
