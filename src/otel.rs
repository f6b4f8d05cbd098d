// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! Trace context travels in AMQP message headers. The publisher injects the
//! caller's context; the dispatcher extracts it and opens a consumer span
//! around each handler invocation.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context, KeyValue,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Adapts an AMQP header map to the OpenTelemetry propagation traits.
pub(crate) struct RabbitMQTracePropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> RabbitMQTracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for RabbitMQTracePropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for RabbitMQTracePropagator<'_> {
    /// Only `LongString` headers can carry trace context; anything else
    /// reads as absent.
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Extracts the remote context carried by a delivery.
pub fn extract_context(props: &AMQPProperties) -> Context {
    let mut headers = props
        .headers()
        .as_ref()
        .map(|table| table.inner().clone())
        .unwrap_or_default();

    global::get_text_map_propagator(|propagator| {
        propagator.extract(&RabbitMQTracePropagator::new(&mut headers))
    })
}

/// Creates the consumer span for one delivery.
///
/// # Parameters
/// * `props` - Delivery properties carrying the trace headers
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Span name, the message type when present
///
/// # Returns
/// The extracted parent context and the started span
pub fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> (Context, BoxedSpan) {
    let ctx = extract_context(props);

    let mut attributes = vec![KeyValue::new("messaging.system", "rabbitmq")];
    if let Some(id) = props.message_id() {
        attributes.push(KeyValue::new("messaging.message.id", id.as_str().to_owned()));
    }

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .with_attributes(attributes)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
