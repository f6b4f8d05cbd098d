// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ exchanges.
//! Every publish borrows a channel from the [`ChannelPool`] for exactly one call
//! and gives it back afterwards, supporting OpenTelemetry tracing for distributed
//! request tracking.

use crate::{
    errors::AmqpError,
    message::{btree_map, HeaderValues, AMQP_HEADERS_RETRY_COUNT},
    otel::RabbitMQTracePropagator,
    pool::ChannelPool,
};
use async_trait::async_trait;
use lapin::{
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    /// Exchange name; empty for the default exchange.
    pub to: String,
    /// Routing key; with the default exchange this is the queue name.
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl PublishMessage {
    pub fn new(to: &str, key: &str, data: Vec<u8>) -> PublishMessage {
        PublishMessage {
            to: to.to_owned(),
            key: Some(key.to_owned()),
            data,
            ..Default::default()
        }
    }

    pub fn with_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn with_header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::default)
            .insert(key.to_owned(), value);
        self
    }
}

/// Producer surface exposed to application code.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes a message. Pool exhaustion and publish failures are returned
    /// to the caller and never retried internally.
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
///
/// This publisher sends messages to RabbitMQ exchanges, with support for
/// message headers, routing keys, and OpenTelemetry context propagation.
pub struct RabbitMQPublisher {
    pool: Arc<ChannelPool>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// # Parameters
    /// * `pool` - The pool publish channels are borrowed from
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance for thread-safe sharing
    pub fn new(pool: Arc<ChannelPool>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { pool })
    }

    fn properties(ctx: &Context, infos: &PublishMessage) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut RabbitMQTracePropagator::new(&mut btree))
        });

        if let Some(headers) = &infos.headers {
            btree_map(headers, &mut btree);
        }

        btree
            .entry(ShortString::from(AMQP_HEADERS_RETRY_COUNT))
            .or_insert(AMQPValue::LongLongInt(LongLongInt::from(0)));

        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_kind(ShortString::from(infos.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree))
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes a message to RabbitMQ.
    ///
    /// This method publishes a message to the specified exchange with the given
    /// routing key, message type, and payload. It also propagates OpenTelemetry
    /// trace context in the message headers for distributed tracing.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context for tracing
    /// * `infos` - Message details including payload, exchange, routing key, etc.
    ///
    /// # Returns
    /// Ok(()) on success, `ChannelAcquisitionError` when the pool is exhausted
    /// or `PublishingError` on failure
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let channel = self.pool.borrow().await?;

        let result = channel
            .basic_publish(
                &infos.to,
                infos.key.as_deref().unwrap_or_default(),
                &infos.data,
                Self::properties(ctx, infos),
            )
            .await;

        self.pool.return_channel(channel).await;

        match result {
            Err(err) => {
                error!(error = err.to_string(), exchange = %infos.to, "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => {
                debug!(exchange = %infos.to, "message published");
                Ok(())
            }
        }
    }
}
