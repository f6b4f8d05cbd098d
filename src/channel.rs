// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module defines the transport seam of the crate. The reliability
//! components talk to the broker only through the [`Connector`],
//! [`AmqpConnection`] and [`AmqpChannel`] traits; the `Lapin*` types bind
//! those traits to the `lapin` client.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries pushed by the broker for one consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<InboundDelivery, AmqpError>>;

/// A message delivered by the broker, detached from the client library.
#[derive(Debug, Clone, Default)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            data: delivery.data,
            properties: delivery.properties,
        }
    }
}

/// Opens physical connections to the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// A single physical connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Transport-level connected flag. Never touches the broker.
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a connection.
///
/// `basic_ack` and `basic_nack` on a channel that is no longer open must be
/// no-ops returning `Ok(())`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    /// Transport-level open flag. Never touches the broker.
    fn is_open(&self) -> bool;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// [`Connector`] backed by `lapin`.
pub struct LapinConnector {
    uri: String,
    connection_name: String,
    timeout: Duration,
}

impl LapinConnector {
    /// Creates a connector from the broker settings in `cfg`.
    ///
    /// # Parameters
    /// * `cfg` - Configuration containing RabbitMQ connection details like host, port, credentials, etc.
    pub fn new(cfg: &RabbitMQConfigs) -> Arc<LapinConnector> {
        Arc::new(LapinConnector {
            uri: cfg.uri(),
            connection_name: cfg.app_name.clone(),
            timeout: cfg.connection_timeout(),
        })
    }
}

#[async_trait]
impl Connector for LapinConnector {
    /// Establishes a connection, bounded by the configured handshake timeout.
    async fn connect(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match tokio::time::timeout(self.timeout, Connection::connect(&self.uri, options))
            .await
        {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
            Err(_) => {
                error!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "connection handshake timed out"
                );
                Err(AmqpError::ConnectionTimeout)
            }
        }?;
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// [`AmqpConnection`] backed by a `lapin::Connection`.
pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.conn.status().connected()
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_connected() {
            return Ok(());
        }

        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the connection");
            AmqpError::ConnectionError
        })
    }
}

/// [`AmqpChannel`] backed by a `lapin::Channel`.
pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerSetupError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(InboundDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        if !self.is_open() {
            debug!(delivery_tag, "channel closed, skipping ack");
            return Ok(());
        }

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        if !self.is_open() {
            debug!(delivery_tag, "channel closed, skipping nack");
            return Ok(());
        }

        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.is_open() {
            return Ok(());
        }

        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error closing the channel");
            AmqpError::ChannelError
        })
    }
}
