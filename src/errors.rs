// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Reliability Layer
//!
//! This module provides the error taxonomy for every broker-facing operation.
//! Only publish-time and setup-time failures are surfaced to callers; the
//! remaining variants are produced internally and absorbed by the reconnect,
//! health and retry machinery, which log them instead of propagating them.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-level variants are transient and handled by the connection
/// supervisor. `ChannelAcquisitionError` and `ConsumerSetupError` are the two
/// variants a caller is expected to react to.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The connection handshake did not complete within the configured timeout
    #[error("connection handshake timed out")]
    ConnectionTimeout,

    /// There is currently no usable connection; a reconnect has been requested
    #[error("connection unavailable")]
    ConnectionUnavailable,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The publish channel pool is at capacity with no idle channel
    #[error("channel pool exhausted (max size `{max_size}`)")]
    ChannelAcquisitionError { max_size: usize },

    /// Error preparing a consumer (qos, consume, start callback)
    #[error("failure to set up consumer `{0}`")]
    ConsumerSetupError(String),

    /// No consumer is registered under the given name
    #[error("consumer `{0}` is not registered")]
    ConsumerNotFound(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Errors raised by business handlers.
///
/// A handler failure is governed by the message-level retry policy and never
/// escapes to the connection layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler could not decode the payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// The handler failed while processing the message
    #[error("failure to process message: {0}")]
    ProcessingError(String),

    /// The handler's lifecycle callback failed
    #[error("lifecycle callback failed: {0}")]
    LifecycleError(String),
}
