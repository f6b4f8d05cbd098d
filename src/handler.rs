// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Business Handler Contract
//!
//! The capability a business layer implements to receive messages. Handlers
//! never acknowledge messages themselves; the dispatcher owns every ack/nack
//! decision based on the handler's result.

use crate::{errors::HandlerError, message::ConsumerMessage};
use async_trait::async_trait;
use opentelemetry::Context;
use std::fmt;

/// Why a handler invocation counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    /// The handler returned `false`.
    Rejected,
    /// The handler returned an error.
    Error(HandlerError),
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Rejected => write!(f, "handler rejected the message"),
            FailureCause::Error(err) => write!(f, "{}", err),
        }
    }
}

/// A consumer's business logic.
#[async_trait]
pub trait MessageConsumer: Send + Sync {
    fn name(&self) -> &str;

    /// Processes one message. `Ok(true)` is success; `Ok(false)` and `Err`
    /// are both failures subject to the retry policy.
    async fn handle(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<bool, HandlerError>;

    /// Called when the consumer starts, before consumption begins.
    async fn on_start(&self) -> Result<(), HandlerError> {
        Ok(())
    }

    /// Called when an operator stops the consumer.
    async fn on_stop(&self) {}

    /// Called after each failed attempt, before the ack/nack decision.
    async fn on_failure(
        &self,
        _msg: &ConsumerMessage,
        _cause: &FailureCause,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}
