// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod test_support;

pub mod backoff;
pub mod channel;
pub mod circuit_breaker;
pub mod configs;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod handler;
pub mod health;
pub mod manager;
pub mod message;
pub mod pool;
pub mod publisher;
pub mod retry;
pub mod runtime;
pub mod stats;

pub use runtime::RabbitMQ;
