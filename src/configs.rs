// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Structured configuration consumed at startup. Every struct deserializes
//! with `serde` and falls back to its defaults for missing fields, so the
//! hosting application can load it from whatever source it prefers.

use serde::Deserialize;
use std::{env, time::Duration};

/// Broker connection settings plus the tuning of every reliability component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connection_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub status_interval_ms: u64,
    pub reconnect: BackoffConfigs,
    pub pool: PoolConfigs,
    pub retry: RetryConfigs,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            app_name: "rabbitmq-resilience".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "".to_owned(),
            connection_timeout_ms: 10_000,
            health_check_interval_ms: 30_000,
            status_interval_ms: 60_000,
            reconnect: BackoffConfigs::default(),
            pool: PoolConfigs::default(),
            retry: RetryConfigs::default(),
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the configs from `RABBITMQ_*` and `APP_NAME` environment
    /// variables, keeping the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(name) = env::var("APP_NAME") {
            cfg.app_name = name;
        }
        if let Ok(host) = env::var("RABBITMQ_HOST") {
            cfg.host = host;
        }
        if let Some(port) = env::var("RABBITMQ_PORT").ok().and_then(|p| p.parse().ok()) {
            cfg.port = port;
        }
        if let Ok(user) = env::var("RABBITMQ_USER") {
            cfg.user = user;
        }
        if let Ok(password) = env::var("RABBITMQ_PASSWORD") {
            cfg.password = password;
        }
        if let Ok(vhost) = env::var("RABBITMQ_VHOST") {
            cfg.vhost = vhost;
        }
        if let Some(timeout) = env::var("RABBITMQ_CONNECTION_TIMEOUT_MS")
            .ok()
            .and_then(|t| t.parse().ok())
        {
            cfg.connection_timeout_ms = timeout;
        }

        cfg
    }

    /// The AMQP URI for this broker.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(1))
    }
}

/// Exponential backoff parameters shared by the connection supervisor and
/// the consumer retry coordinator.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfigs {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    /// Consecutive failures before the supervisor cools down and starts over.
    pub max_attempts: u32,
    pub cooldown_ms: u64,
}

impl Default for BackoffConfigs {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            max_attempts: 15,
            cooldown_ms: 300_000,
        }
    }
}

impl BackoffConfigs {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Sizing of the publish channel pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfigs {
    pub initial_size: usize,
    pub max_size: usize,
    pub sweep_interval_ms: u64,
    pub sweep_batch_size: usize,
}

impl Default for PoolConfigs {
    fn default() -> Self {
        Self {
            initial_size: 5,
            max_size: 20,
            sweep_interval_ms: 60_000,
            sweep_batch_size: 5,
        }
    }
}

impl PoolConfigs {
    /// Clamps sizes into a usable range: at least one channel, and never
    /// more pre-created channels than the pool may hold.
    pub fn normalized(mut self) -> Self {
        self.max_size = self.max_size.max(1);
        self.initial_size = self.initial_size.min(self.max_size);
        self.sweep_batch_size = self.sweep_batch_size.max(1);
        self
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(1))
    }
}

/// Connection-level retry and circuit breaker settings for consumers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfigs {
    pub failure_threshold: u32,
    pub circuit_timeout_ms: u64,
    pub max_retry_attempts: u32,
    pub backoff: BackoffConfigs,
}

impl Default for RetryConfigs {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            circuit_timeout_ms: 300_000,
            max_retry_attempts: 10,
            backoff: BackoffConfigs::default(),
        }
    }
}

impl RetryConfigs {
    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_timeout_ms)
    }
}

/// Registration of a single consumer.
///
/// `name` is the unique key in the consumer registry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConsumerDefinition {
    pub name: String,
    pub queue_name: String,
    #[serde(default)]
    pub auto_ack: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u32,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1_000
}

fn default_prefetch_count() -> u32 {
    20
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl ConsumerDefinition {
    /// Creates a definition with the default policy for the given queue.
    ///
    /// # Parameters
    /// * `name` - Unique consumer name
    /// * `queue` - Queue to consume from
    ///
    /// # Returns
    /// A new consumer definition with default settings
    pub fn new(name: &str, queue: &str) -> ConsumerDefinition {
        ConsumerDefinition {
            name: name.to_owned(),
            queue_name: queue.to_owned(),
            auto_ack: false,
            enabled: default_true(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            prefetch_count: default_prefetch_count(),
            auto_reconnect: default_true(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }

    /// Lets the transport acknowledge deliveries on receipt.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }

    /// Registers the consumer without starting it.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn retry_delay_ms(mut self, delay: u64) -> Self {
        self.retry_delay_ms = delay;
        self
    }

    pub fn prefetch(mut self, count: u32) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Excludes the consumer from health-driven reconnection.
    pub fn without_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    pub fn health_check_interval_ms(mut self, interval: u64) -> Self {
        self.health_check_interval_ms = interval;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    /// The QoS prefetch as the protocol's 16-bit field.
    pub fn prefetch_u16(&self) -> u16 {
        u16::try_from(self.prefetch_count).unwrap_or(u16::MAX)
    }
}
