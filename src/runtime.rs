// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Runtime
//!
//! Wires every reliability component from a single [`RabbitMQConfigs`] and
//! owns their startup and shutdown order.
//!
//! ```no_run
//! # use rabbitmq_resilience::{configs::RabbitMQConfigs, runtime::RabbitMQ};
//! # async fn run() {
//! let rabbitmq = RabbitMQ::new(RabbitMQConfigs::from_env());
//! rabbitmq.start().await;
//! // register consumers, publish through rabbitmq.publisher()
//! rabbitmq.shutdown().await;
//! # }
//! ```

use crate::{
    channel::{Connector, LapinConnector},
    configs::{ConsumerDefinition, RabbitMQConfigs},
    connection::ConnectionSupervisor,
    errors::AmqpError,
    handler::MessageConsumer,
    health::HealthMonitor,
    manager::ConsumerManager,
    pool::ChannelPool,
    publisher::RabbitMQPublisher,
    retry::RetryCoordinator,
    stats::StatsCollector,
};
use std::sync::Arc;
use tracing::info;

pub struct RabbitMQ {
    supervisor: Arc<ConnectionSupervisor>,
    pool: Arc<ChannelPool>,
    publisher: Arc<RabbitMQPublisher>,
    stats: Arc<StatsCollector>,
    retry: Arc<RetryCoordinator>,
    manager: Arc<ConsumerManager>,
    health: Arc<HealthMonitor>,
}

impl RabbitMQ {
    /// Builds the runtime on top of the `lapin` transport.
    pub fn new(cfg: RabbitMQConfigs) -> RabbitMQ {
        let connector = LapinConnector::new(&cfg);
        Self::with_connector(cfg, connector)
    }

    /// Builds the runtime on top of any transport.
    pub fn with_connector(cfg: RabbitMQConfigs, connector: Arc<dyn Connector>) -> RabbitMQ {
        let stats = StatsCollector::new();
        let supervisor = ConnectionSupervisor::with_stats(&cfg, connector, stats.clone());
        let pool = ChannelPool::new(supervisor.clone(), cfg.pool.clone());
        let publisher = RabbitMQPublisher::new(pool.clone());
        let retry = RetryCoordinator::new(cfg.retry.clone());
        let manager = ConsumerManager::new(supervisor.clone(), retry.clone(), stats.clone());
        let health = HealthMonitor::new(
            manager.clone(),
            retry.clone(),
            stats.clone(),
            cfg.health_check_interval(),
        );

        RabbitMQ {
            supervisor,
            pool,
            publisher,
            stats,
            retry,
            manager,
            health,
        }
    }

    /// Connects, pre-creates the publish channels and starts health checks.
    ///
    /// A broker that is unreachable at startup is not an error: the
    /// supervisor keeps reconnecting in the background.
    pub async fn start(&self) {
        self.supervisor.initialize().await;
        self.pool.initialize().await;
        self.health.start();
        info!("rabbitmq runtime started");
    }

    pub async fn register(
        &self,
        def: ConsumerDefinition,
        handler: Arc<dyn MessageConsumer>,
    ) -> Result<(), AmqpError> {
        self.manager.register(def, handler).await
    }

    pub async fn register_all(
        &self,
        consumers: Vec<(ConsumerDefinition, Arc<dyn MessageConsumer>)>,
    ) -> Result<(), AmqpError> {
        self.manager.register_all(consumers).await
    }

    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    pub fn manager(&self) -> Arc<ConsumerManager> {
        self.manager.clone()
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        self.stats.clone()
    }

    pub fn retry(&self) -> Arc<RetryCoordinator> {
        self.retry.clone()
    }

    pub fn supervisor(&self) -> Arc<ConnectionSupervisor> {
        self.supervisor.clone()
    }

    /// Stops consumers first, then health checks, the pool and finally the
    /// connection.
    pub async fn shutdown(&self) {
        self.manager.stop_all().await;
        self.health.stop();
        self.pool.shutdown().await;
        self.supervisor.close().await;
        info!("rabbitmq runtime shut down");
    }
}
