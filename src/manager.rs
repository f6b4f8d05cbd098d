// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Consumer Manager
//!
//! The registry of consumers. Every active consumer owns a dedicated channel
//! opened off the supervised connection, so one consumer's backpressure or
//! failure never blocks another. Deliveries are handed to a
//! [`MessageDispatcher`] bound to that channel, each on its own task.
//!
//! Control operations (`start`, `stop`, `rebuild`, `unregister`) are
//! serialized per manager; the registry map itself is never locked across
//! an await point.

use crate::{
    channel::{AmqpChannel, DeliveryStream},
    configs::ConsumerDefinition,
    connection::ConnectionSupervisor,
    consumer::MessageDispatcher,
    errors::AmqpError,
    handler::MessageConsumer,
    retry::RetryCoordinator,
    stats::StatsCollector,
};
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle state of a registered consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    Inactive,
    Active,
    /// The dedicated channel died and a rebuild is pending.
    Recovering,
}

impl fmt::Display for ConsumerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerStatus::Inactive => write!(f, "inactive"),
            ConsumerStatus::Active => write!(f, "active"),
            ConsumerStatus::Recovering => write!(f, "recovering"),
        }
    }
}

struct ActiveConsumer {
    channel: Arc<dyn AmqpChannel>,
    consumer_tag: String,
    task: JoinHandle<()>,
}

struct ConsumerEntry {
    def: ConsumerDefinition,
    handler: Arc<dyn MessageConsumer>,
    status: ConsumerStatus,
    active: Option<ActiveConsumer>,
    failures: Arc<Mutex<HashMap<String, u32>>>,
}

pub struct ConsumerManager {
    supervisor: Arc<ConnectionSupervisor>,
    retry: Arc<RetryCoordinator>,
    stats: Arc<StatsCollector>,
    consumers: RwLock<HashMap<String, ConsumerEntry>>,
    control: tokio::sync::Mutex<()>,
}

impl ConsumerManager {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        retry: Arc<RetryCoordinator>,
        stats: Arc<StatsCollector>,
    ) -> Arc<ConsumerManager> {
        Arc::new(ConsumerManager {
            supervisor,
            retry,
            stats,
            consumers: RwLock::new(HashMap::default()),
            control: tokio::sync::Mutex::new(()),
        })
    }

    /// Registers a consumer and starts it when enabled.
    ///
    /// Re-registering an existing name is a no-op.
    ///
    /// # Returns
    /// The start error when an enabled consumer could not be set up. The
    /// registration itself is kept so the consumer can be started later.
    pub async fn register(
        &self,
        def: ConsumerDefinition,
        handler: Arc<dyn MessageConsumer>,
    ) -> Result<(), AmqpError> {
        let name = def.name.clone();
        let enabled = def.enabled;

        {
            let mut consumers = self.consumers.write();
            if consumers.contains_key(&name) {
                warn!(consumer = %name, "consumer already registered, ignoring");
                return Ok(());
            }

            consumers.insert(
                name.clone(),
                ConsumerEntry {
                    def,
                    handler,
                    status: ConsumerStatus::Inactive,
                    active: None,
                    failures: Arc::default(),
                },
            );
        }
        info!(consumer = %name, "consumer registered");

        if enabled {
            self.start(&name).await?;
        }
        Ok(())
    }

    /// Registers a declarative list of consumers. Every entry is attempted;
    /// the first failure is returned.
    pub async fn register_all(
        &self,
        consumers: Vec<(ConsumerDefinition, Arc<dyn MessageConsumer>)>,
    ) -> Result<(), AmqpError> {
        let mut first_err = None;

        for (def, handler) in consumers {
            let name = def.name.clone();
            if let Err(err) = self.register(def, handler).await {
                error!(consumer = %name, error = err.to_string(), "failure to start consumer");
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Opens a dedicated channel and begins consumption.
    ///
    /// Setup is attempted once; a missing queue fails with
    /// [`AmqpError::ConsumerSetupError`] and leaves the consumer inactive.
    pub async fn start(&self, name: &str) -> Result<(), AmqpError> {
        let _control = self.control.lock().await;
        self.start_locked(name).await
    }

    /// Cancels consumption, runs the stop callback and closes the channel.
    /// Stopping an inactive consumer does nothing.
    pub async fn stop(&self, name: &str) -> Result<(), AmqpError> {
        let _control = self.control.lock().await;
        self.stop_locked(name).await
    }

    pub async fn stop_all(&self) {
        for name in self.names() {
            if let Err(err) = self.stop(&name).await {
                warn!(consumer = %name, error = err.to_string(), "failure to stop consumer");
            }
        }
    }

    /// Stops the consumer and forgets its registration.
    pub async fn unregister(&self, name: &str) -> Result<(), AmqpError> {
        let _control = self.control.lock().await;
        self.stop_locked(name).await?;
        self.consumers.write().remove(name);
        info!(consumer = name, "consumer unregistered");
        Ok(())
    }

    /// Replaces a dead dedicated channel with a fresh one.
    ///
    /// Only consumers in [`ConsumerStatus::Recovering`] are rebuilt; a
    /// consumer stopped meanwhile is left alone. The stop callback is not
    /// invoked.
    pub async fn rebuild(&self, name: &str) -> Result<(), AmqpError> {
        let _control = self.control.lock().await;

        match self.status(name) {
            Some(ConsumerStatus::Recovering) => self.start_locked(name).await,
            Some(status) => {
                debug!(consumer = name, %status, "rebuild skipped");
                Ok(())
            }
            None => Err(AmqpError::ConsumerNotFound(name.to_owned())),
        }
    }

    /// Flags an active consumer whose channel was found dead.
    ///
    /// # Returns
    /// `true` when the consumer moved from active to recovering
    pub fn mark_recovering(&self, name: &str) -> bool {
        let mut consumers = self.consumers.write();
        match consumers.get_mut(name) {
            Some(entry) if entry.status == ConsumerStatus::Active => {
                entry.status = ConsumerStatus::Recovering;
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.status(name) == Some(ConsumerStatus::Active)
    }

    pub fn status(&self, name: &str) -> Option<ConsumerStatus> {
        self.consumers.read().get(name).map(|entry| entry.status)
    }

    pub fn definition(&self, name: &str) -> Option<ConsumerDefinition> {
        self.consumers.read().get(name).map(|entry| entry.def.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.consumers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Transport-level liveness of the consumer's dedicated channel. Creates
    /// nothing on the broker.
    pub fn channel_alive(&self, name: &str) -> bool {
        self.consumers
            .read()
            .get(name)
            .and_then(|entry| entry.active.as_ref())
            .map(|active| active.channel.is_open())
            .unwrap_or(false)
    }

    async fn start_locked(&self, name: &str) -> Result<(), AmqpError> {
        let (def, handler, failures, previous, status) = {
            let mut consumers = self.consumers.write();
            let Some(entry) = consumers.get_mut(name) else {
                return Err(AmqpError::ConsumerNotFound(name.to_owned()));
            };

            let alive = entry
                .active
                .as_ref()
                .map(|active| active.channel.is_open())
                .unwrap_or(false);
            if entry.status == ConsumerStatus::Active && alive {
                debug!(consumer = name, "consumer already active");
                return Ok(());
            }

            (
                entry.def.clone(),
                entry.handler.clone(),
                entry.failures.clone(),
                entry.active.take(),
                entry.status,
            )
        };

        if let Some(previous) = previous {
            teardown(name, previous).await;
        }

        match self.open(&def, handler, failures).await {
            Ok(active) => {
                self.stats.register(name);
                self.retry.register(name);

                let orphan = {
                    let mut consumers = self.consumers.write();
                    match consumers.get_mut(name) {
                        Some(entry) => {
                            entry.status = ConsumerStatus::Active;
                            entry.active = Some(active);
                            None
                        }
                        None => Some(active),
                    }
                };
                if let Some(orphan) = orphan {
                    teardown(name, orphan).await;
                    return Err(AmqpError::ConsumerNotFound(name.to_owned()));
                }

                info!(
                    consumer = name,
                    queue = %def.queue_name,
                    prefetch = def.prefetch_u16(),
                    auto_ack = def.auto_ack,
                    "consumer started"
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    consumer = name,
                    queue = %def.queue_name,
                    error = err.to_string(),
                    "failure to start consumer"
                );

                let next = match status {
                    ConsumerStatus::Recovering => ConsumerStatus::Recovering,
                    _ => ConsumerStatus::Inactive,
                };
                if let Some(entry) = self.consumers.write().get_mut(name) {
                    entry.status = next;
                }
                Err(err)
            }
        }
    }

    async fn stop_locked(&self, name: &str) -> Result<(), AmqpError> {
        let (handler, active) = {
            let mut consumers = self.consumers.write();
            let Some(entry) = consumers.get_mut(name) else {
                return Err(AmqpError::ConsumerNotFound(name.to_owned()));
            };

            if entry.status == ConsumerStatus::Inactive {
                debug!(consumer = name, "consumer already inactive");
                return Ok(());
            }

            entry.status = ConsumerStatus::Inactive;
            (entry.handler.clone(), entry.active.take())
        };

        handler.on_stop().await;
        if let Some(active) = active {
            teardown(name, active).await;
        }

        self.stats.unregister(name);
        self.retry.unregister(name);
        info!(consumer = name, "consumer stopped");
        Ok(())
    }

    async fn open(
        &self,
        def: &ConsumerDefinition,
        handler: Arc<dyn MessageConsumer>,
        failures: Arc<Mutex<HashMap<String, u32>>>,
    ) -> Result<ActiveConsumer, AmqpError> {
        let conn = self.supervisor.acquire()?;
        let channel = conn.create_channel().await?;

        let (consumer_tag, stream) = match setup(def, handler.as_ref(), channel.as_ref()).await {
            Ok(subscription) => subscription,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = close_err.to_string(), "error closing consumer channel");
                }
                return Err(err);
            }
        };

        let dispatcher = MessageDispatcher::with_tracker(
            def.clone(),
            handler,
            channel.clone(),
            self.stats.clone(),
            failures,
        );
        let task = tokio::spawn(consume_loop(def.name.clone(), stream, dispatcher));

        Ok(ActiveConsumer {
            channel,
            consumer_tag,
            task,
        })
    }
}

async fn setup(
    def: &ConsumerDefinition,
    handler: &dyn MessageConsumer,
    channel: &dyn AmqpChannel,
) -> Result<(String, DeliveryStream), AmqpError> {
    if let Err(err) = handler.on_start().await {
        error!(consumer = %def.name, error = err.to_string(), "start callback failed");
        return Err(AmqpError::ConsumerSetupError(def.name.clone()));
    }

    channel.basic_qos(def.prefetch_u16()).await?;

    let consumer_tag = format!("{}-{}", def.name, Uuid::new_v4());
    let stream = channel
        .basic_consume(&def.queue_name, &consumer_tag, def.auto_ack)
        .await?;

    Ok((consumer_tag, stream))
}

async fn consume_loop(
    name: String,
    mut stream: DeliveryStream,
    dispatcher: Arc<MessageDispatcher>,
) {
    while let Some(result) = stream.next().await {
        match result {
            Ok(delivery) => {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    dispatcher.dispatch(delivery).await;
                });
            }
            Err(err) => error!(consumer = %name, error = err.to_string(), "errors consume msg"),
        }
    }

    debug!(consumer = %name, "delivery stream ended");
}

async fn teardown(name: &str, active: ActiveConsumer) {
    if let Err(err) = active.channel.basic_cancel(&active.consumer_tag).await {
        debug!(consumer = name, error = err.to_string(), "error cancelling consumer");
    }
    active.task.abort();

    if let Err(err) = active.channel.close().await {
        debug!(consumer = name, error = err.to_string(), "error closing consumer channel");
    }
}
