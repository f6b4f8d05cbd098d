// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! Owns the single logical broker connection. Failed connects are retried
//! with exponential backoff on a background task; after `max_attempts`
//! consecutive failures the supervisor cools down, resets its counter and
//! keeps going. It never gives up while running.
//!
//! Two timers run alongside: a health check that kicks an immediate
//! reconnect when the connection is gone, and a status printer.

use crate::{
    backoff::ExponentialBackoff,
    channel::{AmqpConnection, Connector},
    configs::RabbitMQConfigs,
    errors::AmqpError,
    stats::StatsCollector,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    backoff: ExponentialBackoff,
    max_attempts: u32,
    cooldown: Duration,
    health_interval: Duration,
    status_interval: Duration,
    stats: Option<Arc<StatsCollector>>,
    connection: RwLock<Option<Arc<dyn AmqpConnection>>>,
    status: AtomicU8,
    attempts: AtomicU32,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub fn new(cfg: &RabbitMQConfigs, connector: Arc<dyn Connector>) -> Arc<ConnectionSupervisor> {
        Self::build(cfg, connector, None)
    }

    /// Same as [`ConnectionSupervisor::new`], with the status printer also
    /// logging the consumer stats snapshot.
    pub fn with_stats(
        cfg: &RabbitMQConfigs,
        connector: Arc<dyn Connector>,
        stats: Arc<StatsCollector>,
    ) -> Arc<ConnectionSupervisor> {
        Self::build(cfg, connector, Some(stats))
    }

    fn build(
        cfg: &RabbitMQConfigs,
        connector: Arc<dyn Connector>,
        stats: Option<Arc<StatsCollector>>,
    ) -> Arc<ConnectionSupervisor> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(ConnectionSupervisor {
            connector,
            backoff: ExponentialBackoff::new(&cfg.reconnect),
            max_attempts: cfg.reconnect.max_attempts.max(1),
            cooldown: cfg.reconnect.cooldown(),
            health_interval: cfg.health_check_interval(),
            status_interval: cfg.status_interval(),
            stats,
            connection: RwLock::new(None),
            status: AtomicU8::new(ConnectionStatus::Disconnected.as_u8()),
            attempts: AtomicU32::new(0),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(vec![]),
        })
    }

    /// Connects, falling back to the background reconnect loop on failure,
    /// and starts the health and status timers.
    pub async fn initialize(self: &Arc<Self>) {
        self.closed.store(false, Ordering::SeqCst);

        if let Err(err) = self.connect_once().await {
            warn!(error = err.to_string(), "initial connection failed, reconnecting in background");
            self.trigger_reconnect();
        }

        let health = self.spawn_health_timer();
        let status = self.spawn_status_timer();
        self.tasks.lock().extend([health, status]);
    }

    /// Current connection state. A connection the transport reports as
    /// dropped reads as `Disconnected` before any reconnect has started.
    pub fn status(&self) -> ConnectionStatus {
        match ConnectionStatus::from_u8(self.status.load(Ordering::SeqCst)) {
            ConnectionStatus::Connected if !self.is_available() => ConnectionStatus::Disconnected,
            status => status,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_available(&self) -> bool {
        self.connection
            .read()
            .as_ref()
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    /// Returns the live connection without waiting. When none is available
    /// a reconnect is kicked off in the background and the call fails fast.
    pub fn acquire(self: &Arc<Self>) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let current = self.connection.read().clone();
        match current {
            Some(conn) if conn.is_connected() => Ok(conn),
            _ => {
                debug!("connection unavailable, requesting reconnect");
                self.trigger_reconnect();
                Err(AmqpError::ConnectionUnavailable)
            }
        }
    }

    /// Stops the timers and any reconnect in flight, then closes the connection.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let conn = self.connection.write().take();
        if let Some(conn) = conn {
            if let Err(err) = conn.close().await {
                warn!(error = err.to_string(), "error closing the connection");
            }
        }

        self.status
            .store(ConnectionStatus::Disconnected.as_u8(), Ordering::SeqCst);
        self.reconnecting.store(false, Ordering::SeqCst);
        info!("connection supervisor closed");
    }

    async fn connect_once(&self) -> Result<(), AmqpError> {
        self.status
            .store(ConnectionStatus::Connecting.as_u8(), Ordering::SeqCst);

        match self.connector.connect().await {
            Ok(conn) => {
                if self.closed.load(Ordering::SeqCst) {
                    if let Err(err) = conn.close().await {
                        debug!(error = err.to_string(), "error closing the late connection");
                    }
                    return Err(AmqpError::ConnectionUnavailable);
                }

                let replaced = self.connection.write().replace(conn);
                self.attempts.store(0, Ordering::SeqCst);
                self.status
                    .store(ConnectionStatus::Connected.as_u8(), Ordering::SeqCst);
                info!("amqp connection established");

                if let Some(old) = replaced {
                    if let Err(err) = old.close().await {
                        debug!(error = err.to_string(), "error closing the replaced connection");
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.status
                    .store(ConnectionStatus::Disconnected.as_u8(), Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Starts the reconnect loop unless one is already running.
    pub(crate) fn trigger_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.reconnect_loop().await;
            this.reconnecting.store(false, Ordering::SeqCst);
        });
        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    async fn reconnect_loop(&self) {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            if self.is_available() {
                return;
            }

            match self.connect_once().await {
                Ok(()) => return,
                Err(err) => {
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

                    if attempt >= self.max_attempts {
                        error!(
                            error = err.to_string(),
                            attempts = attempt,
                            cooldown_ms = self.cooldown.as_millis() as u64,
                            "max reconnect attempts reached, cooling down"
                        );
                        tokio::time::sleep(self.cooldown).await;
                        self.attempts.store(0, Ordering::SeqCst);
                        continue;
                    }

                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "reconnect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn spawn_health_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !this.is_available() {
                            warn!("connection health check failed, reconnecting");
                            this.trigger_reconnect();
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("connection health timer shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_status_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.status_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => this.print_status(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn print_status(&self) {
        let stats = self
            .stats
            .as_ref()
            .and_then(|stats| serde_json::to_string(&stats.snapshot()).ok())
            .unwrap_or_default();

        info!(
            status = %self.status(),
            available = self.is_available(),
            attempts = self.attempts(),
            stats = %stats,
            "amqp connection status"
        );
    }
}
