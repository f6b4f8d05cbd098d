// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Publish Channel Pool
//!
//! A bounded pool of channels used only for outgoing publishes. Borrowing
//! never waits: an idle healthy channel is reused, a new one is opened while
//! under `max_size`, and otherwise the call fails with
//! [`AmqpError::ChannelAcquisitionError`]. Closed channels are evicted on
//! borrow, on return and by a periodic sweep; they never go back to the pool.

use crate::{
    channel::AmqpChannel, configs::PoolConfigs, connection::ConnectionSupervisor,
    errors::AmqpError,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

/// Bounded, non-blocking pool of publish channels on the supervised connection.
pub struct ChannelPool {
    supervisor: Arc<ConnectionSupervisor>,
    cfg: PoolConfigs,
    available: Mutex<VecDeque<Arc<dyn AmqpChannel>>>,
    /// Channels owned by the pool, idle or borrowed.
    total: AtomicUsize,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelPool {
    /// Creates an empty pool. Nothing is opened until [`ChannelPool::initialize`].
    ///
    /// # Parameters
    /// * `supervisor` - Source of the connection channels are opened on
    /// * `cfg` - Pool sizing and sweep settings, normalized so `initial_size <= max_size`
    ///
    /// # Returns
    /// An Arc-wrapped pool, shared by the publisher and the sweep task
    pub fn new(supervisor: Arc<ConnectionSupervisor>, cfg: PoolConfigs) -> Arc<ChannelPool> {
        let (shutdown_tx, _) = broadcast::channel(1);

        Arc::new(ChannelPool {
            supervisor,
            cfg: cfg.normalized(),
            available: Mutex::new(VecDeque::new()),
            total: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown_tx,
            sweeper: Mutex::new(None),
        })
    }

    /// Pre-creates `initial_size` channels and starts the idle sweep.
    ///
    /// Channels that cannot be created now are opened lazily by `borrow`.
    pub async fn initialize(self: &Arc<Self>) {
        self.closed.store(false, Ordering::SeqCst);

        for _ in 0..self.cfg.initial_size {
            if !self.reserve_slot() {
                break;
            }

            match self.open_channel().await {
                Ok(channel) => self.available.lock().push_back(channel),
                Err(err) => {
                    self.release_slot();
                    warn!(error = err.to_string(), "failure to pre-create pool channel");
                    break;
                }
            }
        }

        info!(
            idle = self.available_count(),
            max_size = self.cfg.max_size,
            "channel pool initialized"
        );

        let handle = self.spawn_sweeper();
        if let Some(previous) = self.sweeper.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Upper bound on channels owned by the pool, idle or borrowed.
    pub fn max_size(&self) -> usize {
        self.cfg.max_size
    }

    /// Channels currently owned by the pool, including borrowed ones.
    pub fn total_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// Idle channels ready to be borrowed.
    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }

    /// Hands out a channel for exactly one publish call.
    ///
    /// # Returns
    /// An open channel, `ChannelAcquisitionError` when the pool is at
    /// `max_size` or shut down, or the connection error when a new channel
    /// cannot be opened
    pub async fn borrow(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        loop {
            let idle = self.available.lock().pop_front();
            match idle {
                Some(channel) if channel.is_open() => return Ok(channel),
                Some(channel) => {
                    debug!(channel = channel.id(), "evicting closed pool channel");
                    self.discard(channel).await;
                }
                None => break,
            }
        }

        if self.closed.load(Ordering::SeqCst) || !self.reserve_slot() {
            warn!(max_size = self.cfg.max_size, "channel pool exhausted");
            return Err(AmqpError::ChannelAcquisitionError {
                max_size: self.cfg.max_size,
            });
        }

        match self.open_channel().await {
            Ok(channel) => Ok(channel),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Gives a borrowed channel back. Healthy channels are requeued; closed
    /// ones are dropped from the pool.
    pub async fn return_channel(&self, channel: Arc<dyn AmqpChannel>) {
        if !self.closed.load(Ordering::SeqCst) && channel.is_open() {
            let mut available = self.available.lock();
            if available.len() < self.cfg.max_size {
                available.push_back(channel);
                return;
            }
        }

        self.discard(channel).await;
    }

    /// Checks up to `sweep_batch_size` idle channels and evicts closed ones.
    /// Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let batch: Vec<_> = {
            let mut available = self.available.lock();
            let take = self.cfg.sweep_batch_size.min(available.len());
            available.drain(..take).collect()
        };

        let mut evicted = 0;
        for channel in batch {
            if channel.is_open() {
                self.available.lock().push_back(channel);
            } else {
                self.discard(channel).await;
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "evicted closed pool channels");
        }
        evicted
    }

    /// Closes every idle channel. Borrowed channels keep their slot until
    /// they come back, and are closed on return.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }

        let idle: Vec<_> = self.available.lock().drain(..).collect();
        for channel in idle {
            self.discard(channel).await;
        }

        info!(outstanding = self.total_count(), "channel pool shut down");
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let conn = self.supervisor.acquire()?;
        conn.create_channel().await
    }

    async fn discard(&self, channel: Arc<dyn AmqpChannel>) {
        self.release_slot();
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "error closing pool channel");
        }
    }

    fn reserve_slot(&self) -> bool {
        let max = self.cfg.max_size;
        self.total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                (total < max).then_some(total + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                Some(total.saturating_sub(1))
            });
    }

    fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.cfg.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        pool.sweep().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{configs::RabbitMQConfigs, test_support::FakeBroker};
    use std::time::Duration;

    async fn pool_with(broker: &Arc<FakeBroker>, initial: usize, max: usize) -> Arc<ChannelPool> {
        let supervisor = ConnectionSupervisor::new(&RabbitMQConfigs::default(), broker.connector());
        supervisor.initialize().await;

        let pool = ChannelPool::new(
            supervisor,
            PoolConfigs {
                initial_size: initial,
                max_size: max,
                sweep_interval_ms: 60_000,
                sweep_batch_size: 5,
            },
        );
        pool.initialize().await;
        pool
    }

    #[tokio::test(start_paused = true)]
    async fn initialize_pre_creates_channels() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 3, 5).await;

        assert_eq!(pool.available_count(), 3);
        assert_eq!(pool.total_count(), 3);
        assert_eq!(broker.channel_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_reuses_returned_channels() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 0, 2).await;

        let channel = pool.borrow().await.unwrap();
        let id = channel.id();
        pool.return_channel(channel).await;

        let again = pool.borrow().await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.total_count(), 1);
        assert_eq!(broker.channel_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_pool_fails_without_growing() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 5, 20).await;

        let mut borrowed = vec![];
        for _ in 0..20 {
            borrowed.push(pool.borrow().await.unwrap());
        }
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.total_count(), 20);

        let result = tokio::time::timeout(Duration::from_millis(10), pool.borrow()).await;
        assert_eq!(
            result.unwrap().err(),
            Some(AmqpError::ChannelAcquisitionError { max_size: 20 })
        );
        assert_eq!(pool.total_count(), 20);
        assert_eq!(broker.channel_count(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_channels_are_evicted_on_borrow_and_return() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 2, 2).await;

        broker.channels()[0].kill();
        let channel = pool.borrow().await.unwrap();
        assert_eq!(channel.id(), broker.channels()[1].id());
        assert_eq!(pool.total_count(), 1);

        broker.channels()[1].kill();
        pool.return_channel(channel).await;
        assert_eq!(pool.available_count(), 0);
        assert_eq!(pool.total_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_dead_idle_channels() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 4, 4).await;

        broker.channels()[1].kill();
        broker.channels()[3].kill();

        assert_eq!(pool.sweep().await, 2);
        assert_eq!(pool.available_count(), 2);
        assert_eq!(pool.total_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_runs() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 2, 2).await;

        broker.channels()[0].kill();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(pool.total_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn borrow_fails_fast_without_connection() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 0, 2).await;
        broker.drop_connection();
        broker.set_available(false);

        assert_eq!(
            pool.borrow().await.err(),
            Some(AmqpError::ConnectionUnavailable)
        );
        assert_eq!(pool.total_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_idle_channels() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 3, 3).await;

        pool.shutdown().await;
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.available_count(), 0);
        assert!(broker.channels().iter().all(|c| !c.is_open()));
        assert!(pool.borrow().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_keeps_borrowed_channels_counted_until_returned() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 2, 2).await;

        let held = pool.borrow().await.unwrap();
        pool.shutdown().await;
        assert_eq!(pool.total_count(), 1);
        assert!(held.is_open());

        pool.return_channel(held.clone()).await;
        assert_eq!(pool.total_count(), 0);
        assert_eq!(pool.available_count(), 0);
        assert!(!held.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialized_pool_never_exceeds_max_with_late_returns() {
        let broker = FakeBroker::new();
        let pool = pool_with(&broker, 2, 2).await;

        let held = pool.borrow().await.unwrap();
        pool.shutdown().await;
        pool.initialize().await;
        assert_eq!(pool.total_count(), 2);

        pool.return_channel(held).await;
        assert_eq!(pool.total_count(), 2);
        assert!(pool.available_count() <= pool.max_size());
    }
}
