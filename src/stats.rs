// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Statistics
//!
//! Increment-only counters keyed by consumer name. Counters are atomics so
//! message handling tasks and the scheduler can record concurrently.

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};
use tracing::debug;

#[derive(Debug)]
struct ConsumerCounters {
    success: AtomicU64,
    failure: AtomicU64,
    retry: AtomicU64,
    retry_exhausted: AtomicU64,
    reconnection: AtomicU64,
    disconnection: AtomicU64,
    /// Milliseconds since the epoch, 0 when never active.
    last_active_ms: AtomicI64,
    registered_at: DateTime<Utc>,
}

impl ConsumerCounters {
    fn new() -> Self {
        Self {
            success: AtomicU64::new(0),
            failure: AtomicU64::new(0),
            retry: AtomicU64::new(0),
            retry_exhausted: AtomicU64::new(0),
            reconnection: AtomicU64::new(0),
            disconnection: AtomicU64::new(0),
            last_active_ms: AtomicI64::new(0),
            registered_at: Utc::now(),
        }
    }

    fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn reset(&self) {
        self.success.store(0, Ordering::Relaxed);
        self.failure.store(0, Ordering::Relaxed);
        self.retry.store(0, Ordering::Relaxed);
        self.retry_exhausted.store(0, Ordering::Relaxed);
        self.reconnection.store(0, Ordering::Relaxed);
        self.disconnection.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ConsumerStats {
        let last_active_ms = self.last_active_ms.load(Ordering::Relaxed);
        ConsumerStats {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            retry: self.retry.load(Ordering::Relaxed),
            retry_exhausted: self.retry_exhausted.load(Ordering::Relaxed),
            reconnection: self.reconnection.load(Ordering::Relaxed),
            disconnection: self.disconnection.load(Ordering::Relaxed),
            last_active: (last_active_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_active_ms).single())
                .flatten(),
            registered_at: self.registered_at,
        }
    }
}

/// Immutable view of one consumer's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub success: u64,
    pub failure: u64,
    pub retry: u64,
    pub retry_exhausted: u64,
    pub reconnection: u64,
    pub disconnection: u64,
    pub last_active: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

/// Immutable view of every registered consumer.
pub type StatsSnapshot = HashMap<String, ConsumerStats>;

/// Per-consumer counters shared by the dispatcher, the manager and the
/// health monitor.
#[derive(Debug, Default)]
pub struct StatsCollector {
    consumers: RwLock<HashMap<String, Arc<ConsumerCounters>>>,
}

impl StatsCollector {
    /// Creates an empty collector.
    pub fn new() -> Arc<StatsCollector> {
        Arc::new(StatsCollector::default())
    }

    /// Starts tracking a consumer. Existing counters are kept.
    pub fn register(&self, name: &str) {
        self.consumers
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(ConsumerCounters::new()));
    }

    /// Drops a consumer and its counters.
    pub fn unregister(&self, name: &str) {
        if self.consumers.write().remove(name).is_some() {
            debug!(consumer = name, "stats unregistered");
        }
    }

    /// Whether counters exist for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.consumers.read().contains_key(name)
    }

    fn with<F: FnOnce(&ConsumerCounters)>(&self, name: &str, f: F) {
        if let Some(counters) = self.consumers.read().get(name) {
            f(counters);
        }
    }

    /// Records a handled message and refreshes `last_active`.
    ///
    /// Recording for an unregistered consumer is a no-op, as for every
    /// `record_*` call.
    pub fn record_success(&self, name: &str) {
        self.with(name, |c| {
            c.success.fetch_add(1, Ordering::Relaxed);
            c.touch();
        });
    }

    /// Records a failed handler invocation.
    pub fn record_failure(&self, name: &str) {
        self.with(name, |c| {
            c.failure.fetch_add(1, Ordering::Relaxed);
            c.touch();
        });
    }

    /// Records a message scheduled for another attempt.
    pub fn record_retry(&self, name: &str) {
        self.with(name, |c| {
            c.retry.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Records a message given up on after its retry budget.
    pub fn record_retry_exhausted(&self, name: &str) {
        self.with(name, |c| {
            c.retry_exhausted.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// Records a successful consumer channel rebuild.
    pub fn record_reconnection(&self, name: &str) {
        self.with(name, |c| {
            c.reconnection.fetch_add(1, Ordering::Relaxed);
            c.touch();
        });
    }

    /// Records a consumer channel found dead.
    pub fn record_disconnection(&self, name: &str) {
        self.with(name, |c| {
            c.disconnection.fetch_add(1, Ordering::Relaxed);
        });
    }

    /// # Returns
    /// A copy of the consumer's counters, or `None` when it is not registered
    pub fn get(&self, name: &str) -> Option<ConsumerStats> {
        self.consumers.read().get(name).map(|c| c.snapshot())
    }

    /// Copies the counters of every registered consumer.
    pub fn snapshot(&self) -> StatsSnapshot {
        self.consumers
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.snapshot()))
            .collect()
    }

    /// Zeroes the counters of one consumer.
    pub fn reset(&self, name: &str) {
        self.with(name, |c| c.reset());
    }

    /// Zeroes the counters of every consumer. Registrations are kept.
    pub fn reset_all(&self) {
        for counters in self.consumers.read().values() {
            counters.reset();
        }
    }
}
