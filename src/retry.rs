// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection-Level Retry Coordination
//!
//! Schedules recovery actions (typically a consumer channel rebuild) with
//! exponential backoff, guarded per consumer by an `in_progress` flag and a
//! [`CircuitBreaker`]. This is independent of message-level retries.
//!
//! A scheduled retry runs as one task that loops over attempts, so sustained
//! failure never grows the call stack. The loop ends on success, when the
//! breaker opens, when `max_retry_attempts` is reached (the consumer is then
//! marked stopped until [`RetryCoordinator::reset`]), or when the consumer is
//! unregistered.

use crate::{
    backoff::ExponentialBackoff,
    circuit_breaker::{CircuitBreaker, CircuitState},
    configs::RetryConfigs,
    errors::AmqpError,
};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// A recovery action. Invoked once per attempt.
pub type RetryAction = Arc<dyn Fn() -> BoxFuture<'static, Result<(), AmqpError>> + Send + Sync>;

/// Result of a [`RetryCoordinator::schedule_retry`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The first attempt will run after `delay`.
    Scheduled { delay: Duration },
    AlreadyInProgress,
    CircuitOpen { remaining: Duration },
    Stopped,
    UnknownConsumer,
}

#[derive(Debug, Default)]
struct RetryState {
    retry_count: AtomicU32,
    last_retry_ms: AtomicI64,
    stopped: AtomicBool,
    in_progress: AtomicBool,
}

#[derive(Debug)]
struct ConsumerRetry {
    name: String,
    state: RetryState,
    breaker: CircuitBreaker,
}

/// Clears `in_progress` when the retry task ends, however it ends.
struct InProgressGuard(Arc<ConsumerRetry>);

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.state.in_progress.store(false, Ordering::SeqCst);
    }
}

/// Point-in-time view of a consumer's retry state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySnapshot {
    pub retry_count: u32,
    pub last_retry: Option<DateTime<Utc>>,
    pub stopped: bool,
    pub in_progress: bool,
    pub consecutive_failures: u32,
    pub circuit: CircuitState,
}

pub struct RetryCoordinator {
    cfg: RetryConfigs,
    backoff: ExponentialBackoff,
    consumers: RwLock<HashMap<String, Arc<ConsumerRetry>>>,
}

impl RetryCoordinator {
    pub fn new(cfg: RetryConfigs) -> Arc<RetryCoordinator> {
        Arc::new(RetryCoordinator {
            backoff: ExponentialBackoff::new(&cfg.backoff),
            cfg,
            consumers: RwLock::new(HashMap::default()),
        })
    }

    /// Starts tracking a consumer. Existing state is kept.
    pub fn register(&self, name: &str) {
        self.consumers
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| {
                Arc::new(ConsumerRetry {
                    name: name.to_owned(),
                    state: RetryState::default(),
                    breaker: CircuitBreaker::new(
                        name,
                        self.cfg.failure_threshold,
                        self.cfg.circuit_timeout(),
                    ),
                })
            });
    }

    /// Stops tracking a consumer; a retry task already running exits before
    /// its next attempt.
    pub fn unregister(&self, name: &str) {
        if let Some(entry) = self.consumers.write().remove(name) {
            entry.state.stopped.store(true, Ordering::SeqCst);
            debug!(consumer = name, "retry state unregistered");
        }
    }

    fn entry(&self, name: &str) -> Option<Arc<ConsumerRetry>> {
        self.consumers.read().get(name).cloned()
    }

    /// Arranges for `action` to run after a backoff delay, retrying on failure.
    pub fn schedule_retry(&self, name: &str, action: RetryAction) -> ScheduleOutcome {
        let Some(entry) = self.entry(name) else {
            warn!(consumer = name, "retry requested for unknown consumer");
            return ScheduleOutcome::UnknownConsumer;
        };

        if entry.state.stopped.load(Ordering::SeqCst) {
            debug!(consumer = name, "retries stopped, waiting for reset");
            return ScheduleOutcome::Stopped;
        }

        if let Err(remaining) = entry.breaker.check() {
            warn!(
                consumer = name,
                remaining_ms = remaining.as_millis() as u64,
                "circuit open, retry suppressed"
            );
            return ScheduleOutcome::CircuitOpen { remaining };
        }

        let performed = entry.state.retry_count.load(Ordering::SeqCst);
        if performed >= self.cfg.max_retry_attempts {
            stop(&entry, performed);
            return ScheduleOutcome::Stopped;
        }

        if entry
            .state
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(consumer = name, "retry already in progress");
            return ScheduleOutcome::AlreadyInProgress;
        }

        let guard = InProgressGuard(entry.clone());
        let attempt = entry.state.retry_count.fetch_add(1, Ordering::SeqCst);
        let delay = self.backoff.delay(attempt);

        info!(
            consumer = name,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        tokio::spawn(run_retries(
            guard,
            action,
            self.backoff.clone(),
            self.cfg.max_retry_attempts,
            delay,
        ));

        ScheduleOutcome::Scheduled { delay }
    }

    pub fn record_success(&self, name: &str) {
        if let Some(entry) = self.entry(name) {
            entry.breaker.record_success();
            entry.state.retry_count.store(0, Ordering::SeqCst);
        }
    }

    /// Returns `true` when this failure opened the circuit.
    pub fn record_failure(&self, name: &str) -> bool {
        self.entry(name)
            .map(|entry| entry.breaker.record_failure())
            .unwrap_or(false)
    }

    /// Operator reset: clears the stopped flag, the retry count and the breaker.
    pub fn reset(&self, name: &str) {
        if let Some(entry) = self.entry(name) {
            entry.state.stopped.store(false, Ordering::SeqCst);
            entry.state.retry_count.store(0, Ordering::SeqCst);
            entry.breaker.reset();
            info!(consumer = name, "retry state reset");
        }
    }

    pub fn is_in_progress(&self, name: &str) -> bool {
        self.entry(name)
            .map(|entry| entry.state.in_progress.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn is_stopped(&self, name: &str) -> bool {
        self.entry(name)
            .map(|entry| entry.state.stopped.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn state(&self, name: &str) -> Option<RetrySnapshot> {
        self.entry(name).map(|entry| {
            let last_retry_ms = entry.state.last_retry_ms.load(Ordering::SeqCst);
            RetrySnapshot {
                retry_count: entry.state.retry_count.load(Ordering::SeqCst),
                last_retry: (last_retry_ms > 0)
                    .then(|| Utc.timestamp_millis_opt(last_retry_ms).single())
                    .flatten(),
                stopped: entry.state.stopped.load(Ordering::SeqCst),
                in_progress: entry.state.in_progress.load(Ordering::SeqCst),
                consecutive_failures: entry.breaker.consecutive_failures(),
                circuit: entry.breaker.state(),
            }
        })
    }
}

async fn run_retries(
    guard: InProgressGuard,
    action: RetryAction,
    backoff: ExponentialBackoff,
    max_attempts: u32,
    first_delay: Duration,
) {
    let entry = guard.0.clone();
    let name = entry.name.as_str();
    let mut delay = first_delay;

    loop {
        tokio::time::sleep(delay).await;

        if entry.state.stopped.load(Ordering::SeqCst) {
            debug!(consumer = name, "consumer stopped, abandoning retry");
            break;
        }

        entry
            .state
            .last_retry_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);

        match action().await {
            Ok(()) => {
                entry.breaker.record_success();
                entry.state.retry_count.store(0, Ordering::SeqCst);
                info!(consumer = name, "retry succeeded");
                break;
            }
            Err(err) => {
                let opened = entry.breaker.record_failure();
                warn!(
                    consumer = name,
                    error = err.to_string(),
                    failures = entry.breaker.consecutive_failures(),
                    "retry attempt failed"
                );

                // The attempt bound wins over a (re-)opened circuit.
                let performed = entry.state.retry_count.load(Ordering::SeqCst);
                if performed >= max_attempts {
                    stop(&entry, performed);
                    break;
                }

                if opened {
                    warn!(consumer = name, "circuit opened, suspending retries");
                    break;
                }

                let attempt = entry.state.retry_count.fetch_add(1, Ordering::SeqCst);
                delay = backoff.delay(attempt);
            }
        }
    }

    drop(guard);
}

fn stop(entry: &ConsumerRetry, performed: u32) {
    entry.state.stopped.store(true, Ordering::SeqCst);
    error!(
        consumer = entry.name.as_str(),
        attempts = performed,
        "max retry attempts reached, consumer stopped until reset"
    );
}
