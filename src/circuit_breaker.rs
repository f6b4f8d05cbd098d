// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Per-consumer circuit breaker for reconnection attempts.
//!
//! CLOSED counts consecutive failures and opens at the threshold. OPEN
//! refuses attempts until the timeout elapses, after which a single probe is
//! allowed (HALF_OPEN). A recorded success closes the circuit; a failed probe
//! re-opens it with a fresh timer.

use parking_lot::Mutex;
use serde::Serialize;
use std::{fmt, time::Duration};
use tokio::time::Instant;
use tracing::{info, warn};

/// Observable breaker state. `HalfOpen` is derived from an open circuit
/// whose timeout has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Attempts allowed; failures are counted.
    Closed,
    /// Attempts refused until the timeout elapses.
    Open,
    /// The timeout elapsed; the next attempt is a probe.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Default)]
struct BreakerData {
    consecutive_failures: u32,
    open: bool,
    /// Always `Some` while `open`.
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker for one consumer.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    timeout: Duration,
    data: Mutex<BreakerData>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    ///
    /// # Parameters
    /// * `name` - Consumer name, used in logs
    /// * `threshold` - Consecutive failures that open the circuit, at least 1
    /// * `timeout` - How long the circuit stays open before a probe is allowed
    ///
    /// # Returns
    /// A breaker in the `Closed` state
    pub fn new(name: &str, threshold: u32, timeout: Duration) -> Self {
        Self {
            name: name.to_owned(),
            threshold: threshold.max(1),
            timeout,
            data: Mutex::new(BreakerData::default()),
        }
    }

    /// Current state, reporting `HalfOpen` once an open circuit timed out.
    pub fn state(&self) -> CircuitState {
        let data = self.data.lock();
        match (data.open, data.opened_at) {
            (true, Some(at)) if at.elapsed() >= self.timeout => CircuitState::HalfOpen,
            (true, _) => CircuitState::Open,
            (false, _) => CircuitState::Closed,
        }
    }

    /// Failures recorded since the last success or reset.
    pub fn consecutive_failures(&self) -> u32 {
        self.data.lock().consecutive_failures
    }

    /// `Err(remaining)` while the circuit is open and the timeout has not elapsed.
    pub fn check(&self) -> Result<(), Duration> {
        let data = self.data.lock();
        match (data.open, data.opened_at) {
            (true, Some(at)) => {
                let elapsed = at.elapsed();
                if elapsed >= self.timeout {
                    Ok(())
                } else {
                    Err(self.timeout - elapsed)
                }
            }
            _ => Ok(()),
        }
    }

    /// Returns `true` when this failure opened (or re-opened) the circuit.
    pub fn record_failure(&self) -> bool {
        let mut data = self.data.lock();
        data.consecutive_failures = data.consecutive_failures.saturating_add(1);

        if !data.open {
            if data.consecutive_failures >= self.threshold {
                data.open = true;
                data.opened_at = Some(Instant::now());
                warn!(
                    consumer = %self.name,
                    failures = data.consecutive_failures,
                    "circuit opened"
                );
                return true;
            }
            return false;
        }

        let probe_failed = data
            .opened_at
            .map(|at| at.elapsed() >= self.timeout)
            .unwrap_or(true);
        if probe_failed {
            data.opened_at = Some(Instant::now());
            warn!(consumer = %self.name, "half-open probe failed, circuit re-opened");
        }
        probe_failed
    }

    /// Closes the circuit and clears the failure count.
    pub fn record_success(&self) {
        let mut data = self.data.lock();
        if data.open {
            info!(consumer = %self.name, "circuit closed");
        }
        *data = BreakerData::default();
    }

    /// Operator reset, same effect as a success without the log line.
    pub fn reset(&self) {
        *self.data.lock() = BreakerData::default();
    }
}
