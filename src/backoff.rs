// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Exponential backoff with jitter.

use crate::configs::BackoffConfigs;
use rand::Rng;
use std::time::Duration;

/// Lower bound of the jitter factor.
pub const JITTER_MIN: f64 = 0.8;
/// Upper bound of the jitter factor.
pub const JITTER_MAX: f64 = 1.2;

/// Delay policy shared by connection reconnects and consumer recovery.
///
/// ```
/// # use rabbitmq_resilience::{backoff::ExponentialBackoff, configs::BackoffConfigs};
/// # use std::time::Duration;
/// let backoff = ExponentialBackoff::new(&BackoffConfigs {
///     initial_interval_ms: 1_000,
///     multiplier: 2.0,
///     max_interval_ms: 60_000,
///     max_attempts: 15,
///     cooldown_ms: 300_000,
/// });
/// assert_eq!(backoff.base_delay(3), Duration::from_secs(8));
/// assert_eq!(backoff.base_delay(10), Duration::from_secs(60));
/// ```
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl ExponentialBackoff {
    /// Builds the policy from configuration.
    ///
    /// # Parameters
    /// * `cfg` - Initial interval, multiplier and cap. A multiplier below 1
    ///   is raised to 1 and a cap below the initial interval is raised to it
    ///
    /// # Returns
    /// The backoff policy; it holds no state between calls
    pub fn new(cfg: &BackoffConfigs) -> Self {
        Self {
            initial: Duration::from_millis(cfg.initial_interval_ms),
            multiplier: cfg.multiplier.max(1.0),
            max_interval: Duration::from_millis(cfg.max_interval_ms.max(cfg.initial_interval_ms)),
        }
    }

    /// Cap on the un-jittered delay.
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    /// `min(initial * multiplier^attempt, max_interval)`, without jitter.
    /// Non-decreasing in `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The base delay scaled by a random factor in `[0.8, 1.2]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(JITTER_MIN..=JITTER_MAX);
        self.delay_with_jitter(attempt, factor)
    }

    /// Same as [`ExponentialBackoff::delay`] with a caller-chosen factor,
    /// clamped to `[JITTER_MIN, JITTER_MAX]`.
    ///
    /// # Parameters
    /// * `attempt` - Zero-based attempt number
    /// * `factor` - Jitter multiplier
    ///
    /// # Returns
    /// The jittered delay, rounded to the millisecond
    pub fn delay_with_jitter(&self, attempt: u32, factor: f64) -> Duration {
        let factor = factor.clamp(JITTER_MIN, JITTER_MAX);
        let millis = self.base_delay(attempt).as_millis() as f64 * factor;
        Duration::from_millis(millis.round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(&BackoffConfigs {
            initial_interval_ms: 1_000,
            multiplier: 2.0,
            max_interval_ms: 60_000,
            max_attempts: 15,
            cooldown_ms: 300_000,
        })
    }

    #[test]
    fn base_delay_grows_then_caps() {
        let b = backoff();
        assert_eq!(b.base_delay(0), Duration::from_secs(1));
        assert_eq!(b.base_delay(1), Duration::from_secs(2));
        assert_eq!(b.base_delay(5), Duration::from_secs(32));
        assert_eq!(b.base_delay(6), Duration::from_secs(60));
        assert_eq!(b.base_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn base_delay_is_non_decreasing() {
        let b = backoff();
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = b.base_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= b.max_interval());
            previous = delay;
        }
    }

    #[test]
    fn jittered_delay_stays_in_band() {
        let b = backoff();
        let ceiling = b.max_interval().as_millis() as f64 * JITTER_MAX;
        for attempt in 0..40 {
            let base = b.base_delay(attempt).as_millis() as f64;
            for _ in 0..20 {
                let delay = b.delay(attempt).as_millis() as f64;
                assert!(delay >= (base * JITTER_MIN).floor());
                assert!(delay <= (base * JITTER_MAX).ceil());
                assert!(delay <= ceiling.ceil());
            }
        }
    }

    #[test]
    fn jitter_factor_is_clamped() {
        let b = backoff();
        assert_eq!(b.delay_with_jitter(0, 5.0), Duration::from_millis(1_200));
        assert_eq!(b.delay_with_jitter(0, 0.0), Duration::from_millis(800));
    }
}
