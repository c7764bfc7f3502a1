//! # Retry Policy
//!
//! Decides whether a failed attempt is retried and how long to wait first:
//!
//! ```text
//! delay = min(base * multiplier^retries, max) ± jitter, clamped to [0, max]
//! ```
//!
//! Only infrastructure errors (cluster init, device config) are retried.

use crate::config::RetryConfig;
use crate::error::{ConfigResult, TaskError};
use rand::Rng;
use std::time::Duration;

/// Outcome of consulting the policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryDecision {
    /// Re-enqueue after `delay` as attempt number `attempt` (1-based retry count).
    Retry { attempt: u32, delay: Duration },
    /// Terminal. `retries_exhausted` is set when a retryable error ran out of attempts.
    GiveUp { retries_exhausted: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_enabled: bool,
    pub max_jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            multiplier: 2.0,
            jitter_enabled: true,
            max_jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> ConfigResult<Self> {
        Ok(Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay()?,
            max_delay: config.max_delay()?,
            multiplier: config.multiplier,
            jitter_enabled: config.jitter_enabled,
            max_jitter: config.max_jitter.clamp(0.0, 1.0),
        })
    }

    /// Policy that retries immediately; handy in tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter_enabled: false,
            max_jitter: 0.0,
        }
    }

    /// Decide what to do after `error` on an attempt that had already been
    /// retried `retries` times.
    pub fn decide(&self, error: &TaskError, retries: u32) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp {
                retries_exhausted: false,
            };
        }
        if retries >= self.max_retries {
            return RetryDecision::GiveUp {
                retries_exhausted: true,
            };
        }
        RetryDecision::Retry {
            attempt: retries + 1,
            delay: self.delay_for(retries),
        }
    }

    /// Backoff before retry number `retries + 1`.
    pub fn delay_for(&self, retries: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponential = self.base_delay.as_secs_f64() * self.multiplier.powi(retries as i32);
        let mut delay = if exponential.is_finite() {
            exponential.min(max)
        } else {
            max
        };

        if self.jitter_enabled {
            delay = self.apply_jitter(delay);
        }

        Duration::from_secs_f64(delay.clamp(0.0, max)).min(self.max_delay)
    }

    /// Apply jitter to delay to prevent thundering herd
    fn apply_jitter(&self, delay: f64) -> f64 {
        let jitter_range = delay * self.max_jitter;
        if jitter_range <= 0.0 {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0.0..=jitter_range);

        if rng.gen_bool(0.5) {
            delay + jitter
        } else {
            delay - jitter
        }
    }
}
