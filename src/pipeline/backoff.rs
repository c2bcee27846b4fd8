//! Retry policy and exponential backoff with jitter

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of send attempts per message
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default delay before the first retry
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;
/// Default upper bound on the un-jittered delay
pub const DEFAULT_MAX_DELAY_MS: u64 = 1000;
/// Default jitter, as a fraction of the current delay
pub const DEFAULT_JITTER: f64 = 0.3;
/// Default growth factor between retries
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Parameters for retrying a failed send
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds
    pub initial_delay_ms: u64,
    /// Cap on the un-jittered delay in milliseconds
    pub max_delay_ms: u64,
    /// Random extra delay, as a fraction of the current delay
    pub jitter: f64,
    /// Factor applied to the delay after every retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: DEFAULT_JITTER,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Policy that retries immediately, used where delays only slow things down
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            jitter: 0.0,
            multiplier: 1.0,
        }
    }

    /// Start a fresh backoff sequence for one retrying call
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
            self.multiplier,
        )
    }
}

/// Per-call backoff state.
///
/// Each call to [`next_delay`](Self::next_delay) returns the current delay plus
/// a random jitter in `[0, current * jitter)`, then grows the current delay by
/// the multiplier, capped at the maximum.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    jitter: f64,
    multiplier: f64,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a backoff starting at `initial` and never exceeding `max` before jitter
    pub fn new(initial: Duration, max: Duration, jitter: f64, multiplier: f64) -> Self {
        Self {
            current: initial.min(max),
            max,
            jitter: jitter.clamp(0.0, 1.0),
            multiplier: multiplier.max(1.0),
            attempt: 0,
        }
    }

    /// Number of delays handed out so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to wait before the next retry
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        // saturate at the cap instead of overflowing Duration
        self.current = Duration::try_from_secs_f64(base.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max)
            .min(self.max);
        self.attempt += 1;

        let spread = base.mul_f64(self.jitter);
        if spread.is_zero() {
            return base;
        }
        base + rand::thread_rng().gen_range(Duration::ZERO..spread)
    }
}
