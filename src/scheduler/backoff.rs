//! Per-host exponential failure backoff.
//!
//! ```text
//! failures  delay (base 10s, max 2m)
//! --------  -----
//! 1         10s
//! 2         20s
//! 3         40s
//! 4         80s
//! 5+        120s
//! ```

use std::time::Duration;

use rand::Rng;

/// Default delay after the first failure.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(10);

/// Default ceiling.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl BackoffPolicy {
    /// A `max` below `base` is raised to `base`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: false,
        }
    }

    /// Randomise each delay within `[delay/2, delay]`.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// Zero failures means no delay.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures - 1);
        let delay = self.base.saturating_mul(factor).min(self.max);
        if self.jitter && !delay.is_zero() {
            rand::thread_rng().gen_range(delay / 2..=delay)
        } else {
            delay
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
