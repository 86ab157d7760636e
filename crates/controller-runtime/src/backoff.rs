//! # Exponential Backoff
//!
//! Per-key retry delays for the work queue.
//!
//! The delay doubles with every consecutive failure of the same key and is
//! capped at a maximum. With the defaults (5ms base, 1000s cap) the sequence
//! is 5ms, 10ms, 20ms, 40ms, ... until it saturates at 1000s.

use std::time::Duration;

/// Default delay before the first retry.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for retry delays.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff calculator
///
/// Stateless: the work queue keeps the failure count per key and asks for the
/// delay that corresponds to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    /// Delay for the first retry
    base: Duration,
    /// Upper bound for any delay
    max: Duration,
}

impl RetryBackoff {
    /// Create a backoff with the given base delay and cap.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay for a key that has already been retried `requeues` times.
    ///
    /// `requeues == 0` yields the base delay; every further retry doubles it,
    /// never exceeding the cap.
    #[must_use]
    pub fn delay_for(&self, requeues: u32) -> Duration {
        let factor = 1_u32.checked_shl(requeues).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// The base delay.
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// The delay cap.
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
