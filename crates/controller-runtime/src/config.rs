//! Runtime configuration.

use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, RetryBackoff};
use crate::error::OperatorError;
use crate::metrics::Metrics;
use std::time::Duration;

/// Default upper bound for the startup cache-sync barrier.
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Default time `run` waits for workers to drain after shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Default number of workers per queue.
pub const DEFAULT_WORKERS: usize = 2;

/// Operator-wide settings.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long `run` waits for every cache to sync before giving up.
    pub cache_sync_timeout: Duration,
    /// How long `run` waits for subsystems to finish after shutdown.
    pub shutdown_grace: Duration,
    /// Re-enqueue every cached object this often; `None` disables resync.
    pub resync_period: Option<Duration>,
}

impl RuntimeConfig {
    /// Set the cache sync timeout.
    #[must_use]
    pub const fn cache_sync_timeout(mut self, timeout: Duration) -> Self {
        self.cache_sync_timeout = timeout;
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    pub const fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the resync period.
    #[must_use]
    pub const fn resync_period(mut self, period: Option<Duration>) -> Self {
        self.resync_period = period;
        self
    }

    /// Reject settings the runtime cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] for a zero sync timeout or a
    /// zero resync period.
    pub fn validate(&self) -> Result<(), OperatorError> {
        if self.cache_sync_timeout.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "cache sync timeout must be greater than zero".to_string(),
            ));
        }
        if self.resync_period.is_some_and(|period| period.is_zero()) {
            return Err(OperatorError::InvalidConfig(
                "resync period must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            resync_period: None,
        }
    }
}

/// Per-queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent workers draining the queue.
    pub workers: usize,
    /// Delay before the first retry of a failed key.
    pub base_delay: Duration,
    /// Ceiling for retry delays.
    pub max_delay: Duration,
    /// Drop a key after this many retries; `None` retries forever.
    pub max_requeues: Option<u32>,
    /// Metrics sink, if any.
    pub metrics: Option<Metrics>,
}

impl QueueConfig {
    /// Set the worker count.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the retry delay bounds.
    #[must_use]
    pub fn backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Set the retry limit.
    #[must_use]
    pub fn max_requeues(mut self, max_requeues: Option<u32>) -> Self {
        self.max_requeues = max_requeues;
        self
    }

    /// Attach metrics.
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Backoff derived from the delay bounds.
    #[must_use]
    pub const fn retry_backoff(&self) -> RetryBackoff {
        RetryBackoff::new(self.base_delay, self.max_delay)
    }

    /// Reject settings the queue cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] for zero workers, a zero base
    /// delay, or a cap below the base delay.
    pub fn validate(&self) -> Result<(), OperatorError> {
        if self.workers == 0 {
            return Err(OperatorError::InvalidConfig(
                "queue needs at least one worker".to_string(),
            ));
        }
        if self.base_delay.is_zero() {
            return Err(OperatorError::InvalidConfig(
                "retry base delay must be greater than zero".to_string(),
            ));
        }
        if self.max_delay < self.base_delay {
            return Err(OperatorError::InvalidConfig(format!(
                "retry max delay {:?} is below base delay {:?}",
                self.max_delay, self.base_delay
            )));
        }
        Ok(())
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_requeues: None,
            metrics: None,
        }
    }
}
