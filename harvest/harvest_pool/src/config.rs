//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Bounded retry with exponential backoff used while warming a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per handle, including the first one
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub initial_backoff: Duration,

    /// Upper bound for the delay between attempts
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to sleep after the given failed attempt (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Configuration for a resource pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in logs and errors, usually the backend name
    pub name: String,

    /// Maximum number of live handles (resident plus checked out)
    pub max_size: usize,

    /// Default timeout when acquiring a handle
    pub acquire_timeout: Duration,

    /// Retry policy for handle creation during warm-up
    pub retry: RetryPolicy,

    /// Ask the factory whether an idle handle is valid before handing it out
    pub validate_on_acquire: bool,

    /// Create a replacement immediately when a caller disposes of a handle
    pub replenish_on_dispose: bool,

    /// Close an idle handle of another label rather than block when the pool is full
    pub rebalance_idle: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            max_size: 5,
            acquire_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            validate_on_acquire: false,
            replenish_on_dispose: true,
            rebalance_idle: true,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with the given name and size and defaults otherwise
    pub fn new(name: impl Into<String>, max_size: usize) -> Self {
        Self {
            name: name.into(),
            max_size,
            ..Self::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "pool '{}': max_size must be greater than 0",
                self.name
            )));
        }

        if self.retry.max_attempts == 0 {
            return Err(PoolError::InvalidConfig(format!(
                "pool '{}': retry.max_attempts must be at least 1",
                self.name
            )));
        }

        if self.retry.initial_backoff > self.retry.max_backoff {
            return Err(PoolError::InvalidConfig(format!(
                "pool '{}': initial backoff exceeds max backoff",
                self.name
            )));
        }

        Ok(())
    }
}
