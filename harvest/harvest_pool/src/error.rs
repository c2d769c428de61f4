//! Error types for pool operations and handle factories.

use std::time::Duration;
use thiserror::Error;

use crate::label::Label;
use crate::lease::LeaseId;

/// Error reported by a [`Factory`](crate::Factory) when it cannot produce a handle
#[derive(Error, Debug)]
pub enum FactoryError {
    /// The backend configuration is unusable (malformed URL, unknown label, ...)
    #[error("invalid backend configuration: {0}")]
    Config(String),

    /// The backend rejected the supplied credentials
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The backend could not be reached or refused service for now
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something the adapter did not understand
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O failure while talking to the backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FactoryError {
    /// Whether retrying the same request can never succeed.
    ///
    /// Configuration and authentication failures are fatal; everything else
    /// may be transient.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FactoryError::Config(_) | FactoryError::Auth(_))
    }
}

/// Error returned by [`ResourcePool`](crate::ResourcePool) operations
#[derive(Error, Debug)]
pub enum PoolError {
    /// The factory failed to create a handle
    #[error("failed to create resource: {0}")]
    Factory(#[from] FactoryError),

    /// No handle became available before the acquire deadline
    #[error("pool '{pool}' exhausted: no handle for label {label} within {waited:?}")]
    PoolExhausted {
        /// Name of the pool
        pool: String,
        /// Label that was requested
        label: Label,
        /// How long the caller waited
        waited: Duration,
    },

    /// The lease is not checked out from this pool
    #[error("lease {lease} is not checked out from pool '{pool}'")]
    DoubleRelease {
        /// Name of the pool
        pool: String,
        /// The offending lease
        lease: LeaseId,
    },

    /// The pool has been drained and accepts no new work
    #[error("resource pool is shut down")]
    PoolShutdown,

    /// The pool configuration is not usable
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

impl PoolError {
    /// Whether the caller may reasonably retry after backing off.
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::PoolExhausted { .. } => true,
            PoolError::Factory(e) => !e.is_fatal(),
            _ => false,
        }
    }
}
