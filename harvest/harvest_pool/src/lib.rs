#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Harvest Pool
//!
//! A bounded pool for expensive backend handles: directory connections,
//! relational database sessions, triple-store sessions.
//!
//! The pool is generic over a [`Factory`] that knows how to create, check
//! and close one kind of handle. It provides:
//!
//! - Explicit pre-warming with bounded retry ([`ResourcePool::warm`])
//! - Blocking, label-aware checkout with a timeout ([`ResourcePool::acquire`])
//! - Separate check-in paths for healthy and broken handles
//!   ([`ResourcePool::release`], [`ResourcePool::dispose`])
//! - Scoped acquisition through [`PooledHandle`]
//! - Idempotent teardown ([`ResourcePool::drain`])
//!
//! ```
//! use harvest_pool::{FactoryError, FnFactory, Label, ResourcePool};
//!
//! let factory = FnFactory::new(|label: &Label| -> Result<String, FactoryError> {
//!     Ok(format!("session for {}", label))
//! });
//! let pool = ResourcePool::new(factory, 2).unwrap();
//! pool.warm(["ASMS", "INFOED"]).unwrap();
//!
//! let lease = pool.acquire("INFOED").unwrap();
//! assert_eq!(lease.handle(), "session for INFOED");
//! pool.release(lease).unwrap();
//!
//! assert_eq!(pool.drain(), 2);
//! ```

/// Pool configuration and retry policy
pub mod config;

/// Error types
pub mod error;

/// The factory capability
pub mod factory;

/// Scoped handle guard
pub mod guard;

/// Labels for logical sub-resources
pub mod label;

/// Checked-out handles
pub mod lease;

/// The pool engine
pub mod pool;

/// Status snapshots and check-in outcomes
pub mod status;

pub use config::{PoolConfig, RetryPolicy};
pub use error::{FactoryError, PoolError};
pub use factory::{Factory, FnFactory};
pub use guard::PooledHandle;
pub use label::Label;
pub use lease::{Lease, LeaseId};
pub use pool::{ManagedPool, ResourcePool};
pub use status::{Checkin, InvalidHandleDiscarded, PoolCounters, PoolStatus, Replacement};
