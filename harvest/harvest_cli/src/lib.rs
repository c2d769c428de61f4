//! # Harvest CLI
//!
//! Configuration loading and the application context that owns one pool
//! per backend, plus the commands of the `harvest` binary.

pub mod commands;
pub mod config;
pub mod context;

pub use config::{ConfigError, HarvestConfig};
pub use context::{AppContext, ManagedBackend};
