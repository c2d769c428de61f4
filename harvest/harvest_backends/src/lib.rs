#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

//! # Harvest Backends
//!
//! [`Factory`](harvest_pool::Factory) implementations for the backends the
//! harvester reads from and writes to:
//!
//! - A directory service over LDAP ([`DirectoryFactory`])
//! - MySQL, PostgreSQL and SQL Server databases ([`RelationalFactory`])
//! - A triple store, either a local Oxigraph dataset or a remote SPARQL
//!   endpoint ([`TripleStoreFactory`])
//!
//! Every factory logs in or opens its store when it creates a handle, so
//! configuration and credential problems show up while a pool is warmed.
//! None of them pool anything themselves.

/// Directory service connections
pub mod directory;

/// TCP connection helpers
pub mod endpoint;

/// Relational database sessions
pub mod relational;

/// Triple-store sessions
pub mod triple_store;

pub use directory::{DirectoryConfig, DirectoryConnection, DirectoryFactory};
pub use endpoint::{Endpoint, TcpSession, DEFAULT_CONNECT_TIMEOUT};
pub use relational::{Engine, RelationalConfig, RelationalConnection, RelationalFactory, SqlServerClient};
pub use triple_store::{
    DatasetSession, LocalDatasetConfig, LocalDatasetFactory, SparqlEndpointConfig,
    SparqlEndpointFactory, SparqlSession, TripleStoreFactory, TripleStoreSession,
};
