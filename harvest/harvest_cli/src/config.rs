//! Configuration for the harvester's backend pools
//!
//! Loads the TOML file describing every backend and turns each entry into
//! the plain configuration structs the pool and factory crates take.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use harvest_backends::relational::Engine;
use harvest_backends::triple_store::validate_graph;
use harvest_backends::{DirectoryConfig, LocalDatasetConfig, RelationalConfig, SparqlEndpointConfig};
use harvest_pool::{Label, PoolConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Errors that can occur in configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Pool settings shared by every backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolDefaults {
    /// How long acquire waits for a handle (milliseconds)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Connect and login timeout (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Factory attempts per handle while warming
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Backoff before the first retry (milliseconds), doubled per attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Check each handle with the factory before handing it out
    #[serde(default)]
    pub validate_on_acquire: bool,
}

fn default_acquire_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_pool_size() -> usize {
    5
}

fn default_application_name() -> String {
    "harvest".to_string()
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            validate_on_acquire: false,
        }
    }
}

impl PoolDefaults {
    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Pool configuration for one backend
    pub fn pool_config(&self, name: &str, pool_size: usize) -> PoolConfig {
        let initial_backoff = Duration::from_millis(self.retry_backoff_ms);
        PoolConfig {
            name: name.to_string(),
            max_size: pool_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                initial_backoff,
                max_backoff: initial_backoff.max(Duration::from_secs(2)),
            },
            validate_on_acquire: self.validate_on_acquire,
            ..PoolConfig::default()
        }
    }
}

/// A directory service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectoryEntry {
    /// Backend name
    pub name: String,

    /// `ldap://host[:port]`
    pub url: String,

    /// DN to bind as
    #[serde(default)]
    pub bind_dn: String,

    /// Bind password, inline
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the bind password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Search base for unlabeled connections
    pub base_dn: String,

    /// Named search bases
    #[serde(default)]
    pub search_bases: BTreeMap<String, String>,

    /// Labels to warm the pool with
    #[serde(default)]
    pub labels: Vec<String>,

    /// Maximum handles
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// A relational database server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationalEntry {
    /// Backend name
    pub name: String,

    /// `mysql`, `postgres` or `mssql`
    pub engine: String,

    /// Server host
    pub host: String,

    /// Server port; the engine default when absent
    #[serde(default)]
    pub port: Option<u16>,

    /// Login user
    pub user: String,

    /// Login password, inline
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the login password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Database for unlabeled connections
    pub database: String,

    /// Logical databases by label
    #[serde(default)]
    pub databases: BTreeMap<String, String>,

    /// Labels to warm the pool with
    #[serde(default)]
    pub labels: Vec<String>,

    /// Reported to servers that accept it
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Refuse servers that cannot negotiate TLS
    #[serde(default)]
    pub require_tls: bool,

    /// Maximum handles
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// Where a triple store lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TripleStoreMode {
    /// Dataset directory on this machine
    Local,
    /// SPARQL endpoint over HTTP
    Remote,
}

/// A triple store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TripleStoreEntry {
    /// Backend name
    pub name: String,

    /// Local dataset or remote endpoint
    pub mode: TripleStoreMode,

    /// Dataset directory (local mode)
    #[serde(default)]
    pub location: Option<PathBuf>,

    /// Create the dataset directory if missing (local mode)
    #[serde(default)]
    pub create_if_missing: bool,

    /// SPARQL query endpoint (remote mode)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// SPARQL update endpoint (remote mode)
    #[serde(default)]
    pub update_endpoint: Option<String>,

    /// Basic-auth user (remote mode)
    #[serde(default)]
    pub username: Option<String>,

    /// Basic-auth password, inline
    #[serde(default)]
    pub password: Option<String>,

    /// Environment variable holding the basic-auth password
    #[serde(default)]
    pub password_env: Option<String>,

    /// Named graphs to warm the pool with
    #[serde(default)]
    pub graphs: Vec<String>,

    /// Maximum handles
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

/// The whole configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarvestConfig {
    /// Defaults for every pool
    #[serde(default)]
    pub pool: PoolDefaults,

    /// Directory services
    #[serde(default)]
    pub directory: Vec<DirectoryEntry>,

    /// Relational databases
    #[serde(default)]
    pub relational: Vec<RelationalEntry>,

    /// Triple stores
    #[serde(default)]
    pub triple_store: Vec<TripleStoreEntry>,
}

/// Resolve a password given inline or through an environment variable
fn resolve_secret(
    backend: &str,
    password: Option<&str>,
    password_env: Option<&str>,
) -> Result<Option<String>, ConfigError> {
    match (password, password_env) {
        (Some(_), Some(_)) => Err(ConfigError::Invalid(format!(
            "backend '{}': set either password or password_env, not both",
            backend
        ))),
        (Some(password), None) => Ok(Some(password.to_string())),
        (None, Some(var)) => std::env::var(var).map(Some).map_err(|_| {
            ConfigError::Invalid(format!(
                "backend '{}': environment variable {} is not set",
                backend, var
            ))
        }),
        (None, None) => Ok(None),
    }
}

impl DirectoryEntry {
    /// Factory configuration, with the password resolved
    pub fn to_backend(&self, pool: &PoolDefaults) -> Result<DirectoryConfig, ConfigError> {
        let password =
            resolve_secret(&self.name, self.password.as_deref(), self.password_env.as_deref())?;
        Ok(DirectoryConfig {
            url: self.url.clone(),
            bind_dn: self.bind_dn.clone(),
            password: password.unwrap_or_default(),
            base_dn: self.base_dn.clone(),
            search_bases: self.search_bases.clone(),
            connect_timeout: pool.connect_timeout(),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(invalid(&self.name, "url cannot be empty"));
        }
        if self.base_dn.is_empty() {
            return Err(invalid(&self.name, "base_dn cannot be empty"));
        }
        for label in &self.labels {
            if !self.search_bases.contains_key(label) {
                return Err(invalid(
                    &self.name,
                    &format!("label '{}' has no entry in search_bases", label),
                ));
            }
        }
        if self.password.is_some() && self.password_env.is_some() {
            return Err(invalid(&self.name, "set either password or password_env, not both"));
        }
        Ok(())
    }
}

impl RelationalEntry {
    /// The parsed engine
    pub fn engine(&self) -> Result<Engine, ConfigError> {
        self.engine
            .parse::<Engine>()
            .map_err(|e| invalid(&self.name, &e.to_string()))
    }

    /// Factory configuration, with the password resolved
    pub fn to_backend(&self, pool: &PoolDefaults) -> Result<RelationalConfig, ConfigError> {
        let password =
            resolve_secret(&self.name, self.password.as_deref(), self.password_env.as_deref())?;
        Ok(RelationalConfig {
            engine: self.engine()?,
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: password.unwrap_or_default(),
            database: self.database.clone(),
            databases: self.databases.clone(),
            application_name: self.application_name.clone(),
            require_tls: self.require_tls,
            connect_timeout: pool.connect_timeout(),
        })
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.engine()?;
        if self.host.is_empty() {
            return Err(invalid(&self.name, "host cannot be empty"));
        }
        if self.user.is_empty() {
            return Err(invalid(&self.name, "user cannot be empty"));
        }
        for label in &self.labels {
            if !self.databases.contains_key(label) {
                return Err(invalid(
                    &self.name,
                    &format!("label '{}' has no entry in databases", label),
                ));
            }
        }
        if self.password.is_some() && self.password_env.is_some() {
            return Err(invalid(&self.name, "set either password or password_env, not both"));
        }
        Ok(())
    }
}

/// Factory configuration for either triple-store mode
#[derive(Debug, Clone)]
pub enum TripleStoreBackend {
    /// Local dataset
    Local(LocalDatasetConfig),
    /// Remote endpoint
    Remote(SparqlEndpointConfig),
}

impl TripleStoreEntry {
    /// Factory configuration, with the password resolved
    pub fn to_backend(&self, pool: &PoolDefaults) -> Result<TripleStoreBackend, ConfigError> {
        match self.mode {
            TripleStoreMode::Local => {
                let location = self
                    .location
                    .clone()
                    .ok_or_else(|| invalid(&self.name, "local mode requires location"))?;
                Ok(TripleStoreBackend::Local(LocalDatasetConfig {
                    location,
                    create_if_missing: self.create_if_missing,
                }))
            }
            TripleStoreMode::Remote => {
                let endpoint = self
                    .endpoint
                    .clone()
                    .ok_or_else(|| invalid(&self.name, "remote mode requires endpoint"))?;
                let password = resolve_secret(
                    &self.name,
                    self.password.as_deref(),
                    self.password_env.as_deref(),
                )?;
                Ok(TripleStoreBackend::Remote(SparqlEndpointConfig {
                    query_url: endpoint,
                    update_url: self.update_endpoint.clone(),
                    username: self.username.clone(),
                    password,
                    timeout: pool.connect_timeout(),
                    use_system_proxy: true,
                }))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            TripleStoreMode::Local => {
                if self.location.is_none() {
                    return Err(invalid(&self.name, "local mode requires location"));
                }
                if self.endpoint.is_some() || self.update_endpoint.is_some() {
                    return Err(invalid(&self.name, "endpoints are only used in remote mode"));
                }
            }
            TripleStoreMode::Remote => {
                if self.endpoint.as_deref().map_or(true, str::is_empty) {
                    return Err(invalid(&self.name, "remote mode requires endpoint"));
                }
                if self.location.is_some() {
                    return Err(invalid(&self.name, "location is only used in local mode"));
                }
            }
        }
        for graph in &self.graphs {
            validate_graph(&Label::new(graph)).map_err(|e| invalid(&self.name, &e.to_string()))?;
        }
        if self.password.is_some() && self.password_env.is_some() {
            return Err(invalid(&self.name, "set either password or password_env, not both"));
        }
        Ok(())
    }
}

fn invalid(backend: &str, message: &str) -> ConfigError {
    ConfigError::Invalid(format!("backend '{}': {}", backend, message))
}

impl HarvestConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("{}: {}", path.display(), e)))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse configuration file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse without validating
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseFailed(e.to_string()).into())
    }

    /// Every backend as (kind, name, pool size)
    pub fn backends(&self) -> Vec<(&'static str, &str, usize)> {
        let directories = self
            .directory
            .iter()
            .map(|d| ("directory", d.name.as_str(), d.pool_size));
        let relational = self
            .relational
            .iter()
            .map(|r| ("relational", r.name.as_str(), r.pool_size));
        let triple_stores = self
            .triple_store
            .iter()
            .map(|t| ("triple_store", t.name.as_str(), t.pool_size));
        directories.chain(relational).chain(triple_stores).collect()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.acquire_timeout_ms == 0 {
            return Err(ConfigError::Invalid("acquire_timeout_ms cannot be zero".to_string()).into());
        }
        if self.pool.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("connect_timeout_ms cannot be zero".to_string()).into());
        }
        if self.pool.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".to_string()).into());
        }

        let backends = self.backends();
        if backends.is_empty() {
            warn!("Configuration defines no backends");
        }

        let mut names = HashSet::new();
        for (kind, name, pool_size) in backends {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("a {} backend has no name", kind)).into());
            }
            if !names.insert(name) {
                return Err(ConfigError::Invalid(format!("duplicate backend name '{}'", name)).into());
            }
            if pool_size == 0 {
                return Err(invalid(name, "pool_size must be greater than 0").into());
            }
        }

        for entry in &self.directory {
            entry.validate()?;
        }
        for entry in &self.relational {
            entry.validate()?;
        }
        for entry in &self.triple_store {
            entry.validate()?;
        }

        Ok(())
    }
}
