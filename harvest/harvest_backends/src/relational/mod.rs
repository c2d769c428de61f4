//! Relational database sessions for MySQL, PostgreSQL and SQL Server.
//!
//! Every handle is an authenticated driver connection: `sqlx` for MySQL and
//! PostgreSQL, `tiberius` for SQL Server. The factory owns a small tokio
//! runtime that drives them, so the pool and its callers stay blocking.
//! An unreachable server, an unknown database or rejected credentials
//! surface as factory errors at warm-up rather than on first use.

mod mssql;
mod mysql;
mod postgres;

use log::{debug, trace};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use harvest_pool::{Factory, FactoryError, Label};
use sqlx::{Connection, Executor, MySqlConnection, PgConnection};
use tokio::runtime::{Handle, Runtime};

use crate::endpoint::{classify_io, Endpoint, DEFAULT_CONNECT_TIMEOUT};

pub use mssql::SqlServerClient;

/// Supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    /// MySQL or MariaDB
    MySql,
    /// PostgreSQL
    Postgres,
    /// Microsoft SQL Server
    SqlServer,
}

impl Engine {
    /// The engine's well-known port
    pub fn default_port(self) -> u16 {
        match self {
            Engine::MySql => 3306,
            Engine::Postgres => 5432,
            Engine::SqlServer => 1433,
        }
    }

    /// Canonical configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::MySql => "mysql",
            Engine::Postgres => "postgres",
            Engine::SqlServer => "mssql",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = FactoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" | "mariadb" => Ok(Engine::MySql),
            "postgres" | "postgresql" => Ok(Engine::Postgres),
            "mssql" | "sqlserver" => Ok(Engine::SqlServer),
            other => Err(FactoryError::Config(format!("unknown database engine '{}'", other))),
        }
    }
}

/// Connection parameters for one database server
#[derive(Debug, Clone)]
pub struct RelationalConfig {
    /// Database engine
    pub engine: Engine,

    /// Server host
    pub host: String,

    /// Server port; the engine default when `None`
    pub port: Option<u16>,

    /// Login user
    pub user: String,

    /// Login password
    pub password: String,

    /// Database for unlabeled connections
    pub database: String,

    /// Logical databases selectable by label
    pub databases: BTreeMap<String, String>,

    /// Reported to the server where the protocol allows it
    pub application_name: String,

    /// Refuse servers that cannot encrypt the connection
    pub require_tls: bool,

    /// Timeout for connecting and logging in, and for each health check
    pub connect_timeout: Duration,
}

impl RelationalConfig {
    /// Configuration with default port, timeout and application name
    pub fn new(
        engine: Engine,
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            host: host.into(),
            port: None,
            user: user.into(),
            password: String::new(),
            database: database.into(),
            databases: BTreeMap::new(),
            application_name: "harvest".to_string(),
            require_tls: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Opens authenticated database sessions for one server.
///
/// The factory blocks on its own runtime, so it must not be called from
/// inside an async context.
#[derive(Debug)]
pub struct RelationalFactory {
    config: RelationalConfig,
    endpoint: Endpoint,
    runtime: Arc<Runtime>,
}

impl RelationalFactory {
    /// Create a factory for the configured server
    pub fn new(config: RelationalConfig) -> Result<Self, FactoryError> {
        if config.user.is_empty() {
            return Err(FactoryError::Config(format!(
                "{} server {}: user must not be empty",
                config.engine, config.host
            )));
        }
        let port = config.port.unwrap_or_else(|| config.engine.default_port());
        let endpoint = Endpoint::new(config.host.clone(), port)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(format!("harvest-{}", config.engine))
            .enable_all()
            .build()?;

        Ok(Self {
            config,
            endpoint,
            runtime: Arc::new(runtime),
        })
    }

    /// The database engine
    pub fn engine(&self) -> Engine {
        self.config.engine
    }

    /// The server address
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The logical database a label selects
    pub fn database_for(&self, label: &Label) -> Result<&str, FactoryError> {
        if label.is_unlabeled() {
            return Ok(&self.config.database);
        }
        self.config
            .databases
            .get(label.as_str())
            .map(String::as_str)
            .ok_or_else(|| {
                FactoryError::Config(format!(
                    "no database configured for label '{}' on {}",
                    label, self.endpoint
                ))
            })
    }

    async fn open(&self, database: &str) -> Result<(Driver, Option<String>), FactoryError> {
        match self.config.engine {
            Engine::MySql => {
                let (conn, version) = mysql::connect(&self.config, &self.endpoint, database).await?;
                Ok((Driver::MySql(conn), version))
            }
            Engine::Postgres => {
                let (conn, version) =
                    postgres::connect(&self.config, &self.endpoint, database).await?;
                Ok((Driver::Postgres(conn), version))
            }
            Engine::SqlServer => {
                let (client, version) =
                    mssql::connect(&self.config, &self.endpoint, database).await?;
                Ok((Driver::SqlServer(Box::new(client)), version))
            }
        }
    }
}

impl Factory for RelationalFactory {
    type Handle = RelationalConnection;

    fn create(&self, label: &Label) -> Result<RelationalConnection, FactoryError> {
        let database = self.database_for(label)?.to_string();
        let timeout = self.config.connect_timeout;

        let (driver, server_version) =
            within(&self.runtime, timeout, self.open(&database)).map_err(|_| {
                FactoryError::Unavailable(format!(
                    "connecting to {} server {} timed out after {:?}",
                    self.config.engine, self.endpoint, timeout
                ))
            })??;

        debug!(
            "Opened {} session to {} (database '{}', server {})",
            self.config.engine,
            self.endpoint,
            database,
            server_version.as_deref().unwrap_or("unknown")
        );

        Ok(RelationalConnection {
            engine: self.config.engine,
            database,
            server_version,
            timeout,
            broken: false,
            driver,
            runtime: Arc::clone(&self.runtime),
        })
    }

    fn is_valid(&self, handle: &mut RelationalConnection) -> bool {
        if handle.broken {
            return false;
        }
        match handle.ping() {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    "{} session to {} failed its ping: {}",
                    handle.engine, self.endpoint, e
                );
                false
            }
        }
    }

    fn close(&self, handle: RelationalConnection) {
        let RelationalConnection {
            engine,
            database,
            timeout,
            driver,
            ..
        } = handle;

        match within(&self.runtime, timeout, driver.close()) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!("Closing {} session to {} failed: {}", engine, self.endpoint, e),
            Err(_) => trace!("Closing {} session to {} timed out", engine, self.endpoint),
        }
        debug!(
            "Closed {} session to {} (database '{}')",
            engine, self.endpoint, database
        );
    }
}

/// Run `future` on `runtime`, giving up after `timeout`
fn within<F: Future>(
    runtime: &Runtime,
    timeout: Duration,
    future: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    runtime.block_on(async { tokio::time::timeout(timeout, future).await })
}

/// The engine-specific connection inside a handle
enum Driver {
    MySql(MySqlConnection),
    Postgres(PgConnection),
    SqlServer(Box<SqlServerClient>),
}

impl Driver {
    async fn ping(&mut self) -> Result<(), FactoryError> {
        match self {
            Driver::MySql(conn) => conn.ping().await.map_err(|e| mysql::classify("ping", e)),
            Driver::Postgres(conn) => conn.ping().await.map_err(|e| postgres::classify("ping", e)),
            Driver::SqlServer(client) => mssql::ping(client).await,
        }
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, FactoryError> {
        match self {
            Driver::MySql(conn) => (&mut *conn)
                .execute(sql)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| mysql::classify("statement", e)),
            Driver::Postgres(conn) => (&mut *conn)
                .execute(sql)
                .await
                .map(|done| done.rows_affected())
                .map_err(|e| postgres::classify("statement", e)),
            Driver::SqlServer(client) => mssql::execute(client, sql).await,
        }
    }

    async fn close(self) -> Result<(), FactoryError> {
        match self {
            Driver::MySql(conn) => conn.close().await.map_err(|e| mysql::classify("close", e)),
            Driver::Postgres(conn) => conn.close().await.map_err(|e| postgres::classify("close", e)),
            Driver::SqlServer(client) => mssql::close(*client).await,
        }
    }
}

/// An authenticated session to a database server
pub struct RelationalConnection {
    engine: Engine,
    database: String,
    server_version: Option<String>,
    timeout: Duration,
    broken: bool,
    driver: Driver,
    runtime: Arc<Runtime>,
}

impl RelationalConnection {
    /// The database engine
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// The logical database this session targets
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Server version reported after login
    pub fn server_version(&self) -> Option<&str> {
        self.server_version.as_deref()
    }

    /// Runtime handle for driving the connection directly
    pub fn runtime(&self) -> Handle {
        self.runtime.handle().clone()
    }

    /// The MySQL connection, if this is a MySQL session
    pub fn mysql(&mut self) -> Option<&mut MySqlConnection> {
        match &mut self.driver {
            Driver::MySql(conn) => Some(conn),
            _ => None,
        }
    }

    /// The PostgreSQL connection, if this is a PostgreSQL session
    pub fn postgres(&mut self) -> Option<&mut PgConnection> {
        match &mut self.driver {
            Driver::Postgres(conn) => Some(conn),
            _ => None,
        }
    }

    /// The SQL Server client, if this is a SQL Server session
    pub fn sql_server(&mut self) -> Option<&mut SqlServerClient> {
        match &mut self.driver {
            Driver::SqlServer(client) => Some(client),
            _ => None,
        }
    }

    /// Round trip to the server; a failure flags the session broken
    pub fn ping(&mut self) -> Result<(), FactoryError> {
        let Self {
            runtime,
            driver,
            timeout,
            ..
        } = &mut *self;
        let result = within(runtime, *timeout, driver.ping()).unwrap_or_else(|_| {
            Err(FactoryError::Unavailable(format!(
                "ping timed out after {:?}",
                timeout
            )))
        });
        if result.is_err() {
            self.broken = true;
        }
        result
    }

    /// Run a statement and return the number of affected rows.
    ///
    /// A failure that is not the server rejecting the statement flags the
    /// session broken.
    pub fn execute(&mut self, sql: &str) -> Result<u64, FactoryError> {
        let Self {
            runtime, driver, ..
        } = &mut *self;
        let result = runtime.block_on(driver.execute(sql));
        if let Err(e) = &result {
            if !matches!(e, FactoryError::Config(_) | FactoryError::Protocol(_)) {
                self.broken = true;
            }
        }
        result
    }

    /// Flag the session so the pool discards it
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the session was flagged as unusable
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl fmt::Debug for RelationalConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalConnection")
            .field("engine", &self.engine)
            .field("database", &self.database)
            .field("server_version", &self.server_version)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// Map a driver failure that carries no server error code
fn driver_error(context: &str, e: sqlx::Error) -> FactoryError {
    match e {
        sqlx::Error::Io(e) => classify_io(context, e),
        sqlx::Error::Configuration(e) | sqlx::Error::Tls(e) => {
            FactoryError::Config(format!("{}: {}", context, e))
        }
        sqlx::Error::PoolTimedOut => FactoryError::Unavailable(format!("{}: timed out", context)),
        other => FactoryError::Protocol(format!("{}: {}", context, other)),
    }
}
