//! SQL Server logins through tiberius.

use std::io;

use harvest_pool::FactoryError;
use tiberius::error::Error;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use super::RelationalConfig;
use crate::endpoint::{classify_io, Endpoint};

/// A SQL Server client over a tokio socket
pub type SqlServerClient = Client<Compat<TcpStream>>;

const CANNOT_OPEN_DATABASE: u32 = 4060;
const UNTRUSTED_DOMAIN: u32 = 18452;
const LOGIN_FAILED: u32 = 18456;
const PASSWORD_EXPIRED: u32 = 18487;
const PASSWORD_MUST_CHANGE: u32 = 18488;
const SERVER_PAUSED: u32 = 17142;
const TOO_MANY_CONNECTIONS: u32 = 17809;

const VERSION_QUERY: &str = "SELECT CAST(SERVERPROPERTY('ProductVersion') AS NVARCHAR(128))";

fn tds_config(config: &RelationalConfig, endpoint: &Endpoint, database: &str) -> Config {
    let mut tds = Config::new();
    tds.host(&endpoint.host);
    tds.port(endpoint.port);
    tds.database(database);
    tds.application_name(&config.application_name);
    tds.authentication(AuthMethod::sql_server(&config.user, &config.password));
    tds.encryption(if config.require_tls {
        EncryptionLevel::Required
    } else {
        EncryptionLevel::NotSupported
    });
    tds
}

/// Connect, log in and read the product version
pub(super) async fn connect(
    config: &RelationalConfig,
    endpoint: &Endpoint,
    database: &str,
) -> Result<(SqlServerClient, Option<String>), FactoryError> {
    let context = format!("logging in to SQL Server at {} as '{}'", endpoint, config.user);
    let tds = tds_config(config, endpoint, database);

    let tcp = TcpStream::connect(tds.get_addr())
        .await
        .map_err(|e| classify_io(&context, e))?;
    tcp.set_nodelay(true)?;

    let mut client = Client::connect(tds, tcp.compat_write())
        .await
        .map_err(|e| classify(&context, e))?;
    let version = server_version(&mut client).await;
    Ok((client, version))
}

async fn server_version(client: &mut SqlServerClient) -> Option<String> {
    let row = client.simple_query(VERSION_QUERY).await.ok()?.into_row().await.ok()??;
    row.get::<&str, _>(0).map(str::to_string)
}

pub(super) async fn ping(client: &mut SqlServerClient) -> Result<(), FactoryError> {
    client
        .simple_query("SELECT 1")
        .await
        .map_err(|e| classify("ping", e))?
        .into_results()
        .await
        .map(|_| ())
        .map_err(|e| classify("ping", e))
}

pub(super) async fn execute(client: &mut SqlServerClient, sql: &str) -> Result<u64, FactoryError> {
    client
        .execute(sql, &[])
        .await
        .map(|result| result.total())
        .map_err(|e| classify("statement", e))
}

pub(super) async fn close(client: SqlServerClient) -> Result<(), FactoryError> {
    client.close().await.map_err(|e| classify("close", e))
}

/// Map a tiberius error; server errors go by their message number
pub(super) fn classify(context: &str, e: Error) -> FactoryError {
    match e {
        Error::Server(token) => server_error(context, token.code(), token.message()),
        Error::Io { kind, message } => classify_io(context, io::Error::new(kind, message)),
        Error::Tls(message) => {
            FactoryError::Config(format!("{}: TLS negotiation failed: {}", context, message))
        }
        Error::Routing { host, port } => FactoryError::Unavailable(format!(
            "{}: server redirected the client to {}:{}",
            context, host, port
        )),
        other => FactoryError::Protocol(format!("{}: {}", context, other)),
    }
}

fn server_error(context: &str, code: u32, message: &str) -> FactoryError {
    let message = format!("{}: {} (error {})", context, message, code);
    match code {
        LOGIN_FAILED | UNTRUSTED_DOMAIN | PASSWORD_EXPIRED | PASSWORD_MUST_CHANGE => {
            FactoryError::Auth(message)
        }
        CANNOT_OPEN_DATABASE => FactoryError::Config(message),
        SERVER_PAUSED | TOO_MANY_CONNECTIONS => FactoryError::Unavailable(message),
        _ => FactoryError::Protocol(message),
    }
}
