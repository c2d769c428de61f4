//! PostgreSQL logins through sqlx.

use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::ConnectOptions;

use harvest_pool::FactoryError;

use super::{driver_error, RelationalConfig};
use crate::endpoint::Endpoint;

fn options(config: &RelationalConfig, endpoint: &Endpoint, database: &str) -> PgConnectOptions {
    let ssl_mode = if config.require_tls {
        PgSslMode::Require
    } else {
        PgSslMode::Prefer
    };
    PgConnectOptions::new_without_pgpass()
        .host(&endpoint.host)
        .port(endpoint.port)
        .username(&config.user)
        .password(&config.password)
        .database(database)
        .application_name(&config.application_name)
        .ssl_mode(ssl_mode)
        .disable_statement_logging()
}

/// Log in; the server version comes from the startup parameters
pub(super) async fn connect(
    config: &RelationalConfig,
    endpoint: &Endpoint,
    database: &str,
) -> Result<(PgConnection, Option<String>), FactoryError> {
    let context = format!("logging in to PostgreSQL at {} as '{}'", endpoint, config.user);
    let conn = options(config, endpoint, database)
        .connect()
        .await
        .map_err(|e| classify(&context, e))?;

    let version = conn.server_version_num().map(format_version);
    Ok((conn, version))
}

/// `160002` -> `16.2`, `90624` -> `9.6.24`
fn format_version(num: u32) -> String {
    if num >= 100_000 {
        format!("{}.{}", num / 10_000, num % 10_000)
    } else {
        format!("{}.{}.{}", num / 10_000, (num / 100) % 100, num % 100)
    }
}

/// Map a sqlx error using the SQLSTATE the server reported
pub(super) fn classify(context: &str, e: sqlx::Error) -> FactoryError {
    let db = match e {
        sqlx::Error::Database(db) => db,
        other => return driver_error(context, other),
    };
    let code = db.code().map(|code| code.into_owned()).unwrap_or_default();
    let message = format!("{}: {} (SQLSTATE {})", context, db.message(), code);

    match code.as_str() {
        // authorization failures, including invalid_password
        c if c.starts_with("28") => FactoryError::Auth(message),
        // invalid_catalog_name
        "3D000" => FactoryError::Config(message),
        // too_many_connections, admin_shutdown, cannot_connect_now
        "53300" | "57P01" | "57P03" => FactoryError::Unavailable(message),
        _ => FactoryError::Protocol(message),
    }
}
