//! MySQL and MariaDB logins through sqlx.

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlSslMode};
use sqlx::ConnectOptions;

use harvest_pool::FactoryError;

use super::{driver_error, RelationalConfig};
use crate::endpoint::Endpoint;

const ER_CON_COUNT_ERROR: u16 = 1040;
const ER_DBACCESS_DENIED: u16 = 1044;
const ER_ACCESS_DENIED: u16 = 1045;
const ER_BAD_DB: u16 = 1049;
const ER_SERVER_SHUTDOWN: u16 = 1053;
const ER_HOST_IS_BLOCKED: u16 = 1129;
const ER_HOST_NOT_PRIVILEGED: u16 = 1130;
const ER_USER_LIMIT_REACHED: u16 = 1226;

fn options(config: &RelationalConfig, endpoint: &Endpoint, database: &str) -> MySqlConnectOptions {
    let ssl_mode = if config.require_tls {
        MySqlSslMode::Required
    } else {
        MySqlSslMode::Preferred
    };
    MySqlConnectOptions::new()
        .host(&endpoint.host)
        .port(endpoint.port)
        .username(&config.user)
        .password(&config.password)
        .database(database)
        .ssl_mode(ssl_mode)
        .disable_statement_logging()
}

/// Log in and read the server version
pub(super) async fn connect(
    config: &RelationalConfig,
    endpoint: &Endpoint,
    database: &str,
) -> Result<(MySqlConnection, Option<String>), FactoryError> {
    let context = format!("logging in to MySQL at {} as '{}'", endpoint, config.user);
    let mut conn = options(config, endpoint, database)
        .connect()
        .await
        .map_err(|e| classify(&context, e))?;

    let version = sqlx::query_scalar::<_, String>("SELECT VERSION()")
        .fetch_one(&mut conn)
        .await
        .ok();
    Ok((conn, version))
}

/// Map a sqlx error using the MySQL server error number
pub(super) fn classify(context: &str, e: sqlx::Error) -> FactoryError {
    let db = match e {
        sqlx::Error::Database(db) => db,
        other => return driver_error(context, other),
    };
    let message = format!("{}: {}", context, db.message());

    match db.try_downcast_ref::<MySqlDatabaseError>().map(MySqlDatabaseError::number) {
        Some(ER_ACCESS_DENIED | ER_DBACCESS_DENIED | ER_HOST_IS_BLOCKED | ER_HOST_NOT_PRIVILEGED) => {
            FactoryError::Auth(message)
        }
        Some(ER_BAD_DB) => FactoryError::Config(message),
        Some(ER_CON_COUNT_ERROR | ER_USER_LIMIT_REACHED | ER_SERVER_SHUTDOWN) => {
            FactoryError::Unavailable(message)
        }
        _ => FactoryError::Protocol(message),
    }
}
