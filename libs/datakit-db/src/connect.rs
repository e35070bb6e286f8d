//! Connecting to `SQLite`, `PostgreSQL` or `MySQL` through `SeaORM`.

use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection, DbBackend};
use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Database engine, detected from the DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Sqlite,
    Postgres,
    MySql,
}

impl Engine {
    /// # Errors
    /// Returns [`DbError::UnknownEngine`] for any other scheme.
    pub fn from_dsn(dsn: &str) -> Result<Self, DbError> {
        let scheme = dsn.split_once(':').map_or(dsn, |(s, _)| s);
        match scheme.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            other => Err(DbError::UnknownEngine(other.to_owned())),
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
        }
    }

    #[must_use]
    pub fn backend(self) -> DbBackend {
        match self {
            Self::Sqlite => DbBackend::Sqlite,
            Self::Postgres => DbBackend::Postgres,
            Self::MySql => DbBackend::MySql,
        }
    }

    /// Largest number of bind parameters a single statement may carry.
    #[must_use]
    pub fn max_bind_params(self) -> usize {
        match self {
            Self::Sqlite => 32_766,
            Self::Postgres | Self::MySql => 65_535,
        }
    }

    fn enabled(self) -> bool {
        match self {
            Self::Sqlite => cfg!(feature = "sqlite"),
            Self::Postgres => cfg!(feature = "pg"),
            Self::MySql => cfg!(feature = "mysql"),
        }
    }
}

impl From<DbBackend> for Engine {
    fn from(backend: DbBackend) -> Self {
        match backend {
            DbBackend::Sqlite => Self::Sqlite,
            DbBackend::Postgres => Self::Postgres,
            DbBackend::MySql => Self::MySql,
        }
    }
}

/// Pool settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConnectOpts {
    #[serde(default)]
    pub max_conns: Option<u32>,
    #[serde(default)]
    pub min_conns: Option<u32>,
    /// Seconds to wait for a pooled connection.
    #[serde(default)]
    pub acquire_timeout_secs: Option<u64>,
    /// Let the driver log every statement.
    #[serde(default)]
    pub sqlx_logging: bool,
}

/// An open connection pool and the engine behind it.
#[derive(Debug, Clone)]
pub struct Db {
    conn: DatabaseConnection,
    engine: Engine,
}

impl Db {
    #[must_use]
    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    #[must_use]
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// # Errors
    /// Returns the driver error if the pool cannot be closed cleanly.
    pub async fn close(self) -> Result<(), DbError> {
        self.conn.close().await?;
        Ok(())
    }
}

/// Open a pool for `dsn`.
///
/// # Errors
/// - [`DbError::UnknownEngine`] for an unrecognised scheme
/// - [`DbError::EngineDisabled`] when the matching feature is off
/// - [`DbError::InvalidConfig`] when `min_conns` exceeds `max_conns`
/// - [`DbError::Sea`] when the driver cannot connect
pub async fn connect_db(dsn: &str, opts: ConnectOpts) -> Result<Db, DbError> {
    let engine = Engine::from_dsn(dsn)?;
    if !engine.enabled() {
        return Err(DbError::EngineDisabled(engine.name()));
    }
    if let (Some(min), Some(max)) = (opts.min_conns, opts.max_conns)
        && min > max
    {
        return Err(DbError::InvalidConfig(format!(
            "min_conns ({min}) exceeds max_conns ({max})"
        )));
    }

    let mut options = ConnectOptions::new(dsn.to_owned());
    options.sqlx_logging(opts.sqlx_logging);
    if let Some(max) = opts.max_conns {
        options.max_connections(max);
    }
    if let Some(min) = opts.min_conns {
        options.min_connections(min);
    }
    if let Some(secs) = opts.acquire_timeout_secs {
        options.acquire_timeout(Duration::from_secs(secs));
    }

    tracing::info!(
        engine = engine.name(),
        dsn = %redact_credentials_in_dsn(Some(dsn)),
        "connecting to database"
    );
    let conn = Database::connect(options).await?;
    Ok(Db { conn, engine })
}

/// DSN safe for logs: the password, if any, is masked.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    let Some(dsn) = dsn else {
        return "<none>".to_owned();
    };
    match url::Url::parse(dsn) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                "<redacted>".to_owned()
            }
        }
        Ok(_) => dsn.to_owned(),
        Err(_) if dsn.contains('@') => "<redacted>".to_owned(),
        Err(_) => dsn.to_owned(),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn engine_is_detected_from_scheme() {
        assert_eq!(Engine::from_dsn("sqlite::memory:").unwrap(), Engine::Sqlite);
        assert_eq!(
            Engine::from_dsn("postgresql://u:p@localhost/db").unwrap(),
            Engine::Postgres
        );
        assert_eq!(Engine::from_dsn("mysql://localhost/db").unwrap(), Engine::MySql);
        assert!(matches!(
            Engine::from_dsn("oracle://x"),
            Err(DbError::UnknownEngine(s)) if s == "oracle"
        ));
    }

    #[test]
    fn passwords_are_masked() {
        let redacted = redact_credentials_in_dsn(Some("postgres://app:s3cret@db:5432/main"));
        assert!(!redacted.contains("s3cret"));
        assert!(redacted.contains("app:***@db"));

        assert_eq!(redact_credentials_in_dsn(Some("sqlite::memory:")), "sqlite::memory:");
        assert_eq!(redact_credentials_in_dsn(None), "<none>");
    }

    #[test]
    fn connect_opts_reject_unknown_keys() {
        let err = serde_json::from_str::<ConnectOpts>(r#"{"max_conn": 4}"#).unwrap_err();
        assert!(err.to_string().contains("max_conn"));
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    #[tracing_test::traced_test]
    async fn connect_logs_the_engine() {
        let db = connect_db("sqlite::memory:", ConnectOpts::default()).await.unwrap();
        assert_eq!(db.engine(), Engine::Sqlite);
        assert!(logs_contain("connecting to database"));
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn inverted_pool_bounds_fail_before_connecting() {
        let opts = ConnectOpts {
            max_conns: Some(1),
            min_conns: Some(4),
            ..Default::default()
        };
        let err = connect_db("sqlite::memory:", opts).await.unwrap_err();
        // Either the engine is compiled out or the bounds are rejected; both
        // happen before any driver call.
        assert!(matches!(
            err,
            DbError::InvalidConfig(_) | DbError::EngineDisabled(_)
        ));
    }
}
