pub mod conversations;
pub mod messages;
pub mod read_states;
pub mod relationships;

use sqlx::any::AnyPoolOptions;
use std::sync::OnceLock;
use thiserror::Error;

pub type DbPool = sqlx::AnyPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseEngine {
    Sqlite,
    Postgres,
}

impl DatabaseEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

static ACTIVE_DB_ENGINE: OnceLock<DatabaseEngine> = OnceLock::new();

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl DbError {
    /// Pool exhaustion, I/O and closed-pool failures are worth retrying; constraint
    /// violations and decode errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DbError::Sqlx(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::WorkerCrashed
            ) || matches!(err, sqlx::Error::Database(db) if is_busy_code(db.code().as_deref())),
            DbError::NotFound | DbError::Corrupt(_) => false,
        }
    }
}

fn is_busy_code(code: Option<&str>) -> bool {
    // SQLITE_BUSY / SQLITE_LOCKED, postgres serialization_failure / deadlock_detected.
    matches!(code, Some("5") | Some("6") | Some("40001") | Some("40P01"))
}

/// Optional tuning knobs applied after each PostgreSQL connection is established.
#[derive(Debug, Clone, Default)]
pub struct PgConnectOptions {
    /// `statement_timeout` in seconds (0 = disabled).
    pub statement_timeout_secs: u64,
}

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, sqlx::Error> {
    create_pool_full(database_url, max_connections, None).await
}

pub async fn create_pool_full(
    database_url: &str,
    max_connections: u32,
    pg_options: Option<PgConnectOptions>,
) -> Result<DbPool, sqlx::Error> {
    let engine = detect_database_engine(database_url)?;
    let _ = ACTIVE_DB_ENGINE.set(engine);

    // Required once before using sqlx::Any.
    sqlx::any::install_default_drivers();

    let connect_url = if matches!(engine, DatabaseEngine::Sqlite) {
        normalize_sqlite_url_for_any(database_url)
    } else {
        database_url.to_string()
    };

    let pg_opts = pg_options.unwrap_or_default();
    AnyPoolOptions::new()
        .max_connections(max_connections)
        .after_connect(move |conn, _meta| {
            let statements = session_statements(engine, &pg_opts);
            Box::pin(async move {
                for sql in &statements {
                    sqlx::query(sql).execute(&mut *conn).await?;
                }
                Ok(())
            })
        })
        .connect(&connect_url)
        .await
}

/// Per-connection setup. SQLite gets WAL and a busy timeout so concurrent
/// writers queue instead of failing; PostgreSQL gets bounded lock waits.
fn session_statements(engine: DatabaseEngine, pg_opts: &PgConnectOptions) -> Vec<String> {
    match engine {
        DatabaseEngine::Sqlite => [
            "PRAGMA journal_mode = WAL",
            "PRAGMA foreign_keys = ON",
            "PRAGMA busy_timeout = 5000",
            "PRAGMA synchronous = NORMAL",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
        DatabaseEngine::Postgres => {
            let mut statements = Vec::new();
            if pg_opts.statement_timeout_secs > 0 {
                statements.push(format!(
                    "SET statement_timeout = '{}s'",
                    pg_opts.statement_timeout_secs
                ));
            }
            statements.push("SET lock_timeout = '10s'".to_string());
            statements.push("SET timezone = 'UTC'".to_string());
            statements
        }
    }
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    run_migrations_for_engine(pool, active_database_engine()).await
}

pub async fn run_migrations_for_engine(
    pool: &DbPool,
    engine: DatabaseEngine,
) -> Result<(), sqlx::Error> {
    match engine {
        DatabaseEngine::Sqlite => sqlx::migrate!("./migrations").run(pool).await?,
        DatabaseEngine::Postgres => sqlx::migrate!("./migrations_pg").run(pool).await?,
    }
    tracing::info!(engine = engine.as_str(), "migrations: applied successfully");
    Ok(())
}

pub fn detect_database_engine(database_url: &str) -> Result<DatabaseEngine, sqlx::Error> {
    let normalized = database_url.trim().to_ascii_lowercase();
    if normalized.starts_with("sqlite:") {
        Ok(DatabaseEngine::Sqlite)
    } else if normalized.starts_with("postgres://") || normalized.starts_with("postgresql://") {
        Ok(DatabaseEngine::Postgres)
    } else {
        Err(sqlx::Error::Configuration(
            format!("unsupported database URL scheme in '{}'", database_url).into(),
        ))
    }
}

pub fn active_database_engine() -> DatabaseEngine {
    *ACTIVE_DB_ENGINE.get().unwrap_or(&DatabaseEngine::Sqlite)
}

fn normalize_sqlite_url_for_any(url: &str) -> String {
    // sqlx::Any expects absolute Windows paths in the sqlite:///C:/... form.
    if !url.starts_with("sqlite://") {
        return url.to_string();
    }
    let rest = &url["sqlite://".len()..];
    if rest.starts_with('/') {
        return url.to_string();
    }
    let bytes = rest.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        format!("sqlite:///{rest}")
    } else {
        url.to_string()
    }
}

pub(crate) fn datetime_to_db_text(value: chrono::DateTime<chrono::Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub(crate) fn datetime_from_db_text(
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, sqlx::Error> {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    Err(sqlx::Error::Protocol(format!(
        "invalid datetime text '{}'",
        value
    )))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::{create_pool, run_migrations, DbPool};

    /// Single-connection in-memory database with the schema applied.
    pub async fn memory_pool() -> DbPool {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        run_migrations(&pool).await.expect("migrations");
        pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pool_supports_default_sqlite_mode() {
        let pool = create_pool("sqlite::memory:", 1).await.expect("pool");
        let value: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&pool)
            .await
            .expect("query");
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn migrations_apply_twice() {
        let pool = test_support::memory_pool().await;
        run_migrations(&pool).await.expect("second run is a no-op");
    }

    #[test]
    fn rejects_unknown_url_scheme() {
        assert!(detect_database_engine("mysql://localhost/db").is_err());
        assert_eq!(
            detect_database_engine("postgresql://localhost/db").unwrap(),
            DatabaseEngine::Postgres
        );
    }

    #[test]
    fn postgres_statement_timeout_is_optional() {
        let plain = session_statements(DatabaseEngine::Postgres, &PgConnectOptions::default());
        assert!(plain.iter().all(|s| !s.contains("statement_timeout")));
        let bounded = session_statements(
            DatabaseEngine::Postgres,
            &PgConnectOptions {
                statement_timeout_secs: 15,
            },
        );
        assert_eq!(bounded[0], "SET statement_timeout = '15s'");
    }

    #[test]
    fn windows_sqlite_paths_gain_third_slash() {
        assert_eq!(
            normalize_sqlite_url_for_any("sqlite://C:/data/parley.db"),
            "sqlite:///C:/data/parley.db"
        );
        assert_eq!(
            normalize_sqlite_url_for_any("sqlite://./data/parley.db"),
            "sqlite://./data/parley.db"
        );
    }

    #[test]
    fn datetimes_round_trip_with_millis() {
        let now = chrono::Utc::now();
        let parsed = datetime_from_db_text(&datetime_to_db_text(now)).unwrap();
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn closed_pool_errors_are_transient() {
        let pool = test_support::memory_pool().await;
        pool.close().await;
        let err = sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(DbError::from)
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!DbError::NotFound.is_transient());
    }
}
