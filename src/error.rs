//! Error types for the RustResort persistence layer
//!
//! All errors leaving this crate are `DbError`. Backend-specific failures
//! (sqlx, SQLite native codes) are translated here so that callers only ever
//! match on this closed set of variants.

use std::borrow::Cow;

use thiserror::Error;

/// Persistence-wide error type
#[derive(Debug, Error)]
pub enum DbError {
    /// Missing or invalid connection parameters (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Liveness check or transport failure
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// Targeted entity does not exist
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// Unique constraint violated
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Malformed input (e.g. an unparseable mention token)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Schema migration failed (fatal, startup-blocking)
    #[error("Migration error: {0}")]
    Migration(String),

    /// Caller cancelled the request context
    #[error("Operation cancelled")]
    Cancelled,

    /// Request context deadline elapsed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Any other backend query failure, already rendered readable
    #[error("Query error: {0}")]
    Query(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DbError {
    /// Short label used for the error metric
    pub fn kind(&self) -> &'static str {
        match self {
            DbError::Config(_) => "config",
            DbError::Connectivity(_) => "connectivity",
            DbError::NotFound(_) => "not_found",
            DbError::AlreadyExists(_) => "already_exists",
            DbError::Validation(_) => "validation",
            DbError::Migration(_) => "migration",
            DbError::Cancelled => "cancelled",
            DbError::DeadlineExceeded => "deadline_exceeded",
            DbError::Query(_) => "query",
            DbError::Internal(_) => "internal",
        }
    }

    /// True for the two context-termination variants
    pub fn is_cancellation(&self) -> bool {
        matches!(self, DbError::Cancelled | DbError::DeadlineExceeded)
    }
}

impl From<config::ConfigError> for DbError {
    fn from(err: config::ConfigError) -> Self {
        DbError::Config(err.to_string())
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound("no rows in result set".to_string()),
            sqlx::Error::PoolTimedOut => {
                DbError::Connectivity("timed out acquiring a pooled connection".to_string())
            }
            sqlx::Error::PoolClosed => DbError::Connectivity("connection pool is closed".to_string()),
            sqlx::Error::Io(e) => DbError::Connectivity(e.to_string()),
            sqlx::Error::Tls(e) => DbError::Connectivity(format!("tls: {e}")),
            sqlx::Error::Configuration(e) => DbError::Config(e.to_string()),
            sqlx::Error::Database(db_err) => {
                let message = readable_database_message(db_err.as_ref());
                if db_err.is_unique_violation() {
                    DbError::AlreadyExists(message)
                } else {
                    DbError::Query(message)
                }
            }
            sqlx::Error::Migrate(e) => DbError::Migration(e.to_string()),
            other => DbError::Query(other.to_string()),
        }
    }
}

/// Render a backend error without requiring callers to know the backend.
///
/// SQLite reports numeric (extended) result codes; those are decoded into
/// their canonical names. PostgreSQL SQLSTATE codes are kept alongside the
/// server message.
fn readable_database_message(err: &dyn sqlx::error::DatabaseError) -> String {
    let code: Option<Cow<'_, str>> = err.code();
    if err.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
        if let Some(code) = code.as_deref().and_then(|c| c.parse::<i32>().ok()) {
            return format!("{} ({})", sqlite_error_code_string(code), err.message());
        }
    }
    match code {
        Some(code) => format!("{} (SQLSTATE {})", err.message(), code),
        None => err.message().to_string(),
    }
}

/// Readable name for a SQLite result code.
///
/// Extended codes are reduced to their primary code (low byte).
pub fn sqlite_error_code_string(code: i32) -> &'static str {
    match code {
        2067 => "SQLITE_CONSTRAINT_UNIQUE",
        1555 => "SQLITE_CONSTRAINT_PRIMARYKEY",
        787 => "SQLITE_CONSTRAINT_FOREIGNKEY",
        1299 => "SQLITE_CONSTRAINT_NOTNULL",
        517 => "SQLITE_BUSY_SNAPSHOT",
        _ => match code & 0xff {
            0 => "SQLITE_OK",
            1 => "SQLITE_ERROR",
            2 => "SQLITE_INTERNAL",
            3 => "SQLITE_PERM",
            4 => "SQLITE_ABORT",
            5 => "SQLITE_BUSY",
            6 => "SQLITE_LOCKED",
            7 => "SQLITE_NOMEM",
            8 => "SQLITE_READONLY",
            9 => "SQLITE_INTERRUPT",
            10 => "SQLITE_IOERR",
            11 => "SQLITE_CORRUPT",
            12 => "SQLITE_NOTFOUND",
            13 => "SQLITE_FULL",
            14 => "SQLITE_CANTOPEN",
            15 => "SQLITE_PROTOCOL",
            16 => "SQLITE_EMPTY",
            17 => "SQLITE_SCHEMA",
            18 => "SQLITE_TOOBIG",
            19 => "SQLITE_CONSTRAINT",
            20 => "SQLITE_MISMATCH",
            21 => "SQLITE_MISUSE",
            22 => "SQLITE_NOLFS",
            23 => "SQLITE_AUTH",
            24 => "SQLITE_FORMAT",
            25 => "SQLITE_RANGE",
            26 => "SQLITE_NOTADB",
            27 => "SQLITE_NOTICE",
            28 => "SQLITE_WARNING",
            100 => "SQLITE_ROW",
            101 => "SQLITE_DONE",
            _ => "SQLITE_UNKNOWN",
        },
    }
}

/// Result type alias using DbError
pub type Result<T> = std::result::Result<T, DbError>;
