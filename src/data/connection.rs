//! Connection manager
//!
//! Opens and tunes a pooled connection to exactly one backend (SQLite or
//! PostgreSQL) and hides the dialect differences the repositories would
//! otherwise have to care about.

use std::borrow::Cow;
use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use super::context::Context;
use super::{interrupt, tls};
use crate::config::{DatabaseBackend, DatabaseConfig, TlsMode};
use crate::error::{DbError, Result};

const SQLITE_MEMORY: &str = ":memory:";
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const SQLITE_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQL dialect of the active backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::Postgres => "postgres",
        }
    }

    /// Column type for `DateTime<Utc>` values
    pub fn timestamp_type(&self) -> &'static str {
        match self {
            Dialect::Sqlite => "DATETIME",
            Dialect::Postgres => "TIMESTAMPTZ",
        }
    }

    /// Rewrite `?` placeholders into the dialect's bind syntax.
    ///
    /// SQLite keeps `?`; PostgreSQL gets `$1, $2, ...`. Question marks inside
    /// single-quoted literals or double-quoted identifiers are left alone.
    pub fn rewrite<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        if *self == Dialect::Sqlite || !sql.contains('?') {
            return Cow::Borrowed(sql);
        }

        let mut out = String::with_capacity(sql.len() + 8);
        let mut index = 0usize;
        let mut in_literal = false;
        let mut in_ident = false;

        for ch in sql.chars() {
            match ch {
                '\'' if !in_ident => {
                    in_literal = !in_literal;
                    out.push(ch);
                }
                '"' if !in_literal => {
                    in_ident = !in_ident;
                    out.push(ch);
                }
                '?' if !in_literal && !in_ident => {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                }
                _ => out.push(ch),
            }
        }

        Cow::Owned(out)
    }
}

/// Typed pool for the selected backend
#[derive(Debug, Clone)]
pub enum DbPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

/// Run one query body against whichever typed pool is active.
///
/// The body is expanded once per backend, so anything used inside it must
/// work with both `Sqlite` and `Postgres`.
macro_rules! with_pool {
    ($conn:expr, $pool:ident => $body:expr) => {
        match $conn.pool() {
            $crate::data::connection::DbPool::Sqlite($pool) => $body,
            $crate::data::connection::DbPool::Postgres($pool) => $body,
        }
    };
}
pub(crate) use with_pool;

/// Pool limits, derived from available parallelism
///
/// sqlx pools have no separate idle cap: a released connection stays idle
/// until `idle_timeout` or `max_lifetime` closes it. `max_idle` is therefore
/// always equal to `max_open` and is reported for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub max_open: u32,
    pub max_idle: u32,
}

impl PoolSizing {
    const CONNECTIONS_PER_CPU: u32 = 4;

    pub fn from_parallelism() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::for_cpus(cpus)
    }

    pub fn for_cpus(cpus: u32) -> Self {
        let max_open = Self::CONNECTIONS_PER_CPU * cpus.max(1);
        Self {
            max_open,
            max_idle: max_open,
        }
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Open connections (idle + in use)
    pub size: u32,
    pub idle: usize,
}

impl PoolStats {
    pub fn in_use(&self) -> usize {
        (self.size as usize).saturating_sub(self.idle)
    }
}

/// Shared database connection
///
/// Owns the pool; repositories hold it through `Arc<DbConn>`.
#[derive(Debug)]
pub struct DbConn {
    pool: DbPool,
    dialect: Dialect,
    sizing: PoolSizing,
}

impl DbConn {
    /// Open a connection for the configured backend and verify liveness.
    ///
    /// # Errors
    /// - `Config` when the backend-specific settings are incomplete
    /// - `Connectivity` when the initial ping fails
    pub async fn open(ctx: &Context, config: &DatabaseConfig) -> Result<Self> {
        let sizing = PoolSizing::from_parallelism();

        let conn = match config.backend {
            DatabaseBackend::Sqlite => Self::open_sqlite(config, sizing)?,
            DatabaseBackend::Postgres => {
                let options = derive_pg_options(config)?;
                let pool = PgPoolOptions::new()
                    .max_connections(sizing.max_open)
                    .acquire_timeout(ACQUIRE_TIMEOUT)
                    .connect_lazy_with(options);
                Self {
                    pool: DbPool::Postgres(pool),
                    dialect: Dialect::Postgres,
                    sizing,
                }
            }
        };

        if let Err(err) = conn.ping(ctx).await {
            if err.is_cancellation() {
                return Err(err);
            }
            return Err(DbError::Connectivity(format!(
                "{} ping: {}",
                conn.dialect.name(),
                err
            )));
        }

        match conn.dialect {
            Dialect::Sqlite => tracing::info!("connected to SQLITE database"),
            Dialect::Postgres => tracing::info!("connected to POSTGRES database"),
        }
        tracing::debug!(
            max_open = sizing.max_open,
            max_idle = sizing.max_idle,
            "connection pool sized"
        );

        Ok(conn)
    }

    fn open_sqlite(config: &DatabaseConfig, sizing: PoolSizing) -> Result<Self> {
        let address = normalize_sqlite_address(&config.address);
        if address.is_empty() {
            return Err(DbError::Config("no sqlite address set".to_string()));
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(sizing.max_open)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .after_connect(|conn, _meta| interrupt::bind_connection(conn))
            .before_acquire(|conn, _meta| interrupt::bind_on_acquire(conn));

        let connect_options = if address == SQLITE_MEMORY {
            tracing::warn!("sqlite in-memory database should only be used for debugging");
            // The shared in-memory database disappears with its last
            // connection, so connections are never recycled.
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            SqliteConnectOptions::from_str("sqlite::memory:")
                .map_err(|e| DbError::Config(format!("could not open sqlite db: {e}")))?
                .foreign_keys(true)
        } else {
            let path = Path::new(&address);
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DbError::Config(format!(
                        "could not create sqlite directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .foreign_keys(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(SQLITE_BUSY_TIMEOUT)
        };

        let pool = pool_options.connect_lazy_with(connect_options);
        Ok(Self {
            pool: DbPool::Sqlite(pool),
            dialect: Dialect::Sqlite,
            sizing,
        })
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn sizing(&self) -> PoolSizing {
        self.sizing
    }

    /// Render `?`-style SQL for the active dialect
    pub fn sql<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        self.dialect.rewrite(sql)
    }

    /// Liveness check
    pub async fn ping(&self, ctx: &Context) -> Result<()> {
        self.run(ctx, "ping", "-", async {
            with_pool!(self, pool => {
                sqlx::query("SELECT 1").execute(pool).await?;
            });
            Ok(())
        })
        .await
    }

    /// Run a query future under `ctx`, recording metrics.
    ///
    /// Every repository call goes through here.
    pub async fn run<T, F>(
        &self,
        ctx: &Context,
        operation: &'static str,
        table: &'static str,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        use crate::metrics::{DB_QUERIES_TOTAL, DB_QUERY_DURATION_SECONDS, ERRORS_TOTAL};

        let started = Instant::now();
        let result = match self.dialect {
            Dialect::Sqlite => interrupt::run(ctx, fut).await,
            Dialect::Postgres => ctx.run(fut).await,
        };
        let elapsed = started.elapsed();

        DB_QUERIES_TOTAL
            .with_label_values(&[operation, table])
            .inc();
        DB_QUERY_DURATION_SECONDS
            .with_label_values(&[operation, table])
            .observe(elapsed.as_secs_f64());

        match &result {
            Ok(_) => tracing::trace!(
                operation,
                table,
                elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                "query finished"
            ),
            Err(error) => {
                ERRORS_TOTAL.with_label_values(&[error.kind(), table]).inc();
                tracing::trace!(operation, table, %error, "query failed");
            }
        }

        result
    }

    pub fn stats(&self) -> PoolStats {
        match &self.pool {
            DbPool::Sqlite(pool) => PoolStats {
                size: pool.size(),
                idle: pool.num_idle(),
            },
            DbPool::Postgres(pool) => PoolStats {
                size: pool.size(),
                idle: pool.num_idle(),
            },
        }
    }

    pub async fn close(&self) {
        tracing::info!("closing database connection pool");
        match &self.pool {
            DbPool::Sqlite(pool) => pool.close().await,
            DbPool::Postgres(pool) => pool.close().await,
        }
    }
}

/// Drop query parameters and a `file:` prefix from a SQLite address
pub fn normalize_sqlite_address(address: &str) -> String {
    let address = address.split('?').next().unwrap_or_default();
    let address = address.strip_prefix("sqlite:").unwrap_or(address);
    let address = address.strip_prefix("file:").unwrap_or(address);
    address.trim().to_string()
}

/// Build PostgreSQL connect options from config, without touching the network.
///
/// # Errors
/// `Config` for the first missing field or an unusable CA certificate
pub fn derive_pg_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    if config.backend != DatabaseBackend::Postgres {
        return Err(DbError::Config(format!(
            "expected db type of postgres but got {}",
            config.backend.as_str()
        )));
    }

    if config.port == 0 {
        return Err(DbError::Config("no port set".to_string()));
    }
    if config.address.trim().is_empty() {
        return Err(DbError::Config("no address set".to_string()));
    }
    if config.user.is_empty() {
        return Err(DbError::Config("no user set".to_string()));
    }
    if config.password.is_empty() {
        return Err(DbError::Config("no password set".to_string()));
    }
    if config.database.is_empty() {
        return Err(DbError::Config("no database set".to_string()));
    }

    let ssl_mode = match config.tls_mode {
        TlsMode::Disable => PgSslMode::Disable,
        TlsMode::Enable => PgSslMode::Prefer,
        TlsMode::Require => PgSslMode::VerifyFull,
    };

    let mut options = PgConnectOptions::new_without_pgpass()
        .host(config.address.trim())
        .port(config.port)
        .username(&config.user)
        .password(&config.password)
        .database(&config.database)
        .ssl_mode(ssl_mode)
        .application_name(&config.application_name);

    if let Some(ca_path) = &config.tls_ca_cert {
        if config.tls_mode != TlsMode::Disable {
            tls::load_ca_certificate(ca_path)?;
            options = options.ssl_root_cert(ca_path);
        }
    }

    Ok(options)
}
