//! Migration engine
//!
//! Applies the ordered list in [`super::schema::MIGRATIONS`] exactly once.
//! Applied migrations are recorded in `schema_migrations`; every migration
//! applied by one run shares a group id. Each migration step runs in its own
//! transaction together with its bookkeeping row.

use std::collections::HashSet;

use chrono::Utc;

use super::connection::{DbConn, with_pool};
use super::context::Context;
use crate::error::{DbError, Result};

/// One versioned schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    /// Statements to execute, rendered for the active dialect
    pub up: fn(super::connection::Dialect) -> Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigratorState {
    Uninitialized,
    Initialized,
    Migrated,
}

/// Result of a successful [`Migrator::migrate`] call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The migration list is empty
    NoMigrationsDefined,
    /// Every migration was already applied
    UpToDate,
    /// Migrations applied by this run
    Migrated { group_id: i64, applied: Vec<String> },
}

pub struct Migrator<'a> {
    conn: &'a DbConn,
    migrations: &'a [Migration],
    state: MigratorState,
}

impl<'a> Migrator<'a> {
    pub fn new(conn: &'a DbConn, migrations: &'a [Migration]) -> Self {
        Self {
            conn,
            migrations,
            state: MigratorState::Uninitialized,
        }
    }

    pub fn state(&self) -> MigratorState {
        self.state
    }

    /// Create the bookkeeping table if it does not exist
    pub async fn init(&mut self, ctx: &Context) -> Result<()> {
        let ts = self.conn.dialect().timestamp_type();
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                group_id BIGINT NOT NULL,
                migrated_at {ts} NOT NULL
            )
            "#
        );

        self.conn
            .run(ctx, "init", "schema_migrations", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&ddl).execute(pool).await?;
                });
                Ok(())
            })
            .await
            .map_err(into_migration_error)?;

        self.state = MigratorState::Initialized;
        Ok(())
    }

    /// Apply every migration that has not been applied yet.
    ///
    /// # Errors
    /// `Migration` if called before [`Migrator::init`], if the list is not
    /// strictly ordered, or if any step fails. Earlier steps of a failed run
    /// stay recorded.
    pub async fn migrate(&mut self, ctx: &Context) -> Result<MigrationOutcome> {
        if self.state == MigratorState::Uninitialized {
            return Err(DbError::Migration("migrator not initialized".to_string()));
        }
        validate_order(self.migrations)?;

        if self.migrations.is_empty() {
            self.state = MigratorState::Migrated;
            return Ok(MigrationOutcome::NoMigrationsDefined);
        }

        let applied = self.applied_versions(ctx).await?;
        let highest = applied.iter().copied().max().unwrap_or(i64::MIN);
        for skipped in self
            .migrations
            .iter()
            .filter(|m| m.version < highest && !applied.contains(&m.version))
        {
            tracing::warn!(
                version = skipped.version,
                name = skipped.name,
                "migration predates the applied schema and will not run"
            );
        }
        let pending: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.version > highest)
            .collect();

        if pending.is_empty() {
            self.state = MigratorState::Migrated;
            return Ok(MigrationOutcome::UpToDate);
        }

        let group_id = self.last_group_id(ctx).await? + 1;
        let mut names = Vec::with_capacity(pending.len());

        for migration in pending {
            self.apply(ctx, migration, group_id).await?;
            crate::metrics::DB_MIGRATIONS_APPLIED_TOTAL.inc();
            tracing::info!(
                version = migration.version,
                name = migration.name,
                group_id,
                "applied migration"
            );
            names.push(format!("{}_{}", migration.version, migration.name));
        }

        self.state = MigratorState::Migrated;
        Ok(MigrationOutcome::Migrated {
            group_id,
            applied: names,
        })
    }

    async fn applied_versions(&self, ctx: &Context) -> Result<HashSet<i64>> {
        let versions: Vec<i64> = self
            .conn
            .run(ctx, "select", "schema_migrations", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_scalar::<_, i64>("SELECT version FROM schema_migrations")
                        .fetch_all(pool)
                        .await?
                }))
            })
            .await
            .map_err(into_migration_error)?;

        Ok(versions.into_iter().collect())
    }

    async fn last_group_id(&self, ctx: &Context) -> Result<i64> {
        self.conn
            .run(ctx, "select", "schema_migrations", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_scalar::<_, i64>(
                        "SELECT COALESCE(MAX(group_id), 0) FROM schema_migrations",
                    )
                    .fetch_one(pool)
                    .await?
                }))
            })
            .await
            .map_err(into_migration_error)
    }

    async fn apply(&self, ctx: &Context, migration: &Migration, group_id: i64) -> Result<()> {
        let statements = (migration.up)(self.conn.dialect());
        let record = self.conn.sql(
            "INSERT INTO schema_migrations (version, name, group_id, migrated_at) VALUES (?, ?, ?, ?)",
        );
        let now = Utc::now();

        self.conn
            .run(ctx, "migrate", "schema_migrations", async {
                with_pool!(self.conn, pool => {
                    let mut tx = pool.begin().await?;
                    for statement in &statements {
                        sqlx::query(statement).execute(&mut *tx).await?;
                    }
                    sqlx::query(&record)
                        .bind(migration.version)
                        .bind(migration.name)
                        .bind(group_id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                    tx.commit().await?;
                });
                Ok(())
            })
            .await
            .map_err(|err| match err {
                err if err.is_cancellation() => err,
                err => DbError::Migration(format!(
                    "{}_{}: {}",
                    migration.version, migration.name, err
                )),
            })
    }
}

fn validate_order(migrations: &[Migration]) -> Result<()> {
    for pair in migrations.windows(2) {
        if pair[0].version >= pair[1].version {
            return Err(DbError::Migration(format!(
                "migration {} is not ordered before {}",
                pair[0].version, pair[1].version
            )));
        }
    }
    Ok(())
}

fn into_migration_error(err: DbError) -> DbError {
    match err {
        DbError::Migration(_) | DbError::Cancelled | DbError::DeadlineExceeded => err,
        other => DbError::Migration(other.to_string()),
    }
}

/// Startup gate: initialize bookkeeping and apply pending migrations.
///
/// Callers must treat an error as fatal.
pub async fn run_migrations(ctx: &Context, conn: &DbConn) -> Result<MigrationOutcome> {
    let mut migrator = Migrator::new(conn, super::schema::MIGRATIONS);
    migrator.init(ctx).await?;

    let outcome = migrator.migrate(ctx).await.map_err(|e| {
        tracing::error!(error = %e, "Migration failed");
        e
    })?;

    match &outcome {
        MigrationOutcome::NoMigrationsDefined => tracing::info!("there are no migrations defined"),
        MigrationOutcome::UpToDate => tracing::info!("there are no new migrations to run"),
        MigrationOutcome::Migrated { group_id, applied } => tracing::info!(
            count = applied.len(),
            "MIGRATED DATABASE TO group #{}",
            group_id
        ),
    }

    Ok(outcome)
}
