//! Database façade
//!
//! Owns the connection and hands out the repositories. Construction runs
//! the migration gate, so a `Database` always sits on an up-to-date schema.

use std::sync::Arc;

use super::cache::EntityCache;
use super::connection::{DbConn, PoolStats};
use super::context::Context;
use super::migrations::{MigrationOutcome, run_migrations};
use super::repositories::{
    AccountRepository, DomainRepository, EmojiRepository, MentionRepository,
    NotificationRepository, SessionRepository, StatusRepository, TagRepository,
};
use crate::config::{AppConfig, CacheConfig};
use crate::error::Result;

/// Entry point to the persistence layer
pub struct Database {
    conn: Arc<DbConn>,
    accounts: AccountRepository,
    statuses: StatusRepository,
    mentions: MentionRepository,
    tags: TagRepository,
    emojis: EmojiRepository,
    notifications: NotificationRepository,
    domains: DomainRepository,
    sessions: SessionRepository,
}

impl Database {
    /// Connect, migrate, and build the repositories.
    ///
    /// # Errors
    /// Any error here is fatal to startup: `Config` or `Connectivity` from
    /// the connection, `Migration` from the schema gate.
    pub async fn open(ctx: &Context, config: &AppConfig) -> Result<Self> {
        let conn = DbConn::open(ctx, &config.database).await?;

        match run_migrations(ctx, &conn).await? {
            MigrationOutcome::Migrated { applied, .. } => {
                tracing::info!(count = applied.len(), "Database schema migrated")
            }
            MigrationOutcome::UpToDate | MigrationOutcome::NoMigrationsDefined => {
                tracing::debug!("Database schema up to date")
            }
        }

        Ok(Self::from_conn(Arc::new(conn), &config.cache))
    }

    /// Build repositories on an already-migrated connection
    pub fn from_conn(conn: Arc<DbConn>, cache: &CacheConfig) -> Self {
        let status_cache = Arc::new(EntityCache::new(
            "statuses",
            cache.max_capacity,
            cache.status_ttl(),
        ));
        let mention_cache = Arc::new(EntityCache::new(
            "mentions",
            cache.max_capacity,
            cache.mention_ttl(),
        ));
        let notification_cache = Arc::new(EntityCache::new(
            "notifications",
            cache.max_capacity,
            cache.notification_ttl(),
        ));

        Self {
            accounts: AccountRepository::new(
                Arc::clone(&conn),
                EntityCache::new("accounts", cache.max_capacity, cache.account_ttl()),
                Arc::clone(&status_cache),
                Arc::clone(&mention_cache),
                Arc::clone(&notification_cache),
            ),
            statuses: StatusRepository::new(
                Arc::clone(&conn),
                status_cache,
                Arc::clone(&mention_cache),
                Arc::clone(&notification_cache),
            ),
            mentions: MentionRepository::new(Arc::clone(&conn), mention_cache),
            tags: TagRepository::new(Arc::clone(&conn)),
            emojis: EmojiRepository::new(Arc::clone(&conn)),
            notifications: NotificationRepository::new(Arc::clone(&conn), notification_cache),
            domains: DomainRepository::new(Arc::clone(&conn)),
            sessions: SessionRepository::new(Arc::clone(&conn)),
            conn,
        }
    }

    pub fn conn(&self) -> &Arc<DbConn> {
        &self.conn
    }

    pub fn accounts(&self) -> &AccountRepository {
        &self.accounts
    }

    pub fn statuses(&self) -> &StatusRepository {
        &self.statuses
    }

    pub fn mentions(&self) -> &MentionRepository {
        &self.mentions
    }

    pub fn tags(&self) -> &TagRepository {
        &self.tags
    }

    pub fn emojis(&self) -> &EmojiRepository {
        &self.emojis
    }

    pub fn notifications(&self) -> &NotificationRepository {
        &self.notifications
    }

    pub fn domains(&self) -> &DomainRepository {
        &self.domains
    }

    pub fn sessions(&self) -> &SessionRepository {
        &self.sessions
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.conn.stats()
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }
}
