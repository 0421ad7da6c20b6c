//! Account persistence

use std::sync::Arc;

use super::get_cached;
use super::status::COLUMNS as STATUS_COLUMNS;
use crate::data::cache::EntityCache;
use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::{Account, Mention, Notification, Status, account_name_key, fold_name};
use crate::error::{DbError, Result};

const COLUMNS: &str = "id, username, domain, display_name, uri, url, inbox_uri, \
                       public_key_pem, created_at, updated_at";

/// Written on every insert and update, never read back
const FOLDED_COLUMNS: &str = "username_folded, domain_folded";

/// `domain_folded` value: empty for local accounts
fn folded_domain(account: &Account) -> String {
    account.domain.as_deref().map(fold_name).unwrap_or_default()
}

/// Rows removed along with an account by `ON DELETE CASCADE`
struct Cascade {
    account: Account,
    statuses: Vec<Status>,
    mention_ids: Vec<String>,
    notification_ids: Vec<String>,
}

pub struct AccountRepository {
    conn: Arc<DbConn>,
    cache: EntityCache<Account>,
    statuses: Arc<EntityCache<Status>>,
    mentions: Arc<EntityCache<Mention>>,
    notifications: Arc<EntityCache<Notification>>,
}

impl AccountRepository {
    pub fn new(
        conn: Arc<DbConn>,
        cache: EntityCache<Account>,
        statuses: Arc<EntityCache<Status>>,
        mentions: Arc<EntityCache<Mention>>,
        notifications: Arc<EntityCache<Notification>>,
    ) -> Self {
        Self {
            conn,
            cache,
            statuses,
            mentions,
            notifications,
        }
    }

    pub async fn get_by_id(&self, ctx: &Context, id: &str) -> Result<Option<Account>> {
        get_cached(
            &self.cache,
            format!("id:{id}"),
            self.conn
                .run(ctx, "select", "accounts", self.fetch_by("id", id)),
        )
        .await
    }

    pub async fn get_by_uri(&self, ctx: &Context, uri: &str) -> Result<Option<Account>> {
        get_cached(
            &self.cache,
            format!("uri:{uri}"),
            self.conn
                .run(ctx, "select", "accounts", self.fetch_by("uri", uri)),
        )
        .await
    }

    pub async fn get_by_url(&self, ctx: &Context, url: &str) -> Result<Option<Account>> {
        get_cached(
            &self.cache,
            format!("url:{url}"),
            self.conn
                .run(ctx, "select", "accounts", self.fetch_by("url", url)),
        )
        .await
    }

    /// Look up an account by name, ignoring case across the full Unicode
    /// range.
    ///
    /// `domain: None` only matches local accounts.
    pub async fn get_by_username_domain(
        &self,
        ctx: &Context,
        username: &str,
        domain: Option<&str>,
    ) -> Result<Option<Account>> {
        let load = self.conn.run(ctx, "select", "accounts", async {
            let sql = match domain {
                Some(_) => format!(
                    "SELECT {COLUMNS} FROM accounts \
                     WHERE username_folded = ? AND domain_folded = ? AND domain IS NOT NULL \
                     LIMIT 1"
                ),
                None => format!(
                    "SELECT {COLUMNS} FROM accounts \
                     WHERE username_folded = ? AND domain IS NULL LIMIT 1"
                ),
            };
            let sql = self.conn.sql(&sql).into_owned();

            Ok(with_pool!(self.conn, pool => {
                let mut query = sqlx::query_as::<_, Account>(&sql).bind(fold_name(username));
                if let Some(domain) = domain {
                    query = query.bind(fold_name(domain));
                }
                query.fetch_optional(pool).await?
            }))
        });

        get_cached(&self.cache, account_name_key(username, domain), load).await
    }

    /// Insert a new account
    ///
    /// # Errors
    /// `AlreadyExists` when the id, URI or `(username, domain)` is taken
    pub async fn put(&self, ctx: &Context, account: &Account) -> Result<()> {
        let sql = self.conn.sql(&format!(
            "INSERT INTO accounts ({COLUMNS}, {FOLDED_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        )).into_owned();

        self.conn
            .run(ctx, "insert", "accounts", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&account.id)
                        .bind(&account.username)
                        .bind(&account.domain)
                        .bind(&account.display_name)
                        .bind(&account.uri)
                        .bind(&account.url)
                        .bind(&account.inbox_uri)
                        .bind(&account.public_key_pem)
                        .bind(account.created_at)
                        .bind(account.updated_at)
                        .bind(fold_name(&account.username))
                        .bind(folded_domain(account))
                        .execute(pool)
                        .await?;
                });
                Ok(())
            })
            .await?;

        self.cache.put_entity(account.clone()).await;
        tracing::debug!(account_id = %account.id, address = %account.address(), "account stored");
        Ok(())
    }

    /// Insert, or overwrite every field of the account with the same id
    pub async fn upsert(&self, ctx: &Context, account: &Account) -> Result<()> {
        let sql = self.conn.sql(&format!(
            "INSERT INTO accounts ({COLUMNS}, {FOLDED_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (id) DO UPDATE SET \
                username = excluded.username, \
                domain = excluded.domain, \
                username_folded = excluded.username_folded, \
                domain_folded = excluded.domain_folded, \
                display_name = excluded.display_name, \
                uri = excluded.uri, \
                url = excluded.url, \
                inbox_uri = excluded.inbox_uri, \
                public_key_pem = excluded.public_key_pem, \
                updated_at = excluded.updated_at"
        )).into_owned();

        let previous = self
            .conn
            .run(ctx, "upsert", "accounts", async {
                let previous = self.fetch_by("id", &account.id).await?;
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&account.id)
                        .bind(&account.username)
                        .bind(&account.domain)
                        .bind(&account.display_name)
                        .bind(&account.uri)
                        .bind(&account.url)
                        .bind(&account.inbox_uri)
                        .bind(&account.public_key_pem)
                        .bind(account.created_at)
                        .bind(account.updated_at)
                        .bind(fold_name(&account.username))
                        .bind(folded_domain(account))
                        .execute(pool)
                        .await?;
                });
                Ok(previous)
            })
            .await?;

        self.cache
            .replace_entity(previous.as_ref(), account.clone())
            .await;
        Ok(())
    }

    /// Overwrite the mutable fields of an existing account
    pub async fn update(&self, ctx: &Context, account: &Account) -> Result<()> {
        let sql = self
            .conn
            .sql(
                "UPDATE accounts SET username = ?, domain = ?, username_folded = ?, \
                 domain_folded = ?, display_name = ?, uri = ?, url = ?, inbox_uri = ?, \
                 public_key_pem = ?, updated_at = ? WHERE id = ?",
            )
            .into_owned();

        let previous = self
            .conn
            .run(ctx, "update", "accounts", async {
                let Some(previous) = self.fetch_by("id", &account.id).await? else {
                    return Err(DbError::NotFound(format!("account {}", account.id)));
                };
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&account.username)
                        .bind(&account.domain)
                        .bind(fold_name(&account.username))
                        .bind(folded_domain(account))
                        .bind(&account.display_name)
                        .bind(&account.uri)
                        .bind(&account.url)
                        .bind(&account.inbox_uri)
                        .bind(&account.public_key_pem)
                        .bind(account.updated_at)
                        .bind(&account.id)
                        .execute(pool)
                        .await?
                        .rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("account {}", account.id)));
                }
                Ok(previous)
            })
            .await?;

        self.cache
            .replace_entity(Some(&previous), account.clone())
            .await;
        Ok(())
    }

    /// Delete an account.
    ///
    /// Its statuses, their mentions, and every notification addressed to the
    /// account or about one of its statuses go with it. The cascaded rows are
    /// read in the same transaction as the delete so that their cache entries
    /// can be dropped afterwards.
    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let select_account = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM accounts WHERE id = ? LIMIT 1"))
            .into_owned();
        let select_statuses = self
            .conn
            .sql(&format!("SELECT {STATUS_COLUMNS} FROM statuses WHERE account_id = ?"))
            .into_owned();
        let select_mentions = self
            .conn
            .sql(
                "SELECT id FROM mentions \
                 WHERE status_id IN (SELECT id FROM statuses WHERE account_id = ?)",
            )
            .into_owned();
        let select_notifications = self
            .conn
            .sql(
                "SELECT id FROM notifications WHERE target_account_id = ? \
                 OR status_id IN (SELECT id FROM statuses WHERE account_id = ?)",
            )
            .into_owned();
        let delete = self.conn.sql("DELETE FROM accounts WHERE id = ?").into_owned();

        let cascade = self
            .conn
            .run(ctx, "delete", "accounts", async {
                with_pool!(self.conn, pool => {
                    let mut tx = pool.begin().await?;

                    let Some(account) = sqlx::query_as::<_, Account>(&select_account)
                        .bind(id)
                        .fetch_optional(&mut *tx)
                        .await?
                    else {
                        return Err(DbError::NotFound(format!("account {id}")));
                    };
                    let statuses = sqlx::query_as::<_, Status>(&select_statuses)
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?;
                    let mention_ids: Vec<String> = sqlx::query_scalar(&select_mentions)
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?;
                    let notification_ids: Vec<String> = sqlx::query_scalar(&select_notifications)
                        .bind(id)
                        .bind(id)
                        .fetch_all(&mut *tx)
                        .await?;

                    sqlx::query(&delete).bind(id).execute(&mut *tx).await?;
                    tx.commit().await?;

                    Ok(Cascade {
                        account,
                        statuses,
                        mention_ids,
                        notification_ids,
                    })
                })
            })
            .await?;

        for status in &cascade.statuses {
            self.statuses.invalidate_entity(status).await;
        }
        for mention_id in &cascade.mention_ids {
            self.mentions.invalidate(&format!("id:{mention_id}")).await;
        }
        for notification_id in &cascade.notification_ids {
            self.notifications
                .invalidate(&format!("id:{notification_id}"))
                .await;
        }
        self.cache.invalidate_entity(&cascade.account).await;

        tracing::debug!(
            account_id = %id,
            statuses = cascade.statuses.len(),
            mentions = cascade.mention_ids.len(),
            notifications = cascade.notification_ids.len(),
            "account deleted"
        );
        Ok(())
    }

    /// Number of accounts hosted on this instance
    pub async fn count_local(&self, ctx: &Context) -> Result<i64> {
        self.conn
            .run(ctx, "count", "accounts", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_scalar::<_, i64>(
                        "SELECT COUNT(*) FROM accounts WHERE domain IS NULL",
                    )
                    .fetch_one(pool)
                    .await?
                }))
            })
            .await
    }

    async fn fetch_by(&self, column: &'static str, value: &str) -> Result<Option<Account>> {
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM accounts WHERE {column} = ? LIMIT 1"))
            .into_owned();

        Ok(with_pool!(self.conn, pool => {
            sqlx::query_as::<_, Account>(&sql)
                .bind(value)
                .fetch_optional(pool)
                .await?
        }))
    }
}
