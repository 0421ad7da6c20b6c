//! Notification persistence

use std::sync::Arc;

use super::get_cached;
use crate::data::cache::EntityCache;
use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::Notification;
use crate::error::{DbError, Result};

const COLUMNS: &str =
    "id, notification_type, target_account_id, origin_account_id, status_id, read, created_at";

pub struct NotificationRepository {
    conn: Arc<DbConn>,
    cache: Arc<EntityCache<Notification>>,
}

impl NotificationRepository {
    pub fn new(conn: Arc<DbConn>, cache: Arc<EntityCache<Notification>>) -> Self {
        Self { conn, cache }
    }

    pub async fn get_by_id(&self, ctx: &Context, id: &str) -> Result<Option<Notification>> {
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM notifications WHERE id = ?"))
            .into_owned();

        let load = self.conn.run(ctx, "select", "notifications", async {
            Ok(with_pool!(self.conn, pool => {
                sqlx::query_as::<_, Notification>(&sql)
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }))
        });

        get_cached(&self.cache, format!("id:{id}"), load).await
    }

    pub async fn put(&self, ctx: &Context, notification: &Notification) -> Result<()> {
        let sql = self
            .conn
            .sql(&format!(
                "INSERT INTO notifications ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
            ))
            .into_owned();

        self.conn
            .run(ctx, "insert", "notifications", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&notification.id)
                        .bind(&notification.notification_type)
                        .bind(&notification.target_account_id)
                        .bind(&notification.origin_account_id)
                        .bind(&notification.status_id)
                        .bind(notification.read)
                        .bind(notification.created_at)
                        .execute(pool)
                        .await?;
                });
                Ok(())
            })
            .await?;

        self.cache.put_entity(notification.clone()).await;
        Ok(())
    }

    /// Notifications addressed to `target_account_id`, newest first
    pub async fn get_for_account(
        &self,
        ctx: &Context,
        target_account_id: &str,
        limit: i64,
        max_id: Option<&str>,
        unread_only: bool,
    ) -> Result<Vec<Notification>> {
        let mut sql = format!("SELECT {COLUMNS} FROM notifications WHERE target_account_id = ?");
        if max_id.is_some() {
            sql.push_str(" AND id < ?");
        }
        if unread_only {
            sql.push_str(" AND read = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        let sql = self.conn.sql(&sql).into_owned();

        self.conn
            .run(ctx, "select", "notifications", async {
                Ok(with_pool!(self.conn, pool => {
                    let mut query = sqlx::query_as::<_, Notification>(&sql).bind(target_account_id);
                    if let Some(max_id) = max_id {
                        query = query.bind(max_id);
                    }
                    if unread_only {
                        query = query.bind(false);
                    }
                    query.bind(limit).fetch_all(pool).await?
                }))
            })
            .await
    }

    pub async fn mark_read(&self, ctx: &Context, id: &str) -> Result<()> {
        let sql = self
            .conn
            .sql("UPDATE notifications SET read = ? WHERE id = ?")
            .into_owned();

        self.conn
            .run(ctx, "update", "notifications", async {
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(true)
                        .bind(id)
                        .execute(pool)
                        .await?
                        .rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("notification {id}")));
                }
                Ok(())
            })
            .await?;

        self.cache.invalidate(&format!("id:{id}")).await;
        Ok(())
    }

    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let sql = self
            .conn
            .sql("DELETE FROM notifications WHERE id = ?")
            .into_owned();

        self.conn
            .run(ctx, "delete", "notifications", async {
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql).bind(id).execute(pool).await?.rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("notification {id}")));
                }
                Ok(())
            })
            .await?;

        self.cache.invalidate(&format!("id:{id}")).await;
        Ok(())
    }

    /// Delete every notification about a status; returns how many went
    pub async fn delete_for_status(&self, ctx: &Context, status_id: &str) -> Result<u64> {
        let select = self
            .conn
            .sql("SELECT id FROM notifications WHERE status_id = ?")
            .into_owned();
        let delete = self
            .conn
            .sql("DELETE FROM notifications WHERE status_id = ?")
            .into_owned();

        let ids = self
            .conn
            .run(ctx, "delete", "notifications", async {
                Ok(with_pool!(self.conn, pool => {
                    let ids: Vec<String> = sqlx::query_scalar(&select)
                        .bind(status_id)
                        .fetch_all(pool)
                        .await?;
                    sqlx::query(&delete).bind(status_id).execute(pool).await?;
                    ids
                }))
            })
            .await?;

        for id in &ids {
            self.cache.invalidate(&format!("id:{id}")).await;
        }
        Ok(ids.len() as u64)
    }
}
