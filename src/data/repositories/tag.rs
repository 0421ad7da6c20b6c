//! Tag persistence

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::{Tag, fold_name};
use crate::error::{DbError, Result};

const COLUMNS: &str = "id, name, url, first_seen_from_account_id, usable, listable, \
                       last_status_at, created_at, updated_at";

pub struct TagRepository {
    conn: Arc<DbConn>,
}

impl TagRepository {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    pub async fn get_by_id(&self, ctx: &Context, id: &str) -> Result<Option<Tag>> {
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM tags WHERE id = ?"))
            .into_owned();

        self.conn
            .run(ctx, "select", "tags", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Tag>(&sql).bind(id).fetch_optional(pool).await?
                }))
            })
            .await
    }

    /// Case-insensitive lookup by name
    pub async fn get_by_name(&self, ctx: &Context, name: &str) -> Result<Option<Tag>> {
        self.conn
            .run(ctx, "select", "tags", self.fetch_by_name(name))
            .await
    }

    /// Insert a new tag
    ///
    /// # Errors
    /// `AlreadyExists` when a tag with the same name (ignoring case) exists
    pub async fn put(&self, ctx: &Context, tag: &Tag) -> Result<()> {
        let sql = self
            .conn
            .sql(&format!(
                "INSERT INTO tags ({COLUMNS}, name_folded) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .into_owned();

        self.conn
            .run(ctx, "insert", "tags", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&tag.id)
                        .bind(&tag.name)
                        .bind(&tag.url)
                        .bind(&tag.first_seen_from_account_id)
                        .bind(tag.usable)
                        .bind(tag.listable)
                        .bind(tag.last_status_at)
                        .bind(tag.created_at)
                        .bind(tag.updated_at)
                        .bind(fold_name(&tag.name))
                        .execute(pool)
                        .await?;
                });
                Ok(())
            })
            .await
    }

    /// Insert `tag` unless one with the same name exists, then return the
    /// stored row.
    ///
    /// Two callers racing on a new name both get the single winning row.
    pub async fn put_or_get(&self, ctx: &Context, tag: &Tag) -> Result<Tag> {
        let sql = self
            .conn
            .sql(&format!(
                "INSERT INTO tags ({COLUMNS}, name_folded) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT DO NOTHING"
            ))
            .into_owned();

        self.conn
            .run(ctx, "upsert", "tags", async {
                let inserted = with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&tag.id)
                        .bind(&tag.name)
                        .bind(&tag.url)
                        .bind(&tag.first_seen_from_account_id)
                        .bind(tag.usable)
                        .bind(tag.listable)
                        .bind(tag.last_status_at)
                        .bind(tag.created_at)
                        .bind(tag.updated_at)
                        .bind(fold_name(&tag.name))
                        .execute(pool)
                        .await?
                        .rows_affected()
                });
                if inserted == 0 {
                    tracing::debug!(tag = %tag.name, "tag already present, re-reading");
                }

                self.fetch_by_name(&tag.name).await?.ok_or_else(|| {
                    DbError::Internal(anyhow::anyhow!(
                        "tag {} vanished after insert",
                        tag.name
                    ))
                })
            })
            .await
    }

    /// Record that a status used this tag at `at`
    pub async fn touch(&self, ctx: &Context, id: &str, at: DateTime<Utc>) -> Result<()> {
        let sql = self
            .conn
            .sql("UPDATE tags SET last_status_at = ? WHERE id = ?")
            .into_owned();

        self.conn
            .run(ctx, "update", "tags", async {
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(at)
                        .bind(id)
                        .execute(pool)
                        .await?
                        .rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("tag {id}")));
                }
                Ok(())
            })
            .await
    }

    pub async fn set_usable(&self, ctx: &Context, id: &str, usable: bool) -> Result<()> {
        let sql = self
            .conn
            .sql("UPDATE tags SET usable = ?, updated_at = ? WHERE id = ?")
            .into_owned();
        let now = Utc::now();

        self.conn
            .run(ctx, "update", "tags", async {
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(usable)
                        .bind(now)
                        .bind(id)
                        .execute(pool)
                        .await?
                        .rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("tag {id}")));
                }
                Ok(())
            })
            .await
    }

    /// Tags attached to a status, by name
    pub async fn get_for_status(&self, ctx: &Context, status_id: &str) -> Result<Vec<Tag>> {
        let sql = self
            .conn
            .sql(
                "SELECT t.id, t.name, t.url, t.first_seen_from_account_id, t.usable, t.listable, \
                        t.last_status_at, t.created_at, t.updated_at \
                 FROM tags t \
                 JOIN status_to_tags st ON st.tag_id = t.id \
                 WHERE st.status_id = ? \
                 ORDER BY t.name",
            )
            .into_owned();

        self.conn
            .run(ctx, "select", "tags", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Tag>(&sql).bind(status_id).fetch_all(pool).await?
                }))
            })
            .await
    }

    async fn fetch_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let sql = self
            .conn
            .sql(&format!(
                "SELECT {COLUMNS} FROM tags WHERE name_folded = ? LIMIT 1"
            ))
            .into_owned();

        Ok(with_pool!(self.conn, pool => {
            sqlx::query_as::<_, Tag>(&sql)
                .bind(fold_name(name))
                .fetch_optional(pool)
                .await?
        }))
    }
}
