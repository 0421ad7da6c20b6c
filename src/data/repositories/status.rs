//! Status persistence
//!
//! A status row owns three kinds of references: tag and emoji join rows,
//! and the mentions it carries. They are written together with the status
//! in one transaction and removed with it by `ON DELETE CASCADE`.

use std::sync::Arc;

use super::{get_cached, unique_ids};
use crate::data::cache::EntityCache;
use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::{Mention, Notification, Status};
use crate::error::{DbError, Result};

pub(super) const COLUMNS: &str = "id, uri, url, content, local, account_id, account_uri, in_reply_to_id, \
                       visibility, sensitive, created_at, updated_at";

const MENTION_COLUMNS: &str = "id, status_id, origin_account_id, origin_account_uri, \
                               target_account_id, target_account_uri, target_account_url, \
                               name_string, silent, created_at";

pub struct StatusRepository {
    conn: Arc<DbConn>,
    cache: Arc<EntityCache<Status>>,
    mentions: Arc<EntityCache<Mention>>,
    notifications: Arc<EntityCache<Notification>>,
}

impl StatusRepository {
    pub fn new(
        conn: Arc<DbConn>,
        cache: Arc<EntityCache<Status>>,
        mentions: Arc<EntityCache<Mention>>,
        notifications: Arc<EntityCache<Notification>>,
    ) -> Self {
        Self {
            conn,
            cache,
            mentions,
            notifications,
        }
    }

    pub async fn get_by_id(&self, ctx: &Context, id: &str) -> Result<Option<Status>> {
        get_cached(
            &self.cache,
            format!("id:{id}"),
            self.conn.run(ctx, "select", "statuses", self.fetch_by("id", id)),
        )
        .await
    }

    pub async fn get_by_uri(&self, ctx: &Context, uri: &str) -> Result<Option<Status>> {
        get_cached(
            &self.cache,
            format!("uri:{uri}"),
            self.conn.run(ctx, "select", "statuses", self.fetch_by("uri", uri)),
        )
        .await
    }

    pub async fn get_by_url(&self, ctx: &Context, url: &str) -> Result<Option<Status>> {
        get_cached(
            &self.cache,
            format!("url:{url}"),
            self.conn.run(ctx, "select", "statuses", self.fetch_by("url", url)),
        )
        .await
    }

    /// Store a status with its tag/emoji join rows and its mentions.
    ///
    /// Everything is written in one transaction: on error nothing is stored.
    ///
    /// # Errors
    /// - `Validation` if a mention belongs to another status
    /// - `AlreadyExists` if the status id or URI is taken
    pub async fn put(&self, ctx: &Context, status: &Status, mentions: &[Mention]) -> Result<()> {
        if let Some(stray) = mentions.iter().find(|m| m.status_id != status.id) {
            return Err(DbError::Validation(format!(
                "mention {} belongs to status {}, not {}",
                stray.id, stray.status_id, status.id
            )));
        }

        let insert_status = self
            .conn
            .sql(&format!(
                "INSERT INTO statuses ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .into_owned();
        let insert_mention = self
            .conn
            .sql(&format!(
                "INSERT INTO mentions ({MENTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .into_owned();
        let insert_tag = self
            .conn
            .sql("INSERT INTO status_to_tags (status_id, tag_id) VALUES (?, ?)")
            .into_owned();
        let insert_emoji = self
            .conn
            .sql("INSERT INTO status_to_emojis (status_id, emoji_id) VALUES (?, ?)")
            .into_owned();

        let tag_ids = unique_ids(&status.tag_ids);
        let emoji_ids = unique_ids(&status.emoji_ids);

        self.conn
            .run(ctx, "insert", "statuses", async {
                with_pool!(self.conn, pool => {
                    let mut tx = pool.begin().await?;

                    sqlx::query(&insert_status)
                        .bind(&status.id)
                        .bind(&status.uri)
                        .bind(&status.url)
                        .bind(&status.content)
                        .bind(status.local)
                        .bind(&status.account_id)
                        .bind(&status.account_uri)
                        .bind(&status.in_reply_to_id)
                        .bind(&status.visibility)
                        .bind(status.sensitive)
                        .bind(status.created_at)
                        .bind(status.updated_at)
                        .execute(&mut *tx)
                        .await?;

                    for tag_id in &tag_ids {
                        sqlx::query(&insert_tag)
                            .bind(&status.id)
                            .bind(tag_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    for emoji_id in &emoji_ids {
                        sqlx::query(&insert_emoji)
                            .bind(&status.id)
                            .bind(emoji_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    for mention in mentions {
                        sqlx::query(&insert_mention)
                            .bind(&mention.id)
                            .bind(&mention.status_id)
                            .bind(&mention.origin_account_id)
                            .bind(&mention.origin_account_uri)
                            .bind(&mention.target_account_id)
                            .bind(&mention.target_account_uri)
                            .bind(&mention.target_account_url)
                            .bind(&mention.name_string)
                            .bind(mention.silent)
                            .bind(mention.created_at)
                            .execute(&mut *tx)
                            .await?;
                    }

                    tx.commit().await?;
                });
                Ok(())
            })
            .await?;

        let mut stored = status.clone();
        stored.tag_ids = tag_ids;
        stored.emoji_ids = emoji_ids;
        stored.mention_ids = unique_ids(&mentions.iter().map(|m| m.id.clone()).collect::<Vec<_>>());

        self.cache.put_entity(stored).await;
        for mention in mentions {
            self.mentions.put_entity(mention.clone()).await;
        }

        tracing::debug!(
            status_id = %status.id,
            tags = status.tag_ids.len(),
            emojis = status.emoji_ids.len(),
            mentions = mentions.len(),
            "status stored"
        );
        Ok(())
    }

    /// Overwrite the mutable fields of a status and replace its tag and
    /// emoji join rows. Mentions are left untouched.
    pub async fn update(&self, ctx: &Context, status: &Status) -> Result<()> {
        let update = self
            .conn
            .sql(
                "UPDATE statuses SET url = ?, content = ?, in_reply_to_id = ?, visibility = ?, \
                 sensitive = ?, updated_at = ? WHERE id = ?",
            )
            .into_owned();
        let clear_tags = self
            .conn
            .sql("DELETE FROM status_to_tags WHERE status_id = ?")
            .into_owned();
        let clear_emojis = self
            .conn
            .sql("DELETE FROM status_to_emojis WHERE status_id = ?")
            .into_owned();
        let insert_tag = self
            .conn
            .sql("INSERT INTO status_to_tags (status_id, tag_id) VALUES (?, ?)")
            .into_owned();
        let insert_emoji = self
            .conn
            .sql("INSERT INTO status_to_emojis (status_id, emoji_id) VALUES (?, ?)")
            .into_owned();

        let tag_ids = unique_ids(&status.tag_ids);
        let emoji_ids = unique_ids(&status.emoji_ids);

        let previous = self
            .conn
            .run(ctx, "update", "statuses", async {
                let Some(previous) = self.fetch_by("id", &status.id).await? else {
                    return Err(DbError::NotFound(format!("status {}", status.id)));
                };

                with_pool!(self.conn, pool => {
                    let mut tx = pool.begin().await?;

                    sqlx::query(&update)
                        .bind(&status.url)
                        .bind(&status.content)
                        .bind(&status.in_reply_to_id)
                        .bind(&status.visibility)
                        .bind(status.sensitive)
                        .bind(status.updated_at)
                        .bind(&status.id)
                        .execute(&mut *tx)
                        .await?;

                    sqlx::query(&clear_tags).bind(&status.id).execute(&mut *tx).await?;
                    sqlx::query(&clear_emojis).bind(&status.id).execute(&mut *tx).await?;

                    for tag_id in &tag_ids {
                        sqlx::query(&insert_tag)
                            .bind(&status.id)
                            .bind(tag_id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    for emoji_id in &emoji_ids {
                        sqlx::query(&insert_emoji)
                            .bind(&status.id)
                            .bind(emoji_id)
                            .execute(&mut *tx)
                            .await?;
                    }

                    tx.commit().await?;
                });
                Ok(previous)
            })
            .await?;

        let mut stored = previous.clone();
        stored.url = status.url.clone();
        stored.content = status.content.clone();
        stored.in_reply_to_id = status.in_reply_to_id.clone();
        stored.visibility = status.visibility.clone();
        stored.sensitive = status.sensitive;
        stored.updated_at = status.updated_at;
        stored.tag_ids = tag_ids;
        stored.emoji_ids = emoji_ids;

        self.cache.replace_entity(Some(&previous), stored).await;
        Ok(())
    }

    /// Delete a status together with its mentions, join rows and
    /// notifications.
    pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
        let delete = self.conn.sql("DELETE FROM statuses WHERE id = ?").into_owned();
        let notification_ids = self
            .conn
            .sql("SELECT id FROM notifications WHERE status_id = ?")
            .into_owned();

        let (previous, notifications) = self
            .conn
            .run(ctx, "delete", "statuses", async {
                let Some(previous) = self.fetch_by("id", id).await? else {
                    return Err(DbError::NotFound(format!("status {id}")));
                };

                let notifications = with_pool!(self.conn, pool => {
                    let notifications: Vec<String> = sqlx::query_scalar(&notification_ids)
                        .bind(id)
                        .fetch_all(pool)
                        .await?;
                    sqlx::query(&delete).bind(id).execute(pool).await?;
                    notifications
                });
                Ok((previous, notifications))
            })
            .await?;

        for mention_id in &previous.mention_ids {
            self.mentions.invalidate(&format!("id:{mention_id}")).await;
        }
        for notification_id in &notifications {
            self.notifications
                .invalidate(&format!("id:{notification_id}"))
                .await;
        }
        self.cache.invalidate_entity(&previous).await;

        tracing::debug!(
            status_id = %id,
            mentions = previous.mention_ids.len(),
            notifications = notifications.len(),
            "status deleted"
        );
        Ok(())
    }

    /// Statuses authored by `account_id`, newest first.
    ///
    /// `max_id` pages backwards: only statuses with a smaller id are returned.
    pub async fn get_account_statuses(
        &self,
        ctx: &Context,
        account_id: &str,
        limit: i64,
        max_id: Option<&str>,
    ) -> Result<Vec<Status>> {
        let mut sql = format!("SELECT {COLUMNS} FROM statuses WHERE account_id = ?");
        if max_id.is_some() {
            sql.push_str(" AND id < ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");
        let sql = self.conn.sql(&sql).into_owned();

        self.conn
            .run(ctx, "select", "statuses", async {
                let mut statuses = with_pool!(self.conn, pool => {
                    let mut query = sqlx::query_as::<_, Status>(&sql).bind(account_id);
                    if let Some(max_id) = max_id {
                        query = query.bind(max_id);
                    }
                    query.bind(limit).fetch_all(pool).await?
                });
                for status in &mut statuses {
                    self.attach_references(status).await?;
                }
                Ok(statuses)
            })
            .await
    }

    async fn fetch_by(&self, column: &'static str, value: &str) -> Result<Option<Status>> {
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM statuses WHERE {column} = ? LIMIT 1"))
            .into_owned();

        let status = with_pool!(self.conn, pool => {
            sqlx::query_as::<_, Status>(&sql)
                .bind(value)
                .fetch_optional(pool)
                .await?
        });

        match status {
            Some(mut status) => {
                self.attach_references(&mut status).await?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// Fill the id lists that live in join tables
    async fn attach_references(&self, status: &mut Status) -> Result<()> {
        let tags = self
            .conn
            .sql("SELECT tag_id FROM status_to_tags WHERE status_id = ? ORDER BY tag_id")
            .into_owned();
        let emojis = self
            .conn
            .sql("SELECT emoji_id FROM status_to_emojis WHERE status_id = ? ORDER BY emoji_id")
            .into_owned();
        let mentions = self
            .conn
            .sql("SELECT id FROM mentions WHERE status_id = ? ORDER BY id")
            .into_owned();

        let (tag_ids, emoji_ids, mention_ids) = with_pool!(self.conn, pool => {
            let tag_ids: Vec<String> = sqlx::query_scalar(&tags)
                .bind(&status.id)
                .fetch_all(pool)
                .await?;
            let emoji_ids: Vec<String> = sqlx::query_scalar(&emojis)
                .bind(&status.id)
                .fetch_all(pool)
                .await?;
            let mention_ids: Vec<String> = sqlx::query_scalar(&mentions)
                .bind(&status.id)
                .fetch_all(pool)
                .await?;
            (tag_ids, emoji_ids, mention_ids)
        });

        status.tag_ids = tag_ids;
        status.emoji_ids = emoji_ids;
        status.mention_ids = mention_ids;
        Ok(())
    }
}
