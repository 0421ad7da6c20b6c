//! Custom emoji persistence
//!
//! Emoji are provisioned out-of-band (admin upload or federation); the
//! resolver only ever reads them.

use std::sync::Arc;

use chrono::Utc;

use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::Emoji;
use crate::error::{DbError, Result};

const COLUMNS: &str = "id, shortcode, domain, uri, image_url, visible_in_picker, disabled, \
                       category, created_at, updated_at";

pub struct EmojiRepository {
    conn: Arc<DbConn>,
}

impl EmojiRepository {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    pub async fn get_by_id(&self, ctx: &Context, id: &str) -> Result<Option<Emoji>> {
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM emojis WHERE id = ?"))
            .into_owned();

        self.conn
            .run(ctx, "select", "emojis", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Emoji>(&sql).bind(id).fetch_optional(pool).await?
                }))
            })
            .await
    }

    /// Exact shortcode lookup; `domain: None` means a local emoji
    pub async fn get_by_shortcode_domain(
        &self,
        ctx: &Context,
        shortcode: &str,
        domain: Option<&str>,
    ) -> Result<Option<Emoji>> {
        let sql = match domain {
            Some(_) => format!(
                "SELECT {COLUMNS} FROM emojis WHERE shortcode = ? AND LOWER(domain) = LOWER(?) LIMIT 1"
            ),
            None => format!(
                "SELECT {COLUMNS} FROM emojis WHERE shortcode = ? AND domain IS NULL LIMIT 1"
            ),
        };
        let sql = self.conn.sql(&sql).into_owned();

        self.conn
            .run(ctx, "select", "emojis", async {
                Ok(with_pool!(self.conn, pool => {
                    let mut query = sqlx::query_as::<_, Emoji>(&sql).bind(shortcode);
                    if let Some(domain) = domain {
                        query = query.bind(domain);
                    }
                    query.fetch_optional(pool).await?
                }))
            })
            .await
    }

    /// An emoji usable in new content: visible in the picker and enabled.
    ///
    /// Local emoji win over remote ones with the same shortcode.
    pub async fn get_usable_by_shortcode(
        &self,
        ctx: &Context,
        shortcode: &str,
    ) -> Result<Option<Emoji>> {
        let sql = self
            .conn
            .sql(&format!(
                "SELECT {COLUMNS} FROM emojis \
                 WHERE shortcode = ? AND visible_in_picker = ? AND disabled = ? \
                 ORDER BY CASE WHEN domain IS NULL THEN 0 ELSE 1 END, domain \
                 LIMIT 1"
            ))
            .into_owned();

        self.conn
            .run(ctx, "select", "emojis", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Emoji>(&sql)
                        .bind(shortcode)
                        .bind(true)
                        .bind(false)
                        .fetch_optional(pool)
                        .await?
                }))
            })
            .await
    }

    /// Insert a new emoji
    ///
    /// # Errors
    /// `AlreadyExists` when the URI or `(shortcode, domain)` is taken
    pub async fn put(&self, ctx: &Context, emoji: &Emoji) -> Result<()> {
        let sql = self
            .conn
            .sql(&format!(
                "INSERT INTO emojis ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            ))
            .into_owned();

        self.conn
            .run(ctx, "insert", "emojis", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&emoji.id)
                        .bind(&emoji.shortcode)
                        .bind(&emoji.domain)
                        .bind(&emoji.uri)
                        .bind(&emoji.image_url)
                        .bind(emoji.visible_in_picker)
                        .bind(emoji.disabled)
                        .bind(&emoji.category)
                        .bind(emoji.created_at)
                        .bind(emoji.updated_at)
                        .execute(pool)
                        .await?;
                });
                Ok(())
            })
            .await
    }

    pub async fn set_disabled(&self, ctx: &Context, id: &str, disabled: bool) -> Result<()> {
        let sql = self
            .conn
            .sql("UPDATE emojis SET disabled = ?, updated_at = ? WHERE id = ?")
            .into_owned();
        let now = Utc::now();

        self.conn
            .run(ctx, "update", "emojis", async {
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(disabled)
                        .bind(now)
                        .bind(id)
                        .execute(pool)
                        .await?
                        .rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("emoji {id}")));
                }
                Ok(())
            })
            .await
    }

    /// Emoji attached to a status, by shortcode
    pub async fn get_for_status(&self, ctx: &Context, status_id: &str) -> Result<Vec<Emoji>> {
        let sql = self
            .conn
            .sql(
                "SELECT e.id, e.shortcode, e.domain, e.uri, e.image_url, e.visible_in_picker, \
                        e.disabled, e.category, e.created_at, e.updated_at \
                 FROM emojis e \
                 JOIN status_to_emojis se ON se.emoji_id = e.id \
                 WHERE se.status_id = ? \
                 ORDER BY e.shortcode",
            )
            .into_owned();

        self.conn
            .run(ctx, "select", "emojis", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Emoji>(&sql).bind(status_id).fetch_all(pool).await?
                }))
            })
            .await
    }
}
