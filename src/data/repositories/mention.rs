//! Mention lookups
//!
//! Mentions are written by `StatusRepository::put` and removed with their
//! status; this repository only reads them.

use std::sync::Arc;

use futures::future::try_join_all;

use super::get_cached;
use crate::data::cache::EntityCache;
use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::Mention;
use crate::error::Result;

const COLUMNS: &str = "id, status_id, origin_account_id, origin_account_uri, target_account_id, \
                       target_account_uri, target_account_url, name_string, silent, created_at";

pub struct MentionRepository {
    conn: Arc<DbConn>,
    cache: Arc<EntityCache<Mention>>,
}

impl MentionRepository {
    pub fn new(conn: Arc<DbConn>, cache: Arc<EntityCache<Mention>>) -> Self {
        Self { conn, cache }
    }

    pub async fn get_by_id(&self, ctx: &Context, id: &str) -> Result<Option<Mention>> {
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM mentions WHERE id = ?"))
            .into_owned();

        let load = self.conn.run(ctx, "select", "mentions", async {
            Ok(with_pool!(self.conn, pool => {
                sqlx::query_as::<_, Mention>(&sql)
                    .bind(id)
                    .fetch_optional(pool)
                    .await?
            }))
        });

        get_cached(&self.cache, format!("id:{id}"), load).await
    }

    /// Fetch several mentions, keeping the order of `ids`.
    ///
    /// Ids that no longer exist are skipped.
    pub async fn get_by_ids(&self, ctx: &Context, ids: &[String]) -> Result<Vec<Mention>> {
        let found = try_join_all(ids.iter().map(|id| self.get_by_id(ctx, id))).await?;

        Ok(ids
            .iter()
            .zip(found)
            .filter_map(|(id, mention)| {
                if mention.is_none() {
                    tracing::debug!(mention_id = %id, "mention not found, skipping");
                }
                mention
            })
            .collect())
    }

    /// Every mention carried by a status, oldest first
    pub async fn get_for_status(&self, ctx: &Context, status_id: &str) -> Result<Vec<Mention>> {
        let sql = self
            .conn
            .sql(&format!(
                "SELECT {COLUMNS} FROM mentions WHERE status_id = ? ORDER BY id"
            ))
            .into_owned();

        let mentions = self
            .conn
            .run(ctx, "select", "mentions", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Mention>(&sql)
                        .bind(status_id)
                        .fetch_all(pool)
                        .await?
                }))
            })
            .await?;

        for mention in &mentions {
            self.cache.put_entity(mention.clone()).await;
        }
        Ok(mentions)
    }

    /// Drop a mention from the cache
    pub async fn invalidate(&self, id: &str) {
        self.cache.invalidate(&format!("id:{id}")).await;
    }
}
