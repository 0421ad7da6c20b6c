//! Domain blocks

use std::sync::Arc;

use super::placeholders;
use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::DomainBlock;
use crate::error::{DbError, Result};

const COLUMNS: &str =
    "id, domain, created_by_account_id, private_comment, public_comment, created_at";

pub struct DomainRepository {
    conn: Arc<DbConn>,
}

impl DomainRepository {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    /// Whether `domain`, or any parent of it, is blocked.
    ///
    /// A block on `example.org` also covers `social.example.org`. An empty
    /// domain (a local reference) is never blocked.
    pub async fn is_domain_blocked(&self, ctx: &Context, domain: &str) -> Result<bool> {
        let Some(domain) = normalize_domain(domain) else {
            return Ok(false);
        };
        let candidates = parent_domains(&domain);

        let sql = self
            .conn
            .sql(&format!(
                "SELECT COUNT(*) FROM domain_blocks WHERE domain IN ({})",
                placeholders(candidates.len())
            ))
            .into_owned();

        self.conn
            .run(ctx, "select", "domain_blocks", async {
                let count = with_pool!(self.conn, pool => {
                    let mut query = sqlx::query_scalar::<_, i64>(&sql);
                    for candidate in &candidates {
                        query = query.bind(candidate);
                    }
                    query.fetch_one(pool).await?
                });
                Ok(count > 0)
            })
            .await
    }

    /// The block recorded for exactly `domain`
    pub async fn get_block(&self, ctx: &Context, domain: &str) -> Result<Option<DomainBlock>> {
        let Some(domain) = normalize_domain(domain) else {
            return Ok(None);
        };
        let sql = self
            .conn
            .sql(&format!("SELECT {COLUMNS} FROM domain_blocks WHERE domain = ?"))
            .into_owned();

        self.conn
            .run(ctx, "select", "domain_blocks", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, DomainBlock>(&sql)
                        .bind(&domain)
                        .fetch_optional(pool)
                        .await?
                }))
            })
            .await
    }

    /// Every block, newest first
    pub async fn list_blocks(&self, ctx: &Context) -> Result<Vec<DomainBlock>> {
        let sql = format!("SELECT {COLUMNS} FROM domain_blocks ORDER BY created_at DESC");

        self.conn
            .run(ctx, "select", "domain_blocks", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, DomainBlock>(&sql).fetch_all(pool).await?
                }))
            })
            .await
    }

    /// Record a block; the domain is stored case-folded
    ///
    /// # Errors
    /// - `Validation` for an empty or unparseable domain
    /// - `AlreadyExists` if the domain is already blocked
    pub async fn create_block(&self, ctx: &Context, block: &DomainBlock) -> Result<()> {
        let domain = normalize_domain(&block.domain).ok_or_else(|| {
            DbError::Validation(format!("domain '{}' was not valid", block.domain))
        })?;
        let sql = self
            .conn
            .sql(&format!(
                "INSERT INTO domain_blocks ({COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)"
            ))
            .into_owned();

        self.conn
            .run(ctx, "insert", "domain_blocks", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&block.id)
                        .bind(&domain)
                        .bind(&block.created_by_account_id)
                        .bind(&block.private_comment)
                        .bind(&block.public_comment)
                        .bind(block.created_at)
                        .execute(pool)
                        .await?;
                });
                Ok(())
            })
            .await?;

        tracing::info!(%domain, "domain blocked");
        Ok(())
    }

    pub async fn delete_block(&self, ctx: &Context, domain: &str) -> Result<()> {
        let Some(domain) = normalize_domain(domain) else {
            return Err(DbError::NotFound(format!("domain block {domain}")));
        };
        let sql = self
            .conn
            .sql("DELETE FROM domain_blocks WHERE domain = ?")
            .into_owned();

        self.conn
            .run(ctx, "delete", "domain_blocks", async {
                let affected = with_pool!(self.conn, pool => {
                    sqlx::query(&sql).bind(&domain).execute(pool).await?.rows_affected()
                });
                if affected == 0 {
                    return Err(DbError::NotFound(format!("domain block {domain}")));
                }
                Ok(())
            })
            .await?;

        tracing::info!(%domain, "domain unblocked");
        Ok(())
    }
}

/// Lower-cased host part of `domain`, IDNs in punycode
fn normalize_domain(domain: &str) -> Option<String> {
    let domain = domain.trim().trim_end_matches('.');
    if domain.is_empty() {
        return None;
    }
    let parsed = url::Url::parse(&format!("http://{domain}")).ok()?;
    parsed.host_str().map(str::to_ascii_lowercase)
}

/// `a.b.c` → `["a.b.c", "b.c", "c"]`
fn parent_domains(domain: &str) -> Vec<String> {
    let labels: Vec<&str> = domain.split('.').collect();
    (0..labels.len()).map(|i| labels[i..].join(".")).collect()
}
