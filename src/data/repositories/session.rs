//! Server-wide web session secrets

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use rand::RngCore;

use crate::data::connection::{DbConn, with_pool};
use crate::data::context::Context;
use crate::data::models::{EntityId, Session};
use crate::error::Result;

const COLUMNS: &str = "id, auth_key, crypt_key, created_at";
const KEY_BYTES: usize = 32;

pub struct SessionRepository {
    conn: Arc<DbConn>,
}

impl SessionRepository {
    pub fn new(conn: Arc<DbConn>) -> Self {
        Self { conn }
    }

    /// The session key pair, generated on first use.
    ///
    /// If two callers race to create it, both return the oldest row.
    pub async fn get_or_create(&self, ctx: &Context) -> Result<Session> {
        if let Some(session) = self.first(ctx).await? {
            return Ok(session);
        }

        let session = Session {
            id: EntityId::new().0,
            auth_key: generate_key(),
            crypt_key: generate_key(),
            created_at: Utc::now(),
        };
        let sql = self
            .conn
            .sql(&format!("INSERT INTO sessions ({COLUMNS}) VALUES (?, ?, ?, ?)"))
            .into_owned();

        self.conn
            .run(ctx, "insert", "sessions", async {
                with_pool!(self.conn, pool => {
                    sqlx::query(&sql)
                        .bind(&session.id)
                        .bind(&session.auth_key)
                        .bind(&session.crypt_key)
                        .bind(session.created_at)
                        .execute(pool)
                        .await?;
                });
                Ok(())
            })
            .await?;
        tracing::info!("generated new web session keys");

        Ok(self.first(ctx).await?.unwrap_or(session))
    }

    async fn first(&self, ctx: &Context) -> Result<Option<Session>> {
        let sql = format!("SELECT {COLUMNS} FROM sessions ORDER BY created_at, id LIMIT 1");

        self.conn
            .run(ctx, "select", "sessions", async {
                Ok(with_pool!(self.conn, pool => {
                    sqlx::query_as::<_, Session>(&sql).fetch_optional(pool).await?
                }))
            })
            .await
    }
}

fn generate_key() -> String {
    let mut bytes = [0_u8; KEY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
