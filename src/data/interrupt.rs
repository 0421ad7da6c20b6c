//! Interruption of in-flight SQLite statements
//!
//! Dropping a sqlx future does not stop SQLite: the statement keeps running
//! on the connection's worker thread, and the connection stays checked out
//! of the pool until it finishes. Each pooled SQLite connection is therefore
//! given a progress handler bound to the [`run`] call that acquired it.
//! Once that call is cancelled the handler aborts the statement, the worker
//! frees up, and the connection goes back to the pool.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use sqlx::sqlite::SqliteConnection;

use super::context::Context;
use crate::error::Result;

/// VM instructions between two progress handler checks
const PROGRESS_OPS: i32 = 1_000;

#[derive(Debug, Default)]
struct Interrupt {
    requested: AtomicBool,
}

impl Interrupt {
    fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

tokio::task_local! {
    static CURRENT: Arc<Interrupt>;
}

/// Bind `conn` to the surrounding [`run`] call, if any.
///
/// Installed as both the `after_connect` and the `before_acquire` pool hook,
/// so every checkout rebinds the connection to its new user. Connections
/// acquired outside [`run`] lose any handler left by a previous user.
pub(crate) fn bind_connection(
    conn: &mut SqliteConnection,
) -> BoxFuture<'_, std::result::Result<(), sqlx::Error>> {
    let current = CURRENT.try_with(Arc::clone).ok();

    Box::pin(async move {
        let mut handle = conn.lock_handle().await?;
        match current {
            Some(interrupt) => {
                handle.set_progress_handler(PROGRESS_OPS, move || !interrupt.is_requested())
            }
            None => handle.remove_progress_handler(),
        }
        Ok(())
    })
}

/// [`bind_connection`] in the shape `before_acquire` expects
pub(crate) fn bind_on_acquire(
    conn: &mut SqliteConnection,
) -> BoxFuture<'_, std::result::Result<bool, sqlx::Error>> {
    Box::pin(async move {
        bind_connection(conn).await?;
        Ok(true)
    })
}

/// Run `fut` under `ctx`, aborting its SQLite statements when `ctx` ends.
pub(crate) async fn run<T, F>(ctx: &Context, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if let Some(err) = ctx.err() {
        return Err(err);
    }

    let interrupt = Arc::new(Interrupt::default());
    CURRENT
        .scope(Arc::clone(&interrupt), async {
            tokio::select! {
                biased;
                err = ctx.done() => {
                    // `fut` is gone; its statement may still be on the worker
                    interrupt.request();
                    tracing::debug!(%err, "interrupting sqlite statement");
                    Err(err)
                }
                result = fut => result,
            }
        })
        .await
}
