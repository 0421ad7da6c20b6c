//! Request context
//!
//! Every repository call takes a [`Context`] carrying an optional deadline
//! and an optional cancellation signal. [`Context::run`] races the query
//! future against both; when either fires, the query future is dropped.
//! For SQLite the statement still running on the connection's worker is
//! aborted as well (see `data::interrupt`).

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{DbError, Result};

/// Cancellable, deadline-bounded request scope
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Handle that cancels every context derived from it
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // send_replace never fails, even with every receiver dropped
        self.tx.send_replace(true);
    }
}

impl Context {
    /// Context that never expires and cannot be cancelled
    pub fn background() -> Self {
        Self::default()
    }

    /// Context plus the handle that cancels it
    pub fn cancellable() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                deadline: None,
                cancel: Some(rx),
            },
            CancelHandle { tx },
        )
    }

    /// Derive a context that also expires after `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with `deadline`, keeping the earlier of the two
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Error for an already-terminated context, if any
    pub fn err(&self) -> Option<DbError> {
        if self.is_cancelled() {
            return Some(DbError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(DbError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolve once the context is cancelled or past its deadline, with the
    /// matching error.
    pub async fn done(&self) -> DbError {
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = wait_cancelled(self.cancel.clone()) => DbError::Cancelled,
            _ = expired => DbError::DeadlineExceeded,
        }
    }

    /// Run `fut` under this context.
    ///
    /// Returns `Cancelled` / `DeadlineExceeded` without polling `fut` when the
    /// context is already done, and drops `fut` as soon as it becomes done.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }

        tokio::select! {
            biased;
            err = self.done() => Err(err),
            result = fut => result,
        }
    }
}

async fn wait_cancelled(rx: Option<watch::Receiver<bool>>) {
    let Some(mut rx) = rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without cancelling: never fires
            return std::future::pending().await;
        }
    }
}
