//! rustresort-store binary entry point
//!
//! Runs the storage startup gate: connect, migrate, report. A serving
//! process performs the same steps before it accepts traffic.

use std::time::Duration;

use rustresort_store::config;
use rustresort_store::data::{Context, Database};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const STARTUP_TIMEOUT: Duration = Duration::from_secs(120);

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging from `logging.*`
/// 3. Initialize metrics
/// 4. Open the database (connect + migrate)
/// 5. Report pool state and exit
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Load configuration; tracing is not up yet, so errors go to stderr
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging
    init_tracing(&config.logging);

    tracing::info!("Starting rustresort-store...");
    tracing::info!(
        domain = %config.server.domain,
        backend = config.database.backend.as_str(),
        "Configuration loaded"
    );

    // 3. Initialize metrics
    rustresort_store::metrics::init_metrics();

    // 4. Open the database; Ctrl-C aborts a hanging connect or migration
    let (ctx, cancel) = Context::cancellable();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling startup");
            cancel.cancel();
        }
    });
    let ctx = ctx.with_timeout(STARTUP_TIMEOUT);

    let db = match Database::open(&ctx, &config).await {
        Ok(db) => db,
        Err(error) => {
            tracing::error!(%error, kind = error.kind(), "database startup failed");
            return Err(error.into());
        }
    };

    // 5. Report and exit
    let stats = db.pool_stats();
    let sizing = db.conn().sizing();
    tracing::info!(
        dialect = db.conn().dialect().name(),
        open = stats.size,
        idle = stats.idle,
        max_open = sizing.max_open,
        "Database ready"
    );
    tracing::debug!(metrics = %rustresort_store::metrics::gather_text(), "metrics snapshot");

    db.close().await;
    Ok(())
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.filter_directives().into());

    if logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}
