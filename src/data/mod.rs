//! Data layer module
//!
//! Handles all data persistence and caching:
//! - Connection management for SQLite and PostgreSQL
//! - Schema migrations
//! - Entity caches (volatile)
//! - Repositories per entity family

pub mod cache;
pub mod connection;
pub mod context;
mod database;
mod interrupt;
pub mod migrations;
mod models;
pub mod repositories;
pub mod schema;
pub mod tls;

pub use cache::{Cacheable, EntityCache};
pub use connection::{DbConn, DbPool, Dialect, PoolSizing, PoolStats};
pub use context::{CancelHandle, Context};
pub use database::Database;
pub use migrations::{Migration, MigrationOutcome, Migrator, MigratorState, run_migrations};
pub use models::*;

#[cfg(test)]
mod database_test;
