//! rustresort-store - persistence layer of a federated social server
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Reference resolver (mentions, hashtags, custom emoji)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - Repositories behind the `Database` façade                │
//! │  - Entity caches (moka, volatile)                           │
//! │  - Migration engine                                         │
//! │  - Connection manager (SQLite / PostgreSQL via sqlx)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `service`: Reference resolution on top of the repositories
//! - `data`: Connection, migrations, caches and repositories
//! - `config`: Configuration management
//! - `error`: Error types
//! - `metrics`: Prometheus instruments

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod service;
