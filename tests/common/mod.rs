//! Common test utilities for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use rustresort_store::config;
use rustresort_store::data::{Account, Context, Database, EntityId};
use rustresort_store::service::ReferenceResolver;
use tempfile::TempDir;

/// Test store instance backed by a temporary SQLite file
pub struct TestStore {
    pub config: config::AppConfig,
    pub db: Arc<Database>,
    pub resolver: ReferenceResolver,
    pub _temp_dir: TempDir,
}

impl TestStore {
    /// Create a new, fully migrated store
    pub async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config = test_config(&temp_dir);

        let db = Arc::new(Database::open(&Context::background(), &config).await.unwrap());
        let resolver = ReferenceResolver::new(Arc::clone(&db), &config.server);

        Self {
            config,
            db,
            resolver,
            _temp_dir: temp_dir,
        }
    }

    pub fn ctx(&self) -> Context {
        Context::background()
    }

    /// Create a local account in the database
    pub async fn create_local_account(&self, username: &str) -> Account {
        self.create_account(username, None).await
    }

    /// Create an account in the database
    pub async fn create_account(&self, username: &str, domain: Option<&str>) -> Account {
        let host = domain.unwrap_or(&self.config.server.domain);
        let mut account = local_account(username, host);
        account.domain = domain.map(str::to_string);

        self.db.accounts().put(&self.ctx(), &account).await.unwrap();
        account
    }
}

/// An unsaved local account served from `host`
pub fn local_account(username: &str, host: &str) -> Account {
    let now = Utc::now();
    Account {
        id: EntityId::new().0,
        username: username.to_string(),
        domain: None,
        display_name: Some(username.to_string()),
        uri: format!("https://{host}/users/{username}"),
        url: Some(format!("https://{host}/@{username}")),
        inbox_uri: Some(format!("https://{host}/users/{username}/inbox")),
        public_key_pem: None,
        created_at: now,
        updated_at: now,
    }
}

/// SQLite test configuration rooted in `temp_dir`
pub fn test_config(temp_dir: &TempDir) -> config::AppConfig {
    config::AppConfig {
        server: config::ServerConfig {
            domain: "test.example.com".to_string(),
            protocol: "https".to_string(),
        },
        database: config::DatabaseConfig::sqlite(
            temp_dir.path().join("test.db").to_string_lossy().to_string(),
        ),
        cache: config::CacheConfig::default(),
        logging: config::LoggingConfig {
            level: "info".to_string(),
            format: "pretty".to_string(),
        },
    }
}

pub fn tokens(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}
