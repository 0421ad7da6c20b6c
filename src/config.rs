//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration file (config/default.toml, config/local.toml)
//! 3. Environment variables (override)
//!
//! The resulting [`AppConfig`] is constructed once and passed by reference
//! into [`crate::data::DbConn::open`] and the reference resolver.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::DbError;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

/// Public identity of the instance
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Public domain (e.g., "social.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://social.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// Embedded file-based engine
    #[default]
    Sqlite,
    /// Network relational engine
    #[serde(alias = "postgresql")]
    Postgres,
}

impl DatabaseBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

/// TLS mode for the network backend
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext connection
    #[default]
    #[serde(alias = "disabled")]
    Disable,
    /// Attempt TLS, accept unverified certificates
    #[serde(alias = "opportunistic")]
    Enable,
    /// Verify the certificate chain (optionally against `tls_ca_cert`)
    #[serde(alias = "required")]
    Require,
}

/// Database configuration
///
/// Only `backend` is always meaningful. The network fields are validated
/// when `backend = "postgres"`, and `address` doubles as the SQLite file
/// path (or `:memory:`).
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    /// Host name (postgres) or file path (sqlite)
    pub address: String,
    /// Port number, 0 means unset
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database name (postgres only)
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub tls_mode: TlsMode,
    /// Optional PEM CA certificate appended to the trust roots
    pub tls_ca_cert: Option<PathBuf>,
    /// Name reported to the server as connection metadata
    #[serde(default = "default_application_name")]
    pub application_name: String,
}

fn default_application_name() -> String {
    "rustresort".to_string()
}

impl DatabaseConfig {
    /// SQLite config pointing at a file path
    pub fn sqlite(path: impl Into<String>) -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            address: path.into(),
            port: 0,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            tls_mode: TlsMode::Disable,
            tls_ca_cert: None,
            application_name: default_application_name(),
        }
    }
}

/// Cache configuration
///
/// TTLs are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub account_ttl: u64,
    pub status_ttl: u64,
    pub mention_ttl: u64,
    pub notification_ttl: u64,
    /// Maximum entries per cache
    pub max_capacity: u64,
}

impl CacheConfig {
    pub fn account_ttl(&self) -> Duration {
        Duration::from_secs(self.account_ttl)
    }

    pub fn status_ttl(&self) -> Duration {
        Duration::from_secs(self.status_ttl)
    }

    pub fn mention_ttl(&self) -> Duration {
        Duration::from_secs(self.mention_ttl)
    }

    pub fn notification_ttl(&self) -> Duration {
        Duration::from_secs(self.notification_ttl)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            account_ttl: 300,
            status_ttl: 300,
            mention_ttl: 300,
            notification_ttl: 300,
            max_capacity: 10_000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl LoggingConfig {
    const LEVELS: [&'static str; 5] = ["trace", "debug", "info", "warn", "error"];

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }

    /// Default `EnvFilter` directives; `RUST_LOG` overrides them
    pub fn filter_directives(&self) -> String {
        format!("rustresort_store={},sqlx=warn", self.level.to_ascii_lowercase())
    }

    fn validate(&self) -> Result<(), DbError> {
        if !Self::LEVELS.contains(&self.level.to_ascii_lowercase().as_str()) {
            return Err(DbError::Config(format!(
                "logging.level must be one of {}, got {}",
                Self::LEVELS.join(", "),
                self.level
            )));
        }
        if !self.is_json() && !self.format.eq_ignore_ascii_case("pretty") {
            return Err(DbError::Config(format!(
                "logging.format must be pretty or json, got {}",
                self.format
            )));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (RUSTRESORT__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, DbError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            .set_default("server.domain", "localhost")?
            .set_default("server.protocol", "http")?
            .set_default("database.backend", "sqlite")?
            .set_default("database.address", "data/rustresort.db")?
            .set_default("database.port", 0)?
            .set_default("database.tls_mode", "disable")?
            .set_default("database.application_name", "rustresort")?
            .set_default("cache.account_ttl", 300)?
            .set_default("cache.status_ttl", 300)?
            .set_default("cache.mention_ttl", 300)?
            .set_default("cache.notification_ttl", 300)?
            .set_default("cache.max_capacity", 10_000)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("RUSTRESORT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DbError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| DbError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    fn validate(&self) -> Result<(), DbError> {
        if self.database.address.trim().is_empty() {
            return Err(DbError::Config("database.address must be set".to_string()));
        }

        if normalized_server_host(&self.server.domain).is_empty() {
            return Err(DbError::Config("server.domain must be set".to_string()));
        }

        if !matches!(self.server.protocol.as_str(), "http" | "https") {
            return Err(DbError::Config(format!(
                "server.protocol must be http or https, got {}",
                self.server.protocol
            )));
        }

        if self.cache.max_capacity == 0 {
            return Err(DbError::Config(
                "cache.max_capacity must be greater than 0".to_string(),
            ));
        }

        self.logging.validate()
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}
