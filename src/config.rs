//! Configuration surface.
//!
//! Loaded from a YAML file whose keys follow the product's historical
//! configuration (`database.localMemCache.ttlS`, `storage.S3.endPoint`, ...).

use std::path::Path;
use std::time::Duration;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    #[diagnostic(code(drive::config::io))]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    #[diagnostic(code(drive::config::parse))]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(drive::config::invalid))]
    Invalid { message: String },
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.storage.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }
}

// =============================================================================
// Database
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[default]
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "type", default)]
    pub kind: DatabaseKind,
    #[serde(default)]
    pub postgres: PostgresOptions,
    #[serde(default)]
    pub sqlite: SqliteOptions,
    /// Caching is enabled when this section is present.
    #[serde(rename = "localMemCache", default)]
    pub local_mem_cache: Option<LocalMemCacheConfig>,
    /// Background `stats_track` sampling period; off when unset.
    #[serde(rename = "diagnosticsPollMs", default)]
    pub diagnostics_poll_ms: Option<u64>,
}

impl DatabaseConfig {
    pub fn diagnostics_poll(&self) -> Option<Duration> {
        poll_period(self.diagnostics_poll_ms)
    }
}

/// Zero disables polling like an absent value.
fn poll_period(ms: Option<u64>) -> Option<Duration> {
    ms.filter(|ms| *ms > 0).map(Duration::from_millis)
}

/// PostgreSQL connection options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresOptions {
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default)]
    pub ssl: bool,
    #[serde(rename = "idleTimeoutMillis", default)]
    pub idle_timeout_millis: Option<u64>,
    #[serde(rename = "connectionTimeoutMillis", default)]
    pub connection_timeout_millis: Option<u64>,
    #[serde(default)]
    pub statement_timeout: Option<u64>,
    #[serde(default)]
    pub query_timeout: Option<u64>,
    #[serde(rename = "maxConnections", default = "default_pg_max_connections")]
    pub max_connections: u32,
}

fn default_pg_database() -> String {
    "drive".to_string()
}

fn default_pg_user() -> String {
    "drive".to_string()
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_max_connections() -> u32 {
    10
}

impl Default for PostgresOptions {
    fn default() -> Self {
        Self {
            database: default_pg_database(),
            user: default_pg_user(),
            password: String::new(),
            host: default_pg_host(),
            port: default_pg_port(),
            ssl: false,
            idle_timeout_millis: None,
            connection_timeout_millis: None,
            statement_timeout: None,
            query_timeout: None,
            max_connections: default_pg_max_connections(),
        }
    }
}

impl PostgresOptions {
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout.map(Duration::from_millis)
    }
}

/// SQLite options; `:memory:` opens a private in-memory database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqliteOptions {
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

fn default_sqlite_path() -> String {
    "drive.db".to_string()
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

/// In-process cache for single-entity lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMemCacheConfig {
    #[serde(rename = "ttlS", default = "default_ttl_s")]
    pub ttl_s: u64,
    #[serde(default = "default_max_key_count")]
    pub max_key_count: u64,
    #[serde(default = "default_print_period_ms")]
    pub print_period_ms: u64,
    #[serde(default = "default_print_period_idle_ms")]
    pub print_period_idle_ms: u64,
    #[serde(default)]
    pub extra_node_cache_config: ExtraCacheConfig,
}

fn default_ttl_s() -> u64 {
    60
}

fn default_max_key_count() -> u64 {
    10_000
}

fn default_print_period_ms() -> u64 {
    60_000
}

fn default_print_period_idle_ms() -> u64 {
    600_000
}

impl Default for LocalMemCacheConfig {
    fn default() -> Self {
        Self {
            ttl_s: default_ttl_s(),
            max_key_count: default_max_key_count(),
            print_period_ms: default_print_period_ms(),
            print_period_idle_ms: default_print_period_idle_ms(),
            extra_node_cache_config: ExtraCacheConfig::default(),
        }
    }
}

/// Pass-through tuning for the cache library.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtraCacheConfig {
    pub initial_capacity: Option<usize>,
    #[serde(rename = "timeToIdleS")]
    pub time_to_idle_s: Option<u64>,
}

// =============================================================================
// Storage
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStrategyKind {
    #[default]
    Default,
    OneOf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageKind {
    #[serde(rename = "S3")]
    S3,
    #[default]
    #[serde(rename = "local")]
    Local,
}

/// One physical storage backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageBackendConfig {
    #[serde(rename = "type", default)]
    pub kind: StorageKind,
    #[serde(rename = "S3", default)]
    pub s3: Option<S3Options>,
    #[serde(default)]
    pub local: Option<LocalOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Encryption secret; encryption is on when both secret and iv are set.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub iv: Option<String>,
    #[serde(default)]
    pub strategy: StorageStrategyKind,
    #[serde(flatten)]
    pub backend: StorageBackendConfig,
    /// Backends of the `oneof` strategy, in read priority order.
    #[serde(default)]
    pub oneof: Vec<StorageBackendConfig>,
    #[serde(rename = "readRetry", default)]
    pub read_retry: ReadRetryConfig,
    #[serde(rename = "diagnosticsPollMs", default)]
    pub diagnostics_poll_ms: Option<u64>,
}

impl StorageConfig {
    pub fn diagnostics_poll(&self) -> Option<Duration> {
        poll_period(self.diagnostics_poll_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy == StorageStrategyKind::OneOf && self.oneof.is_empty() {
            return Err(ConfigError::Invalid {
                message: "storage strategy 'oneof' requires at least one backend in storage.oneof"
                    .to_string(),
            });
        }
        if self.secret.is_some() != self.iv.is_some() {
            return Err(ConfigError::Invalid {
                message: "storage.secret and storage.iv must be set together".to_string(),
            });
        }
        Ok(())
    }
}

/// S3-compatible object store options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Options {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub end_point: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(rename = "useSSL", default = "default_true")]
    pub use_ssl: bool,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Turn removals into no-ops (retention handled by bucket policies).
    #[serde(default)]
    pub disable_remove: bool,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalOptions {
    pub path: String,
}

/// Existence probing before chunk reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_retry_delay_ms() -> u64 {
    100
}

impl Default for ReadRetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay_ms: default_retry_delay_ms(),
        }
    }
}
