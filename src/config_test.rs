//! Tests for configuration loading.

use std::io::Write;

use crate::config::{
    Config, ConfigError, DatabaseKind, StorageKind, StorageStrategyKind,
};

const FULL: &str = r#"
database:
  type: postgres
  postgres:
    database: drive
    user: drive
    password: secret
    host: db.internal
    port: 5433
    ssl: true
    idleTimeoutMillis: 30000
    connectionTimeoutMillis: 2000
    statement_timeout: 5000
    query_timeout: 6000
  localMemCache:
    ttlS: 30
    maxKeyCount: 500
    printPeriodMs: 1000
    printPeriodIdleMs: 10000
    extraNodeCacheConfig:
      initialCapacity: 64
  diagnosticsPollMs: 60000
storage:
  secret: 0123456789abcdef0123456789abcdef
  iv: abcdef0123456789
  strategy: oneof
  oneof:
    - type: local
      local:
        path: /var/drive/a
    - type: S3
      S3:
        bucket: drive
        endPoint: minio.internal
        port: 9000
        useSSL: false
        accessKey: admin
        secretKey: password
  readRetry:
    attempts: 3
    delayMs: 5
  diagnosticsPollMs: 0
"#;

#[test]
fn parses_full_configuration() {
    let config = Config::from_yaml(FULL).expect("valid configuration");

    assert_eq!(config.database.kind, DatabaseKind::Postgres);
    let pg = &config.database.postgres;
    assert_eq!(pg.host, "db.internal");
    assert_eq!(pg.port, 5433);
    assert!(pg.ssl);
    assert_eq!(pg.idle_timeout_millis, Some(30_000));
    assert_eq!(pg.connection_timeout_millis, Some(2_000));
    assert_eq!(pg.statement_timeout, Some(5_000));
    assert_eq!(pg.query_timeout().unwrap().as_millis(), 6_000);

    let cache = config.database.local_mem_cache.as_ref().unwrap();
    assert_eq!(cache.ttl_s, 30);
    assert_eq!(cache.max_key_count, 500);
    assert_eq!(cache.print_period_ms, 1_000);
    assert_eq!(cache.print_period_idle_ms, 10_000);
    assert_eq!(cache.extra_node_cache_config.initial_capacity, Some(64));

    let storage = &config.storage;
    assert_eq!(storage.strategy, StorageStrategyKind::OneOf);
    assert_eq!(storage.oneof.len(), 2);
    assert_eq!(storage.oneof[0].kind, StorageKind::Local);
    let s3 = storage.oneof[1].s3.as_ref().unwrap();
    assert_eq!(s3.end_point.as_deref(), Some("minio.internal"));
    assert!(!s3.use_ssl);
    assert_eq!(storage.read_retry.attempts, 3);

    assert_eq!(config.database.diagnostics_poll().unwrap().as_millis(), 60_000);
    assert_eq!(storage.diagnostics_poll_ms, Some(0));
    assert!(storage.diagnostics_poll().is_none());
}

#[test]
fn applies_defaults_for_missing_sections() {
    let config = Config::from_yaml("storage:\n  type: local\n  local:\n    path: /tmp/x\n").unwrap();
    assert_eq!(config.database.kind, DatabaseKind::Postgres);
    assert_eq!(config.database.postgres.port, 5432);
    assert!(config.database.local_mem_cache.is_none());
    assert_eq!(config.storage.strategy, StorageStrategyKind::Default);
    assert_eq!(config.storage.backend.kind, StorageKind::Local);
    assert_eq!(config.storage.backend.local.as_ref().unwrap().path, "/tmp/x");
    assert_eq!(config.storage.read_retry.attempts, 10);
    assert_eq!(config.storage.read_retry.delay_ms, 100);
    assert!(config.database.diagnostics_poll().is_none());
    assert!(config.storage.diagnostics_poll().is_none());
}

#[test]
fn rejects_oneof_without_backends() {
    let err = Config::from_yaml("storage:\n  strategy: oneof\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
}

#[test]
fn rejects_secret_without_iv() {
    let err = Config::from_yaml("storage:\n  secret: abc\n").unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"database:\n  type: sqlite\n  sqlite:\n    path: ':memory:'\n")
        .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.database.kind, DatabaseKind::Sqlite);
    assert_eq!(config.database.sqlite.path, ":memory:");
}

#[test]
fn missing_file_is_an_io_error() {
    let err = Config::load("/definitely/not/here.yaml").unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}
