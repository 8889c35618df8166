//! SQL implementation of the [`Connector`] contract.
//!
//! [`SqlConnector`] holds the backend-independent logic (statement building,
//! upsert routing, compare-and-set, diagnostics). A [`SqlBackend`] only knows
//! how to open a pool, bind [`SqlValue`]s and decode rows for one driver.

mod postgres;
mod sqlite;


use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{error, info, warn};

use crate::config::{DatabaseConfig, DatabaseKind};
use crate::db::query_builder::{
    Dialect, QueryBuilder, ResultColumn, SqlValue, Statement, quote_identifier, rows_to_records,
};
use crate::db::schema::{self, fetch_names};
use crate::db::{
    AtomicCompareAndSetResult, ColumnType, Connector, DbError, DbResult, EntityDefinition,
    FindFilter, FindOptions, ListResult, Record, UpsertAction,
};
use crate::diagnostics::{
    DiagnosticDepth, DiagnosticProvider, DiagnosticReport, failure_detail, new_log_id,
};

pub use postgres::PostgresBackend;
pub use sqlite::SqliteBackend;

/// Driver-level operations a SQL database must provide.
#[async_trait]
pub trait SqlBackend: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn dialect(&self) -> Dialect;

    async fn connect(&self) -> DbResult<()>;

    async fn disconnect(&self) -> DbResult<()>;

    fn is_connected(&self) -> bool;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&self, statement: &Statement) -> DbResult<u64>;

    /// Run a query and decode each row according to `statement.columns`.
    async fn fetch(&self, statement: &Statement) -> DbResult<Vec<Vec<SqlValue>>>;
}

/// Log a failed statement and turn the driver error into a [`DbError`].
///
/// Unique violations become [`DbError::Constraint`]; everything else is a
/// [`DbError::Database`] carrying the log id of the error line.
pub(crate) fn statement_error(kind: &str, statement: &Statement, e: sqlx::Error) -> DbError {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            warn!(backend = kind, sql = %statement.sql, error = %db, "unique constraint violated");
            return DbError::Constraint {
                message: db.message().to_string(),
            };
        }
    }
    let log_id = new_log_id();
    error!(
        backend = kind,
        log_id = %log_id,
        sql = %statement.sql,
        values = ?statement.values,
        error = %e,
        "statement failed"
    );
    DbError::Database {
        message: e.to_string(),
        log_id,
    }
}

/// A [`Connector`] over any [`SqlBackend`].
pub struct SqlConnector<B: SqlBackend> {
    backend: B,
    builder: QueryBuilder,
    tables: Mutex<BTreeSet<String>>,
    poll_period: Option<Duration>,
}

pub type PostgresConnector = SqlConnector<PostgresBackend>;
pub type SqliteConnector = SqlConnector<SqliteBackend>;

fn split<B: SqlBackend>(
    connector: Arc<SqlConnector<B>>,
) -> (Arc<dyn Connector>, Arc<dyn DiagnosticProvider>) {
    let diagnostics: Arc<dyn DiagnosticProvider> = connector.clone();
    let connector: Arc<dyn Connector> = connector;
    (connector, diagnostics)
}

/// Build the configured connector, as a connector and as a diagnostics provider.
pub fn connector_from_config(
    config: &DatabaseConfig,
) -> (Arc<dyn Connector>, Arc<dyn DiagnosticProvider>) {
    match config.kind {
        DatabaseKind::Postgres => split(Arc::new(
            PostgresConnector::new(config.postgres.clone())
                .with_poll_period(config.diagnostics_poll()),
        )),
        DatabaseKind::Sqlite => split(Arc::new(
            SqliteConnector::new(config.sqlite.clone()).with_poll_period(config.diagnostics_poll()),
        )),
    }
}

impl<B: SqlBackend> SqlConnector<B> {
    pub fn with_backend(backend: B) -> Self {
        let builder = QueryBuilder::new(backend.dialect());
        Self {
            backend,
            builder,
            tables: Mutex::new(BTreeSet::new()),
            poll_period: None,
        }
    }

    /// Have a diagnostics registry sample this connector every `period`.
    pub fn with_poll_period(mut self, period: Option<Duration>) -> Self {
        self.poll_period = period;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Tables reconciled through this connector.
    pub fn tables(&self) -> Vec<String> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn drop_table(&self, table: &str) -> DbResult<()> {
        let cascade = match self.backend.dialect() {
            Dialect::Postgres => " CASCADE",
            Dialect::Sqlite => "",
        };
        self.backend
            .execute(&Statement::raw(format!(
                "DROP TABLE IF EXISTS {}{}",
                quote_identifier(table),
                cascade
            )))
            .await?;
        Ok(())
    }

    async fn alive(&self) -> Result<(), String> {
        if !self.backend.is_connected() {
            return Err("not connected".to_string());
        }
        self.backend
            .execute(&Statement::raw("SELECT 1"))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    async fn table_rows(&self, table: &str) -> DbResult<Value> {
        let statement = Statement::raw(format!("SELECT COUNT(*) FROM {}", quote_identifier(table)))
            .returning(vec![ResultColumn::new("count", ColumnType::BigInt)]);
        let rows = self.backend.fetch(&statement).await?;
        Ok(match rows.into_iter().next().and_then(|r| r.into_iter().next()) {
            Some(SqlValue::BigInt(count)) => json!(count),
            _ => json!(0),
        })
    }

    /// Run one statistic, degrading to `{error, logId}` on failure.
    fn degrade(&self, stat: &str, result: DbResult<Value>) -> Value {
        match result {
            Ok(value) => value,
            Err(e) => {
                let log_id = match &e {
                    DbError::Database { log_id, .. } => log_id.clone(),
                    _ => new_log_id(),
                };
                warn!(backend = self.backend.kind(), stat, log_id = %log_id, error = %e, "diagnostic statistic failed");
                failure_detail(&log_id)
            }
        }
    }
}

#[async_trait]
impl<B: SqlBackend> Connector for SqlConnector<B> {
    fn kind(&self) -> &'static str {
        self.backend.kind()
    }

    async fn connect(&self) -> DbResult<()> {
        match self.backend.connect().await {
            Ok(()) => {
                info!(backend = self.backend.kind(), "database connected");
                Ok(())
            }
            Err(e) => {
                error!(backend = self.backend.kind(), error = %e, "cannot connect to database");
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> DbResult<()> {
        self.backend.disconnect().await?;
        info!(backend = self.backend.kind(), "database disconnected");
        Ok(())
    }

    async fn init(&self) -> DbResult<()> {
        if !self.backend.is_connected() {
            self.connect().await?;
        }
        Ok(())
    }

    async fn create_table(&self, definition: &EntityDefinition) -> DbResult<bool> {
        let created = schema::reconcile(&self.backend, definition).await?;
        if created {
            self.tables
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(definition.table.clone());
        }
        Ok(created)
    }

    async fn find(
        &self,
        definition: &EntityDefinition,
        filters: &FindFilter,
        options: &FindOptions,
    ) -> DbResult<ListResult<Record>> {
        let statement = self.builder.build_select(definition, filters, options)?;
        let rows = self.backend.fetch(&statement).await?;
        let items = rows_to_records(&statement.columns, rows);
        let next_page = options
            .pagination
            .clone()
            .unwrap_or_default()
            .next_page(items.len());
        Ok(ListResult::new(items, next_page))
    }

    async fn remove(
        &self,
        definition: &EntityDefinition,
        entities: &[Record],
    ) -> DbResult<Vec<bool>> {
        let mut removed = Vec::with_capacity(entities.len());
        for entity in entities {
            let statement = self.builder.build_delete(definition, entity)?;
            removed.push(self.backend.execute(&statement).await? > 0);
        }
        Ok(removed)
    }

    async fn upsert(
        &self,
        definition: &EntityDefinition,
        entities: &[Record],
        action: UpsertAction,
    ) -> DbResult<Vec<bool>> {
        let mut written = Vec::with_capacity(entities.len());
        for entity in entities {
            let affected = match action {
                UpsertAction::Insert => {
                    let statement = self.builder.build_insert(definition, entity)?;
                    self.backend.execute(&statement).await?
                }
                UpsertAction::Update => {
                    let statement = self.builder.build_update(definition, entity)?;
                    match self.backend.execute(&statement).await? {
                        // the row does not exist yet: write it
                        0 => {
                            let statement = self.builder.build_insert(definition, entity)?;
                            self.backend.execute(&statement).await?
                        }
                        n => n,
                    }
                }
            };
            written.push(affected > 0);
        }
        Ok(written)
    }

    async fn atomic_compare_and_set(
        &self,
        definition: &EntityDefinition,
        entity: &Record,
        field: &str,
        previous: &Value,
        next: &Value,
    ) -> DbResult<AtomicCompareAndSetResult> {
        let statements = self
            .builder
            .build_atomic_compare_and_set(definition, entity, field, previous, next)?;

        match self.backend.execute(&statements.update).await? {
            1 => Ok(AtomicCompareAndSetResult {
                did_set: true,
                current_value: next.clone(),
            }),
            0 => {
                let rows = self.backend.fetch(&statements.select).await?;
                let current = rows_to_records(&statements.select.columns, rows)
                    .into_iter()
                    .next()
                    .and_then(|mut record| record.remove(field))
                    .unwrap_or(Value::Null);
                Ok(AtomicCompareAndSetResult {
                    did_set: false,
                    current_value: current,
                })
            }
            affected => {
                error!(
                    table = %definition.table,
                    field,
                    affected,
                    "compare-and-set affected more than one row"
                );
                Err(DbError::Invariant {
                    table: definition.table.clone(),
                    message: format!("compare-and-set on '{}' affected {} rows", field, affected),
                })
            }
        }
    }

    async fn drop_database(&self) -> DbResult<()> {
        let tables = fetch_names(&self.backend, &schema::tables_statement(self.backend.dialect()))
            .await?;
        for table in &tables {
            self.drop_table(table).await?;
        }
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).clear();
        warn!(backend = self.backend.kind(), count = tables.len(), "database dropped");
        Ok(())
    }

    async fn drop_tables(&self) -> DbResult<()> {
        for table in self.tables() {
            self.drop_table(&table).await?;
        }
        self.tables.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        let mut report = match self.alive().await {
            Ok(()) => DiagnosticReport::ok(),
            Err(message) => {
                let log_id = new_log_id();
                error!(backend = self.backend.kind(), log_id = %log_id, error = %message, "database liveness probe failed");
                return DiagnosticReport::failed().with("logId", json!(log_id));
            }
        };
        report.insert("backend", json!(self.backend.kind()));

        let tables = self.tables();
        match depth {
            DiagnosticDepth::Alive => {}
            DiagnosticDepth::StatsTrack => {
                report.insert("tables", json!(tables.len()));
            }
            DiagnosticDepth::StatsBasic | DiagnosticDepth::StatsDeep => {
                let mut stats = serde_json::Map::new();
                for table in &tables {
                    let mut table_stats = serde_json::Map::new();
                    table_stats.insert(
                        "rows".to_string(),
                        self.degrade("rows", self.table_rows(table).await),
                    );
                    if depth == DiagnosticDepth::StatsDeep {
                        let indexes = fetch_names(
                            &self.backend,
                            &schema::indexes_statement(self.backend.dialect(), table),
                        )
                        .await
                        .map(|names| json!(names));
                        table_stats.insert("indexes".to_string(), self.degrade("indexes", indexes));
                    }
                    stats.insert(table.clone(), Value::Object(table_stats));
                }
                report.insert("tables", Value::Object(stats));
            }
        }
        report
    }
}

#[async_trait]
impl<B: SqlBackend> DiagnosticProvider for SqlConnector<B> {
    fn key(&self) -> String {
        "database".to_string()
    }

    fn poll_period(&self) -> Option<Duration> {
        self.poll_period
    }

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport {
        Connector::get_diagnostics(self, depth).await
    }
}
