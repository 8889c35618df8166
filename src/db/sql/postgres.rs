//! PostgreSQL backend.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, error};

use super::{SqlBackend, SqlConnector, statement_error};
use crate::config::PostgresOptions;
use crate::db::query_builder::{Dialect, ResultColumn, SqlValue, Statement};
use crate::db::{ColumnType, DbError, DbResult};

pub struct PostgresBackend {
    options: PostgresOptions,
    pool: RwLock<Option<PgPool>>,
}

impl PostgresBackend {
    pub fn new(options: PostgresOptions) -> Self {
        Self {
            options,
            pool: RwLock::new(None),
        }
    }

    fn pool(&self) -> DbResult<PgPool> {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DbError::NotConnected)
    }

    fn connect_options(&self) -> PgConnectOptions {
        let o = &self.options;
        let mut options = PgConnectOptions::new()
            .host(&o.host)
            .port(o.port)
            .username(&o.user)
            .password(&o.password)
            .database(&o.database)
            .ssl_mode(if o.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            });
        if let Some(timeout) = o.statement_timeout {
            options = options.options([("statement_timeout", timeout)]);
        }
        options
    }

    /// Run a driver future under the configured query timeout.
    async fn timed<T: Send>(
        &self,
        statement: &Statement,
        future: impl Future<Output = Result<T, sqlx::Error>> + Send,
    ) -> DbResult<T> {
        let result = match self.options.query_timeout() {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => {
                    let millis = limit.as_millis() as u64;
                    error!(sql = %statement.sql, millis, "query timed out");
                    return Err(DbError::Timeout { millis });
                }
            },
            None => future.await,
        };
        result.map_err(|e| statement_error(self.kind(), statement, e))
    }
}

impl SqlConnector<PostgresBackend> {
    pub fn new(options: PostgresOptions) -> Self {
        Self::with_backend(PostgresBackend::new(options))
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Null(column_type) => match column_type {
            ColumnType::String | ColumnType::EncodedJson => query.bind(Option::<String>::None),
            ColumnType::Number | ColumnType::BigInt => query.bind(Option::<i64>::None),
            ColumnType::Int => query.bind(Option::<i32>::None),
            ColumnType::SmallInt => query.bind(Option::<i16>::None),
            ColumnType::Float => query.bind(Option::<f32>::None),
            ColumnType::Decimal | ColumnType::Double => query.bind(Option::<f64>::None),
            ColumnType::Boolean => query.bind(Option::<bool>::None),
            ColumnType::Date => query.bind(Option::<NaiveDateTime>::None),
            ColumnType::Object | ColumnType::Array => query.bind(Option::<Value>::None),
        },
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::BigInt(i) => query.bind(*i),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::SmallInt(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Double(f) => query.bind(*f),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Timestamp(dt) => query.bind(*dt),
        SqlValue::Json(v) => query.bind(v.clone()),
    }
}

fn decode_row(row: &PgRow, columns: &[ResultColumn]) -> Result<Vec<SqlValue>, sqlx::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let null = SqlValue::Null(column.column_type);
        let value = match column.column_type {
            ColumnType::String | ColumnType::EncodedJson => row
                .try_get::<Option<String>, _>(index)?
                .map_or(null, SqlValue::Text),
            ColumnType::Number | ColumnType::BigInt => row
                .try_get::<Option<i64>, _>(index)?
                .map_or(null, SqlValue::BigInt),
            ColumnType::Int => row
                .try_get::<Option<i32>, _>(index)?
                .map_or(null, SqlValue::Int),
            ColumnType::SmallInt => row
                .try_get::<Option<i16>, _>(index)?
                .map_or(null, SqlValue::SmallInt),
            ColumnType::Float => row
                .try_get::<Option<f32>, _>(index)?
                .map_or(null, SqlValue::Float),
            ColumnType::Decimal | ColumnType::Double => row
                .try_get::<Option<f64>, _>(index)?
                .map_or(null, SqlValue::Double),
            ColumnType::Boolean => row
                .try_get::<Option<bool>, _>(index)?
                .map_or(null, SqlValue::Bool),
            ColumnType::Date => row
                .try_get::<Option<NaiveDateTime>, _>(index)?
                .map_or(null, SqlValue::Timestamp),
            ColumnType::Object | ColumnType::Array => row
                .try_get::<Option<Value>, _>(index)?
                .map_or(null, SqlValue::Json),
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn connect(&self) -> DbResult<()> {
        let mut pool_options = PgPoolOptions::new().max_connections(self.options.max_connections);
        if let Some(millis) = self.options.idle_timeout_millis {
            pool_options = pool_options.idle_timeout(Duration::from_millis(millis));
        }
        if let Some(millis) = self.options.connection_timeout_millis {
            pool_options = pool_options.acquire_timeout(Duration::from_millis(millis));
        }
        debug!(
            host = %self.options.host,
            port = self.options.port,
            database = %self.options.database,
            "opening postgres pool"
        );
        let pool = pool_options
            .connect_with(self.connect_options())
            .await
            .map_err(|e| DbError::Connection {
                message: e.to_string(),
            })?;
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> DbResult<()> {
        let pool = self.pool.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.close().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|pool| !pool.is_closed())
    }

    async fn execute(&self, statement: &Statement) -> DbResult<u64> {
        let pool = self.pool()?;
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.values {
            query = bind_value(query, value);
        }
        let result = self.timed(statement, query.execute(&pool)).await?;
        Ok(result.rows_affected())
    }

    async fn fetch(&self, statement: &Statement) -> DbResult<Vec<Vec<SqlValue>>> {
        let pool = self.pool()?;
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.values {
            query = bind_value(query, value);
        }
        let rows = self.timed(statement, query.fetch_all(&pool)).await?;
        rows.iter()
            .map(|row| decode_row(row, &statement.columns))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| statement_error(self.kind(), statement, e))
    }
}
