//! SQLite backend.
//!
//! Used for embedded deployments and tests. SQLite has no native JSON or
//! timestamp storage here: objects and arrays are stored as JSON text and
//! dates as `YYYY-MM-DD HH:MM:SS` text, both decoded back per column type.

use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::query::Query;
use sqlx::{Row, Sqlite, SqlitePool};

use super::{SqlBackend, SqlConnector, statement_error};
use crate::config::SqliteOptions;
use crate::db::query_builder::{Dialect, ResultColumn, SqlValue, Statement};
use crate::db::{ColumnType, DbError, DbResult};

const MEMORY: &str = ":memory:";

pub struct SqliteBackend {
    options: SqliteOptions,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteBackend {
    pub fn new(options: SqliteOptions) -> Self {
        Self {
            options,
            pool: RwLock::new(None),
        }
    }

    fn pool(&self) -> DbResult<SqlitePool> {
        self.pool
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(DbError::NotConnected)
    }
}

impl SqlConnector<SqliteBackend> {
    pub fn new(options: SqliteOptions) -> Self {
        Self::with_backend(SqliteBackend::new(options))
    }

    /// A private in-memory database, gone once disconnected.
    pub fn in_memory() -> Self {
        Self::new(SqliteOptions {
            path: MEMORY.to_string(),
        })
    }
}

fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null(column_type) => match column_type {
            ColumnType::Boolean => query.bind(Option::<bool>::None),
            t if t.is_numeric() => query.bind(Option::<i64>::None),
            _ => query.bind(Option::<String>::None),
        },
        SqlValue::Text(s) => query.bind(s.clone()),
        SqlValue::BigInt(i) => query.bind(*i),
        SqlValue::Int(i) => query.bind(*i),
        SqlValue::SmallInt(i) => query.bind(*i),
        SqlValue::Float(f) => query.bind(*f),
        SqlValue::Double(f) => query.bind(*f),
        SqlValue::Bool(b) => query.bind(*b),
        SqlValue::Timestamp(dt) => query.bind(*dt),
        SqlValue::Json(v) => query.bind(v.to_string()),
    }
}

fn decode_row(row: &SqliteRow, columns: &[ResultColumn]) -> Result<Vec<SqlValue>, sqlx::Error> {
    let mut values = Vec::with_capacity(columns.len());
    for (index, column) in columns.iter().enumerate() {
        let null = SqlValue::Null(column.column_type);
        let value = match column.column_type {
            ColumnType::String
            | ColumnType::EncodedJson
            | ColumnType::Object
            | ColumnType::Array => row
                .try_get::<Option<String>, _>(index)?
                .map_or(null, SqlValue::Text),
            ColumnType::Number | ColumnType::BigInt | ColumnType::Int | ColumnType::SmallInt => row
                .try_get::<Option<i64>, _>(index)?
                .map_or(null, SqlValue::BigInt),
            ColumnType::Decimal | ColumnType::Float | ColumnType::Double => row
                .try_get::<Option<f64>, _>(index)?
                .map_or(null, SqlValue::Double),
            ColumnType::Boolean => row
                .try_get::<Option<bool>, _>(index)?
                .map_or(null, SqlValue::Bool),
            ColumnType::Date => row
                .try_get::<Option<NaiveDateTime>, _>(index)?
                .map_or(null, SqlValue::Timestamp),
        };
        values.push(value);
    }
    Ok(values)
}

#[async_trait]
impl SqlBackend for SqliteBackend {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn connect(&self) -> DbResult<()> {
        let in_memory = self.options.path == MEMORY;
        let options = if in_memory {
            SqliteConnectOptions::from_str("sqlite::memory:")
        } else {
            SqliteConnectOptions::from_str(&format!("sqlite://{}", self.options.path))
                .map(|o| o.create_if_missing(true))
        }
        .map_err(|e| DbError::Connection {
            message: e.to_string(),
        })?;

        // every connection to :memory: is a distinct database
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new()
        };

        let pool = pool_options
            .connect_with(options)
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
        let result = query
            .execute(&pool)
            .await
            .map_err(|e| statement_error(self.kind(), statement, e))?;
        Ok(result.rows_affected())
    }

    async fn fetch(&self, statement: &Statement) -> DbResult<Vec<Vec<SqlValue>>> {
        let pool = self.pool()?;
        let mut query = sqlx::query(&statement.sql);
        for value in &statement.values {
            query = bind_value(query, value);
        }
        let rows = query
            .fetch_all(&pool)
            .await
            .map_err(|e| statement_error(self.kind(), statement, e))?;
        rows.iter()
            .map(|row| decode_row(row, &statement.columns))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| statement_error(self.kind(), statement, e))
    }
}
