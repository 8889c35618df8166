//! Schema reconciliation.
//!
//! Brings a backend's physical tables in line with entity definitions at boot:
//! create missing tables, add missing columns, add the primary key and the
//! global indexes. Never drops or retypes anything; destructive changes are
//! left to manual migrations.

use std::collections::HashSet;

use tracing::{error, info, warn};

use crate::db::query_builder::{Dialect, ResultColumn, SqlValue, Statement, quote_identifier};
use crate::db::sql::SqlBackend;
use crate::db::{ColumnType, DbResult, EntityDefinition, GlobalIndex};

/// Native column type for a semantic type.
pub fn native_type(dialect: Dialect, column_type: ColumnType) -> &'static str {
    match dialect {
        Dialect::Postgres => match column_type {
            ColumnType::String => "text",
            ColumnType::Number | ColumnType::BigInt => "bigint",
            ColumnType::Int => "integer",
            ColumnType::SmallInt => "smallint",
            ColumnType::Decimal => "numeric",
            ColumnType::Float => "real",
            ColumnType::Double => "double precision",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "timestamp",
            ColumnType::Object | ColumnType::Array => "jsonb",
            ColumnType::EncodedJson => "text",
        },
        Dialect::Sqlite => match column_type {
            ColumnType::String => "TEXT",
            ColumnType::Number | ColumnType::BigInt | ColumnType::Int | ColumnType::SmallInt => {
                "INTEGER"
            }
            ColumnType::Decimal => "NUMERIC",
            ColumnType::Float | ColumnType::Double => "REAL",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Date => "DATETIME",
            ColumnType::Object | ColumnType::Array | ColumnType::EncodedJson => "TEXT",
        },
    }
}

fn key_list(definition: &EntityDefinition) -> DbResult<String> {
    Ok(definition
        .primary_key_columns()?
        .iter()
        .map(|c| quote_identifier(c.storage_name()))
        .collect::<Vec<_>>()
        .join(", "))
}

pub fn create_table_statement(dialect: Dialect, definition: &EntityDefinition) -> DbResult<Statement> {
    let mut columns = definition
        .columns
        .iter()
        .map(|c| {
            format!(
                "{} {}",
                quote_identifier(c.storage_name()),
                native_type(dialect, c.column_type)
            )
        })
        .collect::<Vec<_>>();
    // SQLite cannot add a primary key to an existing table
    if dialect == Dialect::Sqlite {
        columns.push(format!("PRIMARY KEY ({})", key_list(definition)?));
    }
    Ok(Statement::raw(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_identifier(&definition.table),
        columns.join(", ")
    )))
}

pub fn add_column_statement(
    dialect: Dialect,
    definition: &EntityDefinition,
    column: &str,
) -> DbResult<Statement> {
    let column = definition.require_column(column)?;
    Ok(Statement::raw(format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote_identifier(&definition.table),
        quote_identifier(column.storage_name()),
        native_type(dialect, column.column_type)
    )))
}

pub fn add_primary_key_statement(definition: &EntityDefinition) -> DbResult<Statement> {
    Ok(Statement::raw(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY ({})",
        quote_identifier(&definition.table),
        quote_identifier(&format!("{}_pkey", definition.table)),
        key_list(definition)?
    )))
}

pub fn index_name(definition: &EntityDefinition, index: &GlobalIndex) -> String {
    let mut name = format!("index_{}", definition.table);
    for field in &index.fields {
        name.push('_');
        name.push_str(field);
    }
    if index.lowercase_first {
        name.push_str("_ci");
    }
    name
}

pub fn create_index_statement(
    definition: &EntityDefinition,
    index: &GlobalIndex,
) -> DbResult<Statement> {
    let mut expressions = vec![];
    for (position, field) in index.fields.iter().enumerate() {
        let column = quote_identifier(definition.require_column(field)?.storage_name());
        if position == 0 && index.lowercase_first && index.fields.len() == 2 {
            expressions.push(format!("lower({})", column));
        } else {
            expressions.push(column);
        }
    }
    Ok(Statement::raw(format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
        quote_identifier(&index_name(definition, index)),
        quote_identifier(&definition.table),
        expressions.join(", ")
    )))
}

fn names_statement(sql: &str, table: &str) -> Statement {
    Statement::raw(sql)
        .bind(SqlValue::Text(table.to_string()))
        .returning(vec![ResultColumn::new("name", ColumnType::String)])
}

/// Physical column names of `table`.
pub fn columns_statement(dialect: Dialect, table: &str) -> Statement {
    match dialect {
        Dialect::Postgres => names_statement(
            "SELECT column_name::text FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
            table,
        ),
        Dialect::Sqlite => names_statement("SELECT name FROM pragma_table_info(?)", table),
    }
}

/// Primary key constraint (Postgres) or key columns (SQLite) of `table`.
pub fn primary_key_statement(dialect: Dialect, table: &str) -> Statement {
    match dialect {
        Dialect::Postgres => names_statement(
            "SELECT constraint_name::text FROM information_schema.table_constraints \
             WHERE table_schema = current_schema() AND table_name = $1 \
             AND constraint_type = 'PRIMARY KEY'",
            table,
        ),
        Dialect::Sqlite => {
            names_statement("SELECT name FROM pragma_table_info(?) WHERE pk > 0", table)
        }
    }
}

/// Index names of `table`.
pub fn indexes_statement(dialect: Dialect, table: &str) -> Statement {
    match dialect {
        Dialect::Postgres => names_statement(
            "SELECT indexname::text FROM pg_indexes \
             WHERE schemaname = current_schema() AND tablename = $1",
            table,
        ),
        Dialect::Sqlite => names_statement(
            "SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?",
            table,
        ),
    }
}

/// Every user table of the connected database.
pub fn tables_statement(dialect: Dialect) -> Statement {
    let sql = match dialect {
        Dialect::Postgres => {
            "SELECT tablename::text FROM pg_tables WHERE schemaname = current_schema()"
        }
        Dialect::Sqlite => {
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'"
        }
    };
    Statement::raw(sql).returning(vec![ResultColumn::new("name", ColumnType::String)])
}

/// Run a single-text-column query.
pub async fn fetch_names<B: SqlBackend + ?Sized>(
    backend: &B,
    statement: &Statement,
) -> DbResult<Vec<String>> {
    let rows = backend.fetch(statement).await?;
    Ok(rows
        .into_iter()
        .filter_map(|row| match row.into_iter().next() {
            Some(SqlValue::Text(name)) => Some(name),
            _ => None,
        })
        .collect())
}

/// Reconcile one entity's table. Returns `false` when the table could not be
/// created; the remaining steps are then skipped.
pub async fn reconcile<B: SqlBackend + ?Sized>(
    backend: &B,
    definition: &EntityDefinition,
) -> DbResult<bool> {
    definition.validate()?;
    let dialect = backend.dialect();
    let table = definition.table.as_str();

    if let Err(e) = backend
        .execute(&create_table_statement(dialect, definition)?)
        .await
    {
        error!(table, error = %e, "cannot create table");
        return Ok(false);
    }

    let existing: HashSet<String> = fetch_names(backend, &columns_statement(dialect, table))
        .await?
        .into_iter()
        .collect();
    for column in &definition.columns {
        if !existing.contains(column.storage_name()) {
            backend
                .execute(&add_column_statement(dialect, definition, &column.name)?)
                .await?;
            info!(table, column = column.storage_name(), "column added");
        }
    }

    let primary_key = fetch_names(backend, &primary_key_statement(dialect, table)).await?;
    if primary_key.is_empty() {
        match dialect {
            Dialect::Postgres => {
                backend
                    .execute(&add_primary_key_statement(definition)?)
                    .await?;
                info!(table, "primary key added");
            }
            Dialect::Sqlite => {
                warn!(table, "existing table has no primary key and SQLite cannot add one")
            }
        }
    }

    for index in &definition.global_indexes {
        backend
            .execute(&create_index_statement(definition, index)?)
            .await?;
    }

    Ok(true)
}
