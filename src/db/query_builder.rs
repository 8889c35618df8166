//! Statement rendering for the SQL connectors.
//!
//! Every statement is parameterized: values travel as [`SqlValue`]s next to
//! the SQL text and are bound by the backend driver. Values are converted
//! between their record representation (JSON) and their storage
//! representation according to the column's [`ColumnType`].

use chrono::{DateTime, NaiveDateTime};
use serde_json::{Number, Value};

use crate::db::utils::{datetime_to_millis, millis_to_datetime};
use crate::db::{
    ColumnDefinition, ColumnType, DbError, DbResult, EntityDefinition, FindFilter, FindOptions,
    Operator, Record, SortOrder,
};

/// SQL flavour of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// A typed bind parameter or a decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL carrying the column type, so strictly typed drivers can bind it.
    Null(ColumnType),
    Text(String),
    BigInt(i64),
    Int(i32),
    SmallInt(i16),
    Float(f32),
    Double(f64),
    Bool(bool),
    Timestamp(NaiveDateTime),
    Json(Value),
}

/// Column of a result set, decoded positionally.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    /// Logical name the decoded value is stored under.
    pub name: String,
    pub column_type: ColumnType,
}

impl ResultColumn {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// A rendered statement ready to be bound and executed.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub values: Vec<SqlValue>,
    /// Expected result columns; empty for statements returning no rows.
    pub columns: Vec<ResultColumn>,
}

impl Statement {
    /// A statement without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            values: vec![],
            columns: vec![],
        }
    }

    pub fn returning(mut self, columns: Vec<ResultColumn>) -> Self {
        self.columns = columns;
        self
    }

    pub fn bind(mut self, value: SqlValue) -> Self {
        self.values.push(value);
        self
    }
}

/// The two statements of an atomic compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub struct CompareAndSetStatements {
    /// Conditional update, expected to affect 0 or 1 row.
    pub update: Statement,
    /// Read-back of the current value, used when the update matched nothing.
    pub select: Statement,
}

/// Make `%`, `_` and `\` match literally in a LIKE pattern escaped by `\`.
pub fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Collects bind values and hands out placeholders in the dialect's syntax.
struct Params {
    dialect: Dialect,
    values: Vec<SqlValue>,
}

impl Params {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            values: vec![],
        }
    }

    fn push(&mut self, value: SqlValue) -> String {
        self.values.push(value);
        match self.dialect {
            Dialect::Postgres => format!("${}", self.values.len()),
            Dialect::Sqlite => "?".to_string(),
        }
    }
}

/// Renders statements for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    dialect: Dialect,
}

impl QueryBuilder {
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Select expression for a column, aliased to its storage name.
    fn select_expression(&self, column: &ColumnDefinition) -> String {
        let name = quote_identifier(column.storage_name());
        match (self.dialect, column.column_type) {
            // numeric would need a decimal crate to decode
            (Dialect::Postgres, ColumnType::Decimal) => {
                format!("{}::double precision AS {}", name, name)
            }
            _ => name,
        }
    }

    fn result_columns(definition: &EntityDefinition) -> Vec<ResultColumn> {
        definition
            .columns
            .iter()
            .map(|c| ResultColumn::new(c.name.clone(), c.column_type))
            .collect()
    }

    /// `"pk1" = $1 AND "pk2" = $2` for the record's primary key.
    fn primary_key_predicate(
        &self,
        definition: &EntityDefinition,
        record: &Record,
        params: &mut Params,
    ) -> DbResult<String> {
        let mut predicates = vec![];
        for column in definition.primary_key_columns()? {
            let value = record.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                return Err(DbError::invalid_data(format!(
                    "{}: primary key field '{}' is missing",
                    definition.table, column.name
                )));
            }
            let placeholder = params.push(to_sql_value(column, value)?);
            predicates.push(format!(
                "{} = {}",
                quote_identifier(column.storage_name()),
                placeholder
            ));
        }
        Ok(predicates.join(" AND "))
    }

    pub fn build_select(
        &self,
        definition: &EntityDefinition,
        filters: &FindFilter,
        options: &FindOptions,
    ) -> DbResult<Statement> {
        let mut params = Params::new(self.dialect);
        let mut predicates = vec![];

        for (field, value) in filters {
            let column = definition.require_column(field)?;
            let name = quote_identifier(column.storage_name());
            if value.is_null() {
                predicates.push(format!("{} IS NULL", name));
            } else {
                let placeholder = params.push(to_sql_value(column, value)?);
                predicates.push(format!("{} = {}", name, placeholder));
            }
        }

        for condition in &options.conditions {
            let column = definition.require_column(&condition.field)?;
            let name = quote_identifier(column.storage_name());
            let predicate = match (condition.operator, &condition.value) {
                (Operator::Ne, Value::Null) => format!("{} IS NOT NULL", name),
                (Operator::Ne, value) => {
                    let placeholder = params.push(to_sql_value(column, value)?);
                    format!("{} <> {}", name, placeholder)
                }
                (Operator::In, Value::Array(values)) if values.is_empty() => "1 = 0".to_string(),
                (Operator::In, Value::Array(values)) => {
                    let placeholders = values
                        .iter()
                        .map(|v| Ok(params.push(to_sql_value(column, v)?)))
                        .collect::<DbResult<Vec<String>>>()?;
                    format!("{} IN ({})", name, placeholders.join(", "))
                }
                (Operator::In, _) => {
                    return Err(DbError::invalid_data(format!(
                        "$in on '{}' expects an array",
                        condition.field
                    )));
                }
                (Operator::Like, value) => {
                    let pattern = match value {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let placeholder =
                        params.push(SqlValue::Text(format!("%{}%", escape_like(&pattern))));
                    format!("{} LIKE {} ESCAPE '\\'", name, placeholder)
                }
                (operator, value) => {
                    let symbol = match operator {
                        Operator::Lt => "<",
                        Operator::Lte => "<=",
                        Operator::Gt => ">",
                        _ => ">=",
                    };
                    let placeholder = params.push(to_sql_value(column, value)?);
                    format!("{} {} {}", name, symbol, placeholder)
                }
            };
            predicates.push(predicate);
        }

        let select_list = definition
            .columns
            .iter()
            .map(|c| self.select_expression(c))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "SELECT {} FROM {}",
            select_list,
            quote_identifier(&definition.table)
        );
        if !predicates.is_empty() {
            sql.push_str(&format!(" WHERE {}", predicates.join(" AND ")));
        }
        sql.push_str(&format!(" {}", self.build_order_clause(definition, options)?));

        let pagination = options.pagination.clone().unwrap_or_default();
        sql.push_str(&format!(
            " LIMIT {} OFFSET {}",
            pagination.limit(),
            pagination.offset()?
        ));

        Ok(Statement {
            sql,
            values: params.values,
            columns: Self::result_columns(definition),
        })
    }

    /// ORDER BY the requested fields, or the primary key for stable pages.
    fn build_order_clause(
        &self,
        definition: &EntityDefinition,
        options: &FindOptions,
    ) -> DbResult<String> {
        let terms = if options.sort.is_empty() {
            definition
                .primary_key_columns()?
                .iter()
                .map(|c| format!("{} ASC", quote_identifier(c.storage_name())))
                .collect::<Vec<_>>()
        } else {
            options
                .sort
                .iter()
                .map(|(field, order)| {
                    let column = definition.require_column(field)?;
                    let order = match order {
                        SortOrder::Asc => "ASC",
                        SortOrder::Desc => "DESC",
                    };
                    Ok(format!("{} {}", quote_identifier(column.storage_name()), order))
                })
                .collect::<DbResult<Vec<_>>>()?
        };
        Ok(format!("ORDER BY {}", terms.join(", ")))
    }

    pub fn build_insert(&self, definition: &EntityDefinition, record: &Record) -> DbResult<Statement> {
        let mut params = Params::new(self.dialect);
        let mut names = vec![];
        let mut placeholders = vec![];
        for column in &definition.columns {
            let value = record.get(&column.name).unwrap_or(&Value::Null);
            names.push(quote_identifier(column.storage_name()));
            placeholders.push(params.push(to_sql_value(column, value)?));
        }
        Ok(Statement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_identifier(&definition.table),
                names.join(", "),
                placeholders.join(", ")
            ),
            values: params.values,
            columns: vec![],
        })
    }

    pub fn build_update(&self, definition: &EntityDefinition, record: &Record) -> DbResult<Statement> {
        let mut params = Params::new(self.dialect);
        let mut assignments = vec![];
        for column in &definition.columns {
            if definition.primary_key.contains(&column.name) {
                continue;
            }
            let value = record.get(&column.name).unwrap_or(&Value::Null);
            let placeholder = params.push(to_sql_value(column, value)?);
            assignments.push(format!(
                "{} = {}",
                quote_identifier(column.storage_name()),
                placeholder
            ));
        }
        if assignments.is_empty() {
            // key-only entity: a no-op assignment still reports the matched row
            let first = definition
                .primary_key
                .first()
                .ok_or_else(|| DbError::configuration("update on entity without primary key"))?;
            let first = definition.require_column(first)?;
            let name = quote_identifier(first.storage_name());
            assignments.push(format!("{} = {}", name, name));
        }
        let predicate = self.primary_key_predicate(definition, record, &mut params)?;
        Ok(Statement {
            sql: format!(
                "UPDATE {} SET {} WHERE {}",
                quote_identifier(&definition.table),
                assignments.join(", "),
                predicate
            ),
            values: params.values,
            columns: vec![],
        })
    }

    pub fn build_delete(&self, definition: &EntityDefinition, record: &Record) -> DbResult<Statement> {
        let mut params = Params::new(self.dialect);
        let predicate = self.primary_key_predicate(definition, record, &mut params)?;
        Ok(Statement {
            sql: format!(
                "DELETE FROM {} WHERE {}",
                quote_identifier(&definition.table),
                predicate
            ),
            values: params.values,
            columns: vec![],
        })
    }

    pub fn build_atomic_compare_and_set(
        &self,
        definition: &EntityDefinition,
        record: &Record,
        field: &str,
        previous: &Value,
        next: &Value,
    ) -> DbResult<CompareAndSetStatements> {
        let column = definition.require_column(field)?;
        if definition.primary_key.iter().any(|k| k == field) {
            return Err(DbError::configuration(format!(
                "{}: compare-and-set on primary key field '{}'",
                definition.table, field
            )));
        }
        let name = quote_identifier(column.storage_name());
        let table = quote_identifier(&definition.table);

        let mut params = Params::new(self.dialect);
        let set = params.push(to_sql_value(column, next)?);
        let key = self.primary_key_predicate(definition, record, &mut params)?;
        let guard = if previous.is_null() {
            format!("{} IS NULL", name)
        } else {
            format!("{} = {}", name, params.push(to_sql_value(column, previous)?))
        };
        let update = Statement {
            sql: format!(
                "UPDATE {} SET {} = {} WHERE {} AND {}",
                table, name, set, key, guard
            ),
            values: params.values,
            columns: vec![],
        };

        let mut params = Params::new(self.dialect);
        let key = self.primary_key_predicate(definition, record, &mut params)?;
        let select = Statement {
            sql: format!(
                "SELECT {} FROM {} WHERE {}",
                self.select_expression(column),
                table,
                key
            ),
            values: params.values,
            columns: vec![ResultColumn::new(column.name.clone(), column.column_type)],
        };

        Ok(CompareAndSetStatements { update, select })
    }
}

fn conversion_error(column: &ColumnDefinition, value: &Value) -> DbError {
    DbError::invalid_data(format!(
        "cannot store {} in column '{}' of type {:?}",
        value, column.name, column.column_type
    ))
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Number(_) => as_i64(value).and_then(millis_to_datetime),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.naive_utc())
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").ok()),
        _ => None,
    }
}

/// Record value -> bind parameter.
pub fn to_sql_value(column: &ColumnDefinition, value: &Value) -> DbResult<SqlValue> {
    if value.is_null() {
        return Ok(SqlValue::Null(column.column_type));
    }
    let err = || conversion_error(column, value);
    let converted = match column.column_type {
        ColumnType::String => match value {
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        },
        ColumnType::Number | ColumnType::BigInt => SqlValue::BigInt(as_i64(value).ok_or_else(err)?),
        ColumnType::Int => SqlValue::Int(
            as_i64(value)
                .and_then(|i| i32::try_from(i).ok())
                .ok_or_else(err)?,
        ),
        ColumnType::SmallInt => SqlValue::SmallInt(
            as_i64(value)
                .and_then(|i| i16::try_from(i).ok())
                .ok_or_else(err)?,
        ),
        ColumnType::Float => SqlValue::Float(as_f64(value).ok_or_else(err)? as f32),
        ColumnType::Double | ColumnType::Decimal => SqlValue::Double(as_f64(value).ok_or_else(err)?),
        ColumnType::Boolean => SqlValue::Bool(match value {
            Value::Bool(b) => *b,
            Value::Number(_) => as_i64(value).ok_or_else(err)? != 0,
            Value::String(s) if s == "true" => true,
            Value::String(s) if s == "false" => false,
            _ => return Err(err()),
        }),
        ColumnType::Date => SqlValue::Timestamp(parse_datetime(value).ok_or_else(err)?),
        ColumnType::Object | ColumnType::Array => SqlValue::Json(value.clone()),
        ColumnType::EncodedJson => SqlValue::Text(value.to_string()),
    };
    Ok(converted)
}

/// Decoded column value -> record value.
pub fn from_sql_value(column_type: ColumnType, value: SqlValue) -> Value {
    match value {
        SqlValue::Null(_) => Value::Null,
        SqlValue::Text(s) => match column_type {
            ColumnType::EncodedJson | ColumnType::Object | ColumnType::Array => {
                serde_json::from_str(&s).unwrap_or(Value::String(s))
            }
            _ => Value::String(s),
        },
        SqlValue::BigInt(i) => Value::Number(Number::from(i)),
        SqlValue::Int(i) => Value::Number(Number::from(i)),
        SqlValue::SmallInt(i) => Value::Number(Number::from(i)),
        SqlValue::Float(f) => Number::from_f64(f64::from(f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Double(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        SqlValue::Bool(b) => Value::Bool(b),
        SqlValue::Timestamp(dt) => Value::Number(Number::from(datetime_to_millis(&dt))),
        SqlValue::Json(v) => v,
    }
}

/// Assemble decoded rows into records.
pub fn rows_to_records(columns: &[ResultColumn], rows: Vec<Vec<SqlValue>>) -> Vec<Record> {
    rows.into_iter()
        .map(|row| {
            columns
                .iter()
                .zip(row)
                .map(|(column, value)| {
                    (column.name.clone(), from_sql_value(column.column_type, value))
                })
                .collect()
        })
        .collect()
}
