//! Entity metadata and query types shared by every layer of the persistence core.
//!
//! Entities declare an [`EntityDefinition`] once (usually behind a `LazyLock`)
//! and the connector, query builder and repositories work on [`Record`]s keyed
//! by logical column names.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::{DbError, DbResult};

/// A persisted row keyed by logical column names.
pub type Record = serde_json::Map<String, Value>;

/// Equality filters, `{field: value}`.
pub type FindFilter = Record;

// =============================================================================
// Column and Entity Definitions
// =============================================================================

/// Semantic column type, mapped to a native type per SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    String,
    Number,
    Int,
    BigInt,
    SmallInt,
    Decimal,
    Float,
    Double,
    Boolean,
    Date,
    Object,
    EncodedJson,
    Array,
}

impl ColumnType {
    /// True for every numeric semantic type.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ColumnType::Number
                | ColumnType::Int
                | ColumnType::BigInt
                | ColumnType::SmallInt
                | ColumnType::Decimal
                | ColumnType::Float
                | ColumnType::Double
        )
    }
}

/// Primary key generator strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generator {
    Uuid,
    TimeUuid,
}

/// Hook computing a fresh value from the current one on every persist.
pub type OnUpsert = fn(&Value) -> Value;

/// Per-column options.
#[derive(Debug, Clone, Default)]
pub struct ColumnOptions {
    pub generator: Option<Generator>,
    pub on_upsert: Option<OnUpsert>,
    /// Physical column name when it differs from the logical one.
    pub rename: Option<String>,
}

/// Metadata for one entity field.
#[derive(Debug, Clone)]
pub struct ColumnDefinition {
    pub name: String,
    pub column_type: ColumnType,
    pub options: ColumnOptions,
}

impl ColumnDefinition {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            options: ColumnOptions::default(),
        }
    }

    pub fn generator(mut self, generator: Generator) -> Self {
        self.options.generator = Some(generator);
        self
    }

    pub fn on_upsert(mut self, hook: OnUpsert) -> Self {
        self.options.on_upsert = Some(hook);
        self
    }

    pub fn rename(mut self, storage_name: impl Into<String>) -> Self {
        self.options.rename = Some(storage_name.into());
        self
    }

    /// Name of the physical column.
    pub fn storage_name(&self) -> &str {
        self.options.rename.as_deref().unwrap_or(&self.name)
    }
}

/// A non-unique secondary index over one or two fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalIndex {
    pub fields: Vec<String>,
    /// Index `lower(first_field)` instead of the raw value (two-field indexes only).
    pub lowercase_first: bool,
}

/// Static description of a persisted entity type.
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    pub name: String,
    pub table: String,
    pub primary_key: Vec<String>,
    pub global_indexes: Vec<GlobalIndex>,
    pub columns: Vec<ColumnDefinition>,
}

impl EntityDefinition {
    pub fn builder(table: impl Into<String>) -> EntityDefinitionBuilder {
        let table = table.into();
        EntityDefinitionBuilder {
            definition: EntityDefinition {
                name: table.clone(),
                table,
                primary_key: vec![],
                global_indexes: vec![],
                columns: vec![],
            },
        }
    }

    /// Look up a column by logical name.
    pub fn column(&self, name: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column by logical name, failing with a configuration error.
    pub fn require_column(&self, name: &str) -> DbResult<&ColumnDefinition> {
        self.column(name).ok_or_else(|| {
            DbError::configuration(format!(
                "entity '{}' has no column definition for '{}'",
                self.name, name
            ))
        })
    }

    /// Primary key column definitions, in key order.
    pub fn primary_key_columns(&self) -> DbResult<Vec<&ColumnDefinition>> {
        self.primary_key
            .iter()
            .map(|field| self.require_column(field))
            .collect()
    }

    /// Check the invariants every definition must hold before use.
    pub fn validate(&self) -> DbResult<()> {
        if self.table.is_empty() {
            return Err(DbError::configuration("entity definition without table name"));
        }
        if self.primary_key.is_empty() {
            return Err(DbError::configuration(format!(
                "entity '{}' declares no primary key",
                self.name
            )));
        }
        self.primary_key_columns()?;
        for index in &self.global_indexes {
            if index.fields.is_empty() || index.fields.len() > 2 {
                return Err(DbError::configuration(format!(
                    "entity '{}' declares an index over {} fields, only 1 or 2 are supported",
                    self.name,
                    index.fields.len()
                )));
            }
            for field in &index.fields {
                self.require_column(field)?;
            }
        }
        Ok(())
    }
}

/// Builder for [`EntityDefinition`].
#[derive(Debug)]
pub struct EntityDefinitionBuilder {
    definition: EntityDefinition,
}

impl EntityDefinitionBuilder {
    /// Entity type name used in logs and events (defaults to the table name).
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = name.into();
        self
    }

    pub fn primary_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition.primary_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn global_index<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.definition.global_indexes.push(GlobalIndex {
            fields: fields.into_iter().map(Into::into).collect(),
            lowercase_first: false,
        });
        self
    }

    /// Two-field index over `lower(first), second`.
    pub fn global_index_lowercase(
        mut self,
        first: impl Into<String>,
        second: impl Into<String>,
    ) -> Self {
        self.definition.global_indexes.push(GlobalIndex {
            fields: vec![first.into(), second.into()],
            lowercase_first: true,
        });
        self
    }

    pub fn column(mut self, column: ColumnDefinition) -> Self {
        self.definition.columns.push(column);
        self
    }

    pub fn build(self) -> EntityDefinition {
        self.definition
    }
}

/// A Rust type persisted through the repository layer.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn definition() -> &'static EntityDefinition;
}

// =============================================================================
// Query Types for Pagination and Sorting
// =============================================================================

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Comparison operators usable in [`FindOptions`] conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    Like,
}

/// A non-equality predicate on one field.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

/// Offset-style pagination cursor as exchanged on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Page index, as a decimal string.
    pub page_token: Option<String>,
    /// Page size, as a decimal string.
    #[serde(rename = "limitStr")]
    pub limit_str: Option<String>,
}

impl Pagination {
    pub const DEFAULT_LIMIT: u64 = 100;

    pub fn new(page: u64, limit: u64) -> Self {
        Self {
            page_token: Some(page.to_string()),
            limit_str: Some(limit.to_string()),
        }
    }

    /// Page index; unparsable or missing tokens start at page 0.
    pub fn page(&self) -> u64 {
        self.page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0)
    }

    pub fn limit(&self) -> u64 {
        self.limit_str
            .as_deref()
            .and_then(|l| l.parse().ok())
            .filter(|l| *l > 0)
            .map(|l: u64| l.min(i64::MAX as u64))
            .unwrap_or(Self::DEFAULT_LIMIT)
    }

    /// Rows to skip. SQL OFFSET is a signed 64-bit value, so cursors past
    /// `i64::MAX` rows are rejected.
    pub fn offset(&self) -> DbResult<u64> {
        self.page()
            .checked_mul(self.limit())
            .filter(|offset| *offset <= i64::MAX as u64)
            .ok_or_else(|| {
                DbError::invalid_data(format!(
                    "page token {} with limit {} is out of range",
                    self.page(),
                    self.limit()
                ))
            })
    }

    /// Continuation cursor: only when the page came back full.
    pub fn next_page(&self, returned: usize) -> Option<Pagination> {
        if returned as u64 != self.limit() {
            return None;
        }
        let next = Pagination::new(self.page().checked_add(1)?, self.limit());
        next.offset().ok().map(|_| next)
    }
}

/// Options for [`find`](crate::db::Repository::find): conditions, sort, page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub pagination: Option<Pagination>,
    pub sort: Vec<(String, SortOrder)>,
    pub conditions: Vec<Condition>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push((field.into(), order));
        self
    }

    pub fn condition(mut self, field: impl Into<String>, operator: Operator, value: Value) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            operator,
            value,
        });
        self
    }

    pub fn ne(self, field: impl Into<String>, value: Value) -> Self {
        self.condition(field, Operator::Ne, value)
    }

    pub fn lt(self, field: impl Into<String>, value: Value) -> Self {
        self.condition(field, Operator::Lt, value)
    }

    pub fn lte(self, field: impl Into<String>, value: Value) -> Self {
        self.condition(field, Operator::Lte, value)
    }

    pub fn gt(self, field: impl Into<String>, value: Value) -> Self {
        self.condition(field, Operator::Gt, value)
    }

    pub fn gte(self, field: impl Into<String>, value: Value) -> Self {
        self.condition(field, Operator::Gte, value)
    }

    pub fn in_values(self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.condition(field, Operator::In, Value::Array(values))
    }

    pub fn like(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.condition(field, Operator::Like, Value::String(pattern.into()))
    }

    /// True when no condition, sort or pagination was requested.
    pub fn is_default(&self) -> bool {
        self.pagination.is_none() && self.sort.is_empty() && self.conditions.is_empty()
    }
}

/// Result of a paginated list query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResult<T> {
    /// The items in this page.
    pub items: Vec<T>,
    /// Cursor for the following page, when this one came back full.
    #[serde(rename = "nextPage", skip_serializing_if = "Option::is_none")]
    pub next_page: Option<Pagination>,
}

impl<T> ListResult<T> {
    pub fn new(items: Vec<T>, next_page: Option<Pagination>) -> Self {
        Self { items, next_page }
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    /// Convert every item, keeping the cursor.
    pub fn try_map<U, F>(self, f: F) -> DbResult<ListResult<U>>
    where
        F: FnMut(T) -> DbResult<U>,
    {
        Ok(ListResult {
            items: self.items.into_iter().map(f).collect::<DbResult<Vec<U>>>()?,
            next_page: self.next_page,
        })
    }
}

// =============================================================================
// Write Types
// =============================================================================

/// Statement kind chosen by the entity manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpsertAction {
    Insert,
    Update,
}

impl std::fmt::Display for UpsertAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpsertAction::Insert => write!(f, "INSERT"),
            UpsertAction::Update => write!(f, "UPDATE"),
        }
    }
}

/// Outcome of an atomic compare-and-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicCompareAndSetResult {
    pub did_set: bool,
    pub current_value: Value,
}

/// Caller identity attached to reads, used for log correlation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub company_id: Option<String>,
    pub user_id: Option<String>,
    pub request_id: Option<String>,
}
