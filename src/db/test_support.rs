//! Entities and helpers shared by the database tests.

use std::sync::{Arc, LazyLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::utils::touch_timestamp;
use crate::db::{
    ColumnDefinition, ColumnType, Connector, Entity, EntityDefinition, Generator, SqliteConnector,
};

/// A file-like entity with a composite key and every interesting column kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestFile {
    #[serde(default)]
    pub company_id: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub parent_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub lock_owner: Option<String>,
    #[serde(default)]
    pub last_modified: i64,
}

static TEST_FILE: LazyLock<EntityDefinition> = LazyLock::new(|| {
    EntityDefinition::builder("test_files")
        .name("test_file")
        .primary_key(["company_id", "id"])
        .global_index(["company_id", "parent_id"])
        .global_index_lowercase("name", "company_id")
        .column(ColumnDefinition::new("company_id", ColumnType::String))
        .column(ColumnDefinition::new("id", ColumnType::String).generator(Generator::Uuid))
        .column(ColumnDefinition::new("parent_id", ColumnType::String))
        .column(ColumnDefinition::new("name", ColumnType::String))
        .column(ColumnDefinition::new("size", ColumnType::BigInt))
        .column(ColumnDefinition::new("is_directory", ColumnType::Boolean))
        .column(ColumnDefinition::new("tags", ColumnType::Array))
        .column(ColumnDefinition::new("metadata", ColumnType::Object))
        .column(ColumnDefinition::new("lock_owner", ColumnType::String))
        .column(
            ColumnDefinition::new("last_modified", ColumnType::Date)
                .rename("modified_at")
                .on_upsert(touch_timestamp),
        )
        .build()
});

impl Entity for TestFile {
    fn definition() -> &'static EntityDefinition {
        &TEST_FILE
    }
}

impl TestFile {
    pub fn new(company_id: &str, id: &str, name: &str) -> Self {
        Self {
            company_id: company_id.to_string(),
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }
}

/// An append-only entity keyed by a time-based uuid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestVersion {
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub checksum: Option<Value>,
}

static TEST_VERSION: LazyLock<EntityDefinition> = LazyLock::new(|| {
    EntityDefinition::builder("test_versions")
        .primary_key(["file_id", "id"])
        .column(ColumnDefinition::new("file_id", ColumnType::String))
        .column(ColumnDefinition::new("id", ColumnType::String).generator(Generator::TimeUuid))
        .column(ColumnDefinition::new("size", ColumnType::BigInt))
        .column(ColumnDefinition::new("checksum", ColumnType::EncodedJson))
        .build()
});

impl Entity for TestVersion {
    fn definition() -> &'static EntityDefinition {
        &TEST_VERSION
    }
}

/// Connected in-memory SQLite connector.
pub async fn sqlite_connector() -> Arc<SqliteConnector> {
    let connector = Arc::new(SqliteConnector::in_memory());
    connector
        .connect()
        .await
        .expect("in-memory sqlite should connect");
    connector
}
