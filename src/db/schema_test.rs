//! Tests for schema statement rendering.

use crate::db::query_builder::Dialect;
use crate::db::schema::{
    add_column_statement, add_primary_key_statement, create_index_statement,
    create_table_statement, index_name, native_type,
};
use crate::db::test_support::{TestFile, TestVersion};
use crate::db::{ColumnType, Entity};

#[test]
fn native_types_per_dialect() {
    assert_eq!(native_type(Dialect::Postgres, ColumnType::String), "text");
    assert_eq!(native_type(Dialect::Postgres, ColumnType::Number), "bigint");
    assert_eq!(native_type(Dialect::Postgres, ColumnType::Date), "timestamp");
    assert_eq!(native_type(Dialect::Postgres, ColumnType::Object), "jsonb");
    assert_eq!(native_type(Dialect::Postgres, ColumnType::Array), "jsonb");
    assert_eq!(native_type(Dialect::Postgres, ColumnType::EncodedJson), "text");
    assert_eq!(native_type(Dialect::Sqlite, ColumnType::SmallInt), "INTEGER");
    assert_eq!(native_type(Dialect::Sqlite, ColumnType::Array), "TEXT");
}

#[test]
fn postgres_create_table_leaves_key_to_alter() {
    let statement = create_table_statement(Dialect::Postgres, TestVersion::definition()).unwrap();
    assert_eq!(
        statement.sql,
        "CREATE TABLE IF NOT EXISTS \"test_versions\" (\"file_id\" text, \"id\" text, \
         \"size\" bigint, \"checksum\" text)"
    );

    let key = add_primary_key_statement(TestVersion::definition()).unwrap();
    assert_eq!(
        key.sql,
        "ALTER TABLE \"test_versions\" ADD CONSTRAINT \"test_versions_pkey\" \
         PRIMARY KEY (\"file_id\", \"id\")"
    );
}

#[test]
fn sqlite_create_table_inlines_primary_key() {
    let statement = create_table_statement(Dialect::Sqlite, TestVersion::definition()).unwrap();
    assert!(statement.sql.ends_with("PRIMARY KEY (\"file_id\", \"id\"))"));
}

#[test]
fn renamed_columns_use_storage_name() {
    let statement =
        add_column_statement(Dialect::Postgres, TestFile::definition(), "last_modified").unwrap();
    assert_eq!(
        statement.sql,
        "ALTER TABLE \"test_files\" ADD COLUMN \"modified_at\" timestamp"
    );
}

#[test]
fn unknown_column_is_rejected() {
    assert!(add_column_statement(Dialect::Postgres, TestFile::definition(), "nope").is_err());
}

#[test]
fn index_statements() {
    let definition = TestFile::definition();
    let plain = &definition.global_indexes[0];
    let folded = &definition.global_indexes[1];

    assert_eq!(index_name(definition, plain), "index_test_files_company_id_parent_id");
    assert_eq!(
        create_index_statement(definition, plain).unwrap().sql,
        "CREATE INDEX IF NOT EXISTS \"index_test_files_company_id_parent_id\" \
         ON \"test_files\" (\"company_id\", \"parent_id\")"
    );

    assert_eq!(index_name(definition, folded), "index_test_files_name_company_id_ci");
    assert_eq!(
        create_index_statement(definition, folded).unwrap().sql,
        "CREATE INDEX IF NOT EXISTS \"index_test_files_name_company_id_ci\" \
         ON \"test_files\" (lower(\"name\"), \"company_id\")"
    );
}
