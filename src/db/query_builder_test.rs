//! Tests for statement rendering.

use serde_json::{Value, json};

use crate::db::query_builder::{
    Dialect, QueryBuilder, SqlValue, escape_like, from_sql_value, to_sql_value,
};
use crate::db::test_support::TestFile;
use crate::db::utils::millis_to_datetime;
use crate::db::{
    ColumnDefinition, ColumnType, DbError, Entity, FindFilter, FindOptions, Pagination, Record,
    SortOrder,
};

fn filter(pairs: &[(&str, Value)]) -> FindFilter {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn file_record() -> Record {
    let file = TestFile {
        company_id: "c1".to_string(),
        id: "f1".to_string(),
        name: "Report.pdf".to_string(),
        size: 42,
        last_modified: 1_700_000_000_000,
        ..Default::default()
    };
    match serde_json::to_value(file).unwrap() {
        Value::Object(record) => record,
        _ => unreachable!(),
    }
}

#[test]
fn select_with_equality_and_pagination_postgres() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let options = FindOptions::new().paginate(Pagination::new(2, 10));
    let stmt = builder
        .build_select(
            TestFile::definition(),
            &filter(&[("company_id", json!("c1")), ("parent_id", json!("root"))]),
            &options,
        )
        .unwrap();

    assert!(stmt.sql.starts_with("SELECT \"company_id\", \"id\""));
    assert!(stmt.sql.contains("\"modified_at\""));
    assert!(
        stmt.sql
            .contains("WHERE \"company_id\" = $1 AND \"parent_id\" = $2")
    );
    assert!(stmt.sql.contains("ORDER BY \"company_id\" ASC, \"id\" ASC"));
    assert!(stmt.sql.ends_with("LIMIT 10 OFFSET 20"));
    assert_eq!(
        stmt.values,
        vec![
            SqlValue::Text("c1".to_string()),
            SqlValue::Text("root".to_string())
        ]
    );
    assert_eq!(stmt.columns.len(), TestFile::definition().columns.len());
}

#[test]
fn select_uses_question_marks_for_sqlite() {
    let builder = QueryBuilder::new(Dialect::Sqlite);
    let stmt = builder
        .build_select(
            TestFile::definition(),
            &filter(&[("company_id", json!("c1"))]),
            &FindOptions::new().ne("name", json!("trash")),
        )
        .unwrap();
    assert!(
        stmt.sql
            .contains("WHERE \"company_id\" = ? AND \"name\" <> ?")
    );
    assert!(stmt.sql.ends_with("LIMIT 100 OFFSET 0"));
}

#[test]
fn select_renders_range_in_like_and_null_operators() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let options = FindOptions::new()
        .gte("size", json!(10))
        .lt("size", json!(100))
        .in_values("parent_id", vec![json!("a"), json!("b")])
        .like("name", "rep")
        .ne("lock_owner", Value::Null)
        .sort_by("name", SortOrder::Desc);
    let stmt = builder
        .build_select(
            TestFile::definition(),
            &filter(&[("lock_owner", Value::Null)]),
            &options,
        )
        .unwrap();

    assert!(stmt.sql.contains("\"lock_owner\" IS NULL"));
    assert!(stmt.sql.contains("\"size\" >= $1"));
    assert!(stmt.sql.contains("\"size\" < $2"));
    assert!(stmt.sql.contains("\"parent_id\" IN ($3, $4)"));
    assert!(stmt.sql.contains("\"name\" LIKE $5 ESCAPE '\\'"));
    assert!(stmt.sql.contains("\"lock_owner\" IS NOT NULL"));
    assert!(stmt.sql.contains("ORDER BY \"name\" DESC"));
    assert_eq!(stmt.values[4], SqlValue::Text("%rep%".to_string()));
}

#[test]
fn like_patterns_match_wildcards_literally() {
    assert_eq!(escape_like("plain"), "plain");
    assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");

    let builder = QueryBuilder::new(Dialect::Sqlite);
    let stmt = builder
        .build_select(
            TestFile::definition(),
            &FindFilter::new(),
            &FindOptions::new().like("name", "a_b%"),
        )
        .unwrap();
    assert_eq!(stmt.values[0], SqlValue::Text("%a\\_b\\%%".to_string()));
}

#[test]
fn select_rejects_pages_past_the_offset_range() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let pagination = Pagination {
        page_token: Some(u64::MAX.to_string()),
        limit_str: Some("10".into()),
    };
    let err = builder
        .build_select(
            TestFile::definition(),
            &FindFilter::new(),
            &FindOptions::new().paginate(pagination),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidData { .. }));
}

#[test]
fn select_with_empty_in_matches_nothing() {
    let builder = QueryBuilder::new(Dialect::Sqlite);
    let stmt = builder
        .build_select(
            TestFile::definition(),
            &FindFilter::new(),
            &FindOptions::new().in_values("id", vec![]),
        )
        .unwrap();
    assert!(stmt.sql.contains("WHERE 1 = 0"));
}

#[test]
fn select_rejects_unknown_fields() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let err = builder
        .build_select(
            TestFile::definition(),
            &filter(&[("nope", json!(1))]),
            &FindOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
}

#[test]
fn insert_lists_every_column() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let stmt = builder
        .build_insert(TestFile::definition(), &file_record())
        .unwrap();
    assert!(stmt.sql.starts_with("INSERT INTO \"test_files\" (\"company_id\", \"id\""));
    assert!(stmt.sql.contains("\"modified_at\""));
    assert!(stmt.sql.ends_with("$10)"));
    assert_eq!(stmt.values.len(), 10);
    assert_eq!(stmt.values[4], SqlValue::BigInt(42));
    assert_eq!(stmt.values[6], SqlValue::Json(json!([])));
    assert_eq!(stmt.values[7], SqlValue::Null(ColumnType::Object));
}

#[test]
fn update_sets_non_key_columns_and_filters_on_full_key() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let stmt = builder
        .build_update(TestFile::definition(), &file_record())
        .unwrap();
    assert!(stmt.sql.starts_with("UPDATE \"test_files\" SET \"parent_id\" = $1"));
    assert!(!stmt.sql.contains("SET \"company_id\""));
    assert!(
        stmt.sql
            .ends_with("WHERE \"company_id\" = $9 AND \"id\" = $10")
    );
}

#[test]
fn delete_requires_primary_key() {
    let builder = QueryBuilder::new(Dialect::Sqlite);
    let stmt = builder
        .build_delete(TestFile::definition(), &file_record())
        .unwrap();
    assert_eq!(
        stmt.sql,
        "DELETE FROM \"test_files\" WHERE \"company_id\" = ? AND \"id\" = ?"
    );

    let mut partial = file_record();
    partial.remove("id");
    let err = builder
        .build_delete(TestFile::definition(), &partial)
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidData { .. }));
}

#[test]
fn compare_and_set_uses_is_null_for_null_previous() {
    let builder = QueryBuilder::new(Dialect::Postgres);
    let statements = builder
        .build_atomic_compare_and_set(
            TestFile::definition(),
            &file_record(),
            "lock_owner",
            &Value::Null,
            &json!("user-1"),
        )
        .unwrap();

    assert_eq!(
        statements.update.sql,
        "UPDATE \"test_files\" SET \"lock_owner\" = $1 WHERE \"company_id\" = $2 AND \"id\" = $3 AND \"lock_owner\" IS NULL"
    );
    assert!(!statements.update.sql.contains("= NULL"));
    assert_eq!(
        statements.select.sql,
        "SELECT \"lock_owner\" FROM \"test_files\" WHERE \"company_id\" = $1 AND \"id\" = $2"
    );
}

#[test]
fn compare_and_set_compares_previous_value() {
    let builder = QueryBuilder::new(Dialect::Sqlite);
    let statements = builder
        .build_atomic_compare_and_set(
            TestFile::definition(),
            &file_record(),
            "lock_owner",
            &json!("user-1"),
            &Value::Null,
        )
        .unwrap();
    assert!(statements.update.sql.ends_with("AND \"lock_owner\" = ?"));
    assert_eq!(
        statements.update.values[0],
        SqlValue::Null(ColumnType::String)
    );
    assert_eq!(
        statements.update.values[3],
        SqlValue::Text("user-1".to_string())
    );
}

#[test]
fn compare_and_set_rejects_primary_key_field() {
    let builder = QueryBuilder::new(Dialect::Sqlite);
    let err = builder
        .build_atomic_compare_and_set(
            TestFile::definition(),
            &file_record(),
            "id",
            &json!("f1"),
            &json!("f2"),
        )
        .unwrap_err();
    assert!(matches!(err, DbError::Configuration { .. }));
}

#[test]
fn decimal_columns_are_cast_for_postgres_reads() {
    use crate::db::EntityDefinition;
    let definition = EntityDefinition::builder("prices")
        .primary_key(["id"])
        .column(ColumnDefinition::new("id", ColumnType::String))
        .column(ColumnDefinition::new("amount", ColumnType::Decimal))
        .build();
    let stmt = QueryBuilder::new(Dialect::Postgres)
        .build_select(&definition, &FindFilter::new(), &FindOptions::new())
        .unwrap();
    assert!(
        stmt.sql
            .contains("\"amount\"::double precision AS \"amount\"")
    );
}

#[test]
fn values_convert_to_storage_types() {
    let date = ColumnDefinition::new("d", ColumnType::Date);
    assert_eq!(
        to_sql_value(&date, &json!(1_700_000_000_000i64)).unwrap(),
        SqlValue::Timestamp(millis_to_datetime(1_700_000_000_000).unwrap())
    );
    assert!(matches!(
        to_sql_value(&date, &json!("2024-01-02T03:04:05Z")).unwrap(),
        SqlValue::Timestamp(_)
    ));

    let small = ColumnDefinition::new("s", ColumnType::SmallInt);
    assert_eq!(to_sql_value(&small, &json!("12")).unwrap(), SqlValue::SmallInt(12));
    assert!(to_sql_value(&small, &json!(100_000)).is_err());

    let flag = ColumnDefinition::new("b", ColumnType::Boolean);
    assert_eq!(to_sql_value(&flag, &json!(1)).unwrap(), SqlValue::Bool(true));
    assert!(to_sql_value(&flag, &json!({})).is_err());

    let encoded = ColumnDefinition::new("e", ColumnType::EncodedJson);
    assert_eq!(
        to_sql_value(&encoded, &json!({"a": 1})).unwrap(),
        SqlValue::Text("{\"a\":1}".to_string())
    );
}

#[test]
fn values_convert_back_from_storage() {
    assert_eq!(
        from_sql_value(
            ColumnType::EncodedJson,
            SqlValue::Text("{\"a\":1}".to_string())
        ),
        json!({"a": 1})
    );
    assert_eq!(
        from_sql_value(
            ColumnType::Date,
            SqlValue::Timestamp(millis_to_datetime(1_234).unwrap())
        ),
        json!(1_234)
    );
    assert_eq!(
        from_sql_value(ColumnType::String, SqlValue::Null(ColumnType::String)),
        Value::Null
    );
    assert_eq!(from_sql_value(ColumnType::Int, SqlValue::Int(7)), json!(7));
}
