//! Tests for key generation and INSERT/UPDATE routing.

use std::sync::Arc;

use serde_json::{Value, json};
use uuid::Uuid;

use crate::db::entity_manager::{EntityManager, prepare_record, to_record};
use crate::db::events::{EntityEvent, EntityEventBus};
use crate::db::test_support::{TestFile, TestVersion};
use crate::db::{DbError, Entity, MockConnector, Record, UpsertAction};

fn manager(connector: MockConnector) -> EntityManager {
    EntityManager::new(Arc::new(connector), EntityEventBus::new())
}

fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[test]
fn empty_entity_is_inserted_with_generated_keys() {
    let mut r = record(json!({}));
    let action = prepare_record(TestFile::definition(), &mut r).unwrap();

    assert_eq!(action, UpsertAction::Insert);
    let id = r["id"].as_str().unwrap();
    assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 4);
    // no generator: empty default
    assert_eq!(r["company_id"], json!(""));
}

#[test]
fn partial_key_is_inserted() {
    let mut r = record(json!({"id": "f1"}));
    let action = prepare_record(TestFile::definition(), &mut r).unwrap();

    assert_eq!(action, UpsertAction::Insert);
    assert_eq!(r["id"], json!("f1"));
}

#[test]
fn full_key_is_updated() {
    let mut r = record(json!({"id": "f1", "company_id": "c1"}));
    let action = prepare_record(TestFile::definition(), &mut r).unwrap();

    assert_eq!(action, UpsertAction::Update);
    assert_eq!(r["id"], json!("f1"));
    assert_eq!(r["company_id"], json!("c1"));
}

#[test]
fn time_uuid_generator_produces_v1() {
    let mut r = record(json!({"file_id": "f1"}));
    prepare_record(TestVersion::definition(), &mut r).unwrap();

    let id = r["id"].as_str().unwrap();
    assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 1);
}

#[test]
fn on_upsert_hooks_run_on_every_prepare() {
    let mut r = record(json!({"id": "f1", "company_id": "c1", "last_modified": 0}));
    prepare_record(TestFile::definition(), &mut r).unwrap();
    assert!(r["last_modified"].as_i64().unwrap() > 0);
}

#[test]
fn non_object_entities_are_rejected() {
    #[derive(Clone, serde::Serialize, serde::Deserialize)]
    struct NotAnObject(u32);

    impl Entity for NotAnObject {
        fn definition() -> &'static crate::db::EntityDefinition {
            TestFile::definition()
        }
    }

    let err = to_record(&NotAnObject(3)).unwrap_err();
    assert!(matches!(err, DbError::InvalidEntity { .. }));
}

#[tokio::test]
async fn persist_writes_generated_keys_back_and_publishes() {
    let mut connector = MockConnector::new();
    connector
        .expect_upsert()
        .withf(|definition, records, action| {
            definition.table == "test_files"
                && records.len() == 1
                && *action == UpsertAction::Insert
        })
        .times(1)
        .returning(|_, records, _| Ok(vec![true; records.len()]));
    let manager = manager(connector);
    let mut events = manager.events().subscribe();

    let mut file = TestFile::new("c1", "", "a.txt");
    let action = manager.persist(&mut file).await.unwrap();

    assert_eq!(action, UpsertAction::Insert);
    assert!(!file.id.is_empty());
    match events.recv().await.unwrap() {
        EntityEvent::Saved { table, action, key } => {
            assert_eq!(table, "test_files");
            assert_eq!(action, UpsertAction::Insert);
            assert_eq!(key["id"], json!(file.id));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn persist_all_splits_inserts_and_updates() {
    let mut connector = MockConnector::new();
    connector
        .expect_upsert()
        .withf(|_, records, action| *action == UpsertAction::Insert && records.len() == 2)
        .times(1)
        .returning(|_, records, _| Ok(vec![true; records.len()]));
    connector
        .expect_upsert()
        .withf(|_, records, action| *action == UpsertAction::Update && records.len() == 1)
        .times(1)
        .returning(|_, records, _| Ok(vec![true; records.len()]));
    let manager = manager(connector);

    let mut files = vec![
        TestFile::new("c1", "", "new-1"),
        TestFile::new("c1", "f2", "existing"),
        TestFile::new("", "f3", "new-2"),
    ];
    let actions = manager.persist_all(&mut files).await.unwrap();

    assert_eq!(
        actions,
        vec![UpsertAction::Insert, UpsertAction::Update, UpsertAction::Insert]
    );
}

#[tokio::test]
async fn remove_requires_a_full_key() {
    let manager = manager(MockConnector::new());

    let err = manager
        .remove(&TestFile::new("c1", "", "a"))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::InvalidEntity { .. }));
}

#[tokio::test]
async fn remove_delegates_and_publishes() {
    let mut connector = MockConnector::new();
    connector
        .expect_remove()
        .times(1)
        .returning(|_, records| Ok(vec![true; records.len()]));
    let manager = manager(connector);
    let mut events = manager.events().subscribe();

    assert!(manager.remove(&TestFile::new("c1", "f1", "a")).await.unwrap());
    assert!(matches!(
        events.recv().await.unwrap(),
        EntityEvent::Removed { .. }
    ));
}

#[tokio::test]
async fn connector_errors_propagate() {
    let mut connector = MockConnector::new();
    connector.expect_upsert().returning(|_, _, _| {
        Err(DbError::Database {
            message: "boom".into(),
            log_id: "l1".into(),
        })
    });
    let manager = manager(connector);

    let mut file = TestFile::new("c1", "f1", "a");
    let err = manager.persist(&mut file).await.unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
}
