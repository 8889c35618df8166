//! Write orchestration for entities.
//!
//! The entity manager turns typed entities into records, fills generated
//! primary keys, applies `on_upsert` hooks, decides between INSERT and UPDATE
//! and hands the result to the connector.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::db::events::{EntityEvent, EntityEventBus};
use crate::db::utils::{generate_key_value, is_empty_value};
use crate::db::{Connector, DbError, DbResult, Entity, EntityDefinition, Record, UpsertAction};

/// Serialize an entity into a record.
pub fn to_record<E: Entity>(entity: &E) -> DbResult<Record> {
    match serde_json::to_value(entity) {
        Ok(Value::Object(record)) => Ok(record),
        Ok(other) => Err(DbError::InvalidEntity {
            message: format!(
                "{} serialized to {} instead of an object",
                E::definition().name,
                other
            ),
        }),
        Err(e) => Err(DbError::InvalidEntity {
            message: format!("{}: {}", E::definition().name, e),
        }),
    }
}

/// Deserialize a record into an entity.
pub fn from_record<E: Entity>(record: Record) -> DbResult<E> {
    serde_json::from_value(Value::Object(record)).map_err(|e| {
        DbError::invalid_data(format!("cannot decode {}: {}", E::definition().name, e))
    })
}

/// Primary key fields of a record, used in events and log lines.
pub fn key_of(definition: &EntityDefinition, record: &Record) -> Record {
    definition
        .primary_key
        .iter()
        .map(|field| (field.clone(), record.get(field).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Run hooks and key generation on `record`; returns the statement to issue.
///
/// INSERT when at least one primary key field was empty, UPDATE otherwise.
pub fn prepare_record(definition: &EntityDefinition, record: &mut Record) -> DbResult<UpsertAction> {
    definition.validate()?;

    for column in &definition.columns {
        if let Some(hook) = column.options.on_upsert {
            let current = record.get(&column.name).cloned().unwrap_or(Value::Null);
            record.insert(column.name.clone(), hook(&current));
        }
    }

    let mut action = UpsertAction::Update;
    for column in definition.primary_key_columns()? {
        if is_empty_value(record.get(&column.name)) {
            action = UpsertAction::Insert;
            record.insert(column.name.clone(), generate_key_value(column));
        }
    }
    Ok(action)
}

/// Persists and removes entities through one shared connector.
#[derive(Clone)]
pub struct EntityManager {
    connector: Arc<dyn Connector>,
    events: EntityEventBus,
}

impl EntityManager {
    pub fn new(connector: Arc<dyn Connector>, events: EntityEventBus) -> Self {
        Self { connector, events }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    pub fn events(&self) -> &EntityEventBus {
        &self.events
    }

    /// Write one entity. Generated key fields and hook results are written
    /// back into `entity`.
    pub async fn persist<E: Entity>(&self, entity: &mut E) -> DbResult<UpsertAction> {
        let definition = E::definition();
        let mut record = to_record(entity)?;
        let action = prepare_record(definition, &mut record)?;
        *entity = from_record(record.clone())?;

        let written = self
            .connector
            .upsert(definition, std::slice::from_ref(&record), action)
            .await?;
        if written.first() != Some(&true) {
            warn!(table = %definition.table, %action, key = ?key_of(definition, &record), "upsert wrote no row");
        }
        debug!(table = %definition.table, %action, "entity persisted");

        self.events.publish(EntityEvent::Saved {
            table: definition.table.clone(),
            action,
            key: key_of(definition, &record),
        });
        Ok(action)
    }

    /// Write many entities: one INSERT batch and one UPDATE batch.
    pub async fn persist_all<E: Entity>(&self, entities: &mut [E]) -> DbResult<Vec<UpsertAction>> {
        let definition = E::definition();
        let mut inserts = vec![];
        let mut updates = vec![];
        let mut actions = Vec::with_capacity(entities.len());

        for entity in entities.iter_mut() {
            let mut record = to_record(entity)?;
            let action = prepare_record(definition, &mut record)?;
            *entity = from_record(record.clone())?;
            match action {
                UpsertAction::Insert => inserts.push(record),
                UpsertAction::Update => updates.push(record),
            }
            actions.push(action);
        }

        for (action, records) in [
            (UpsertAction::Insert, &inserts),
            (UpsertAction::Update, &updates),
        ] {
            if records.is_empty() {
                continue;
            }
            self.connector.upsert(definition, records, action).await?;
            for record in records {
                self.events.publish(EntityEvent::Saved {
                    table: definition.table.clone(),
                    action,
                    key: key_of(definition, record),
                });
            }
        }
        Ok(actions)
    }

    /// Delete one entity by primary key; `true` when a row went away.
    pub async fn remove<E: Entity>(&self, entity: &E) -> DbResult<bool> {
        let definition = E::definition();
        definition.validate()?;
        let record = to_record(entity)?;
        if let Some(field) = definition
            .primary_key
            .iter()
            .find(|field| is_empty_value(record.get(field.as_str())))
        {
            return Err(DbError::InvalidEntity {
                message: format!(
                    "cannot remove {} without primary key field '{}'",
                    definition.name, field
                ),
            });
        }

        let key = key_of(definition, &record);
        let removed = self
            .connector
            .remove(definition, &[record])
            .await?
            .first()
            .copied()
            .unwrap_or(false);

        self.events.publish(EntityEvent::Removed {
            table: definition.table.clone(),
            key,
        });
        Ok(removed)
    }
}
