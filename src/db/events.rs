//! Change notification for entity writes.
//!
//! The entity manager publishes one message per persisted or removed entity;
//! domain services subscribe to react (search indexing, notifications, ...).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::{Record, UpsertAction};

/// Messages broadcast after an entity write completes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum EntityEvent {
    Saved {
        table: String,
        action: UpsertAction,
        key: Record,
    },
    Removed {
        table: String,
        key: Record,
    },
}

impl EntityEvent {
    pub fn table(&self) -> &str {
        match self {
            EntityEvent::Saved { table, .. } | EntityEvent::Removed { table, .. } => table,
        }
    }
}

/// Pub/sub bus for entity events.
#[derive(Clone)]
pub struct EntityEventBus {
    tx: broadcast::Sender<EntityEvent>,
}

impl Default for EntityEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityEventBus {
    /// Create a bus buffering up to 256 messages per lagging subscriber.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntityEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; having no subscriber is not an error.
    pub fn publish(&self, event: EntityEvent) {
        let _ = self.tx.send(event);
    }
}
