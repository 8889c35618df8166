//! Persistence core.
//!
//! Entities describe themselves with an [`EntityDefinition`]; services talk to
//! a [`Repository`] obtained from the [`RepositoryManager`], which writes
//! through the [`EntityManager`] and reads through a shared [`Connector`].
//!
//! # Architecture
//!
//! - `connector`: backend contract
//! - `sql`: the SQL connector and its PostgreSQL and SQLite backends
//! - `query_builder` / `schema`: statement rendering and table reconciliation
//! - `entity_manager`: key generation and INSERT/UPDATE routing
//! - `repository` / `caching_repository` / `repository_manager`: typed access

mod caching_repository;
mod connector;
mod entity_manager;
mod error;
mod events;
mod models;
pub mod query_builder;
mod repository;
mod repository_manager;
pub mod schema;
pub mod sql;
pub mod utils;

#[cfg(test)]
mod entity_manager_test;
#[cfg(test)]
mod query_builder_test;
#[cfg(test)]
mod schema_test;
#[cfg(test)]
pub(crate) mod test_support;

pub use caching_repository::{CacheStats, CachingRepository, cache_key};
#[cfg(test)]
pub use connector::MockConnector;
pub use connector::Connector;
pub use entity_manager::{EntityManager, from_record, to_record};
pub use error::{DbError, DbResult};
pub use events::{EntityEvent, EntityEventBus};
pub use models::*;
pub use repository::{PlainRepository, Repository};
pub use repository_manager::RepositoryManager;
pub use sql::{PostgresConnector, SqlConnector, SqliteConnector, connector_from_config};
