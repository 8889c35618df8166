//! The contract every database backend implements.

use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use crate::db::{
    AtomicCompareAndSetResult, DbResult, EntityDefinition, FindFilter, FindOptions, ListResult,
    Record, UpsertAction,
};
use crate::diagnostics::{DiagnosticDepth, DiagnosticReport};

/// Backend driver for one physical database technology.
///
/// One connector instance is shared by every repository.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Short backend name used in logs (`postgres`, `sqlite`).
    fn kind(&self) -> &'static str;

    /// Open the connection pool. Errors are logged and returned, never retried.
    async fn connect(&self) -> DbResult<()>;

    async fn disconnect(&self) -> DbResult<()>;

    /// Connect unless already connected.
    async fn init(&self) -> DbResult<()>;

    /// Reconcile the table of `definition`; `false` when it could not be created.
    async fn create_table(&self, definition: &EntityDefinition) -> DbResult<bool>;

    async fn find(
        &self,
        definition: &EntityDefinition,
        filters: &FindFilter,
        options: &FindOptions,
    ) -> DbResult<ListResult<Record>>;

    /// Delete by primary key; one flag per entity telling whether a row went away.
    async fn remove(&self, definition: &EntityDefinition, entities: &[Record])
    -> DbResult<Vec<bool>>;

    /// Write entities; one flag per entity telling whether a row was written.
    async fn upsert(
        &self,
        definition: &EntityDefinition,
        entities: &[Record],
        action: UpsertAction,
    ) -> DbResult<Vec<bool>>;

    async fn atomic_compare_and_set(
        &self,
        definition: &EntityDefinition,
        entity: &Record,
        field: &str,
        previous: &Value,
        next: &Value,
    ) -> DbResult<AtomicCompareAndSetResult>;

    /// Drop every table of the connected database.
    async fn drop_database(&self) -> DbResult<()>;

    /// Drop the tables created through this connector.
    async fn drop_tables(&self) -> DbResult<()>;

    async fn get_diagnostics(&self, depth: DiagnosticDepth) -> DiagnosticReport;
}
