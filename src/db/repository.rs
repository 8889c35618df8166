//! Typed data access for one entity.
//!
//! [`Repository`] is the contract services program against. The repository
//! manager hands out either a [`PlainRepository`] or a
//! [`CachingRepository`](crate::db::CachingRepository) wrapping one.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use crate::db::entity_manager::{EntityManager, from_record, to_record};
use crate::db::{
    AtomicCompareAndSetResult, DbError, DbResult, Entity, EntityDefinition, ExecutionContext,
    FindFilter, FindOptions, ListResult, Pagination, UpsertAction,
};

/// Repository for one entity type.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    fn definition(&self) -> &'static EntityDefinition {
        E::definition()
    }

    /// Connect if needed and reconcile the entity's table.
    async fn init(&self) -> DbResult<()>;

    async fn find(
        &self,
        filters: &FindFilter,
        options: &FindOptions,
        context: &ExecutionContext,
    ) -> DbResult<ListResult<E>>;

    /// First entity matching `filters`, if any.
    async fn find_one(
        &self,
        filters: &FindFilter,
        options: &FindOptions,
        context: &ExecutionContext,
    ) -> DbResult<Option<E>>;

    /// Persist an entity; generated keys are written back into it.
    async fn save(&self, entity: &mut E) -> DbResult<UpsertAction>;

    async fn save_all(&self, entities: &mut [E]) -> DbResult<Vec<UpsertAction>>;

    /// Delete by primary key; `true` when a row went away.
    async fn remove(&self, entity: &E) -> DbResult<bool>;

    /// Set `field` to `next` only while it still holds `previous`.
    async fn atomic_compare_and_set(
        &self,
        entity: &E,
        field: &str,
        previous: &Value,
        next: &Value,
    ) -> DbResult<AtomicCompareAndSetResult>;
}

/// Repository going straight to the connector.
pub struct PlainRepository<E: Entity> {
    manager: EntityManager,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> PlainRepository<E> {
    pub fn new(manager: EntityManager) -> Self {
        Self {
            manager,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for PlainRepository<E> {
    async fn init(&self) -> DbResult<()> {
        let definition = E::definition();
        let connector = self.manager.connector();
        connector.init().await?;
        if !connector.create_table(definition).await? {
            return Err(DbError::RepositoryInit {
                table: definition.table.clone(),
                message: "table could not be created".to_string(),
            });
        }
        Ok(())
    }

    async fn find(
        &self,
        filters: &FindFilter,
        options: &FindOptions,
        context: &ExecutionContext,
    ) -> DbResult<ListResult<E>> {
        let definition = E::definition();
        debug!(
            table = %definition.table,
            company_id = ?context.company_id,
            request_id = ?context.request_id,
            "find"
        );
        self.manager
            .connector()
            .find(definition, filters, options)
            .await
            .inspect_err(|e| {
                error!(table = %definition.table, request_id = ?context.request_id, error = %e, "find failed")
            })?
            .try_map(from_record)
    }

    async fn find_one(
        &self,
        filters: &FindFilter,
        options: &FindOptions,
        context: &ExecutionContext,
    ) -> DbResult<Option<E>> {
        let mut options = options.clone();
        if options.pagination.is_none() {
            options.pagination = Some(Pagination::new(0, 1));
        }
        let mut found = self.find(filters, &options, context).await?;
        Ok(if found.items.is_empty() {
            None
        } else {
            Some(found.items.swap_remove(0))
        })
    }

    async fn save(&self, entity: &mut E) -> DbResult<UpsertAction> {
        self.manager.persist(entity).await
    }

    async fn save_all(&self, entities: &mut [E]) -> DbResult<Vec<UpsertAction>> {
        self.manager.persist_all(entities).await
    }

    async fn remove(&self, entity: &E) -> DbResult<bool> {
        self.manager.remove(entity).await
    }

    async fn atomic_compare_and_set(
        &self,
        entity: &E,
        field: &str,
        previous: &Value,
        next: &Value,
    ) -> DbResult<AtomicCompareAndSetResult> {
        let definition = E::definition();
        let record = to_record(entity)?;
        self.manager
            .connector()
            .atomic_compare_and_set(definition, &record, field, previous, next)
            .await
    }
}
