//! One repository per table, created on first use.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::config::LocalMemCacheConfig;
use crate::db::entity_manager::EntityManager;
use crate::db::events::EntityEventBus;
use crate::db::{
    CachingRepository, Connector, DbError, DbResult, Entity, PlainRepository, Repository,
};

type AnyRepository = Box<dyn Any + Send + Sync>;

/// Owns every live repository.
///
/// Caching applies to a table when a cache configuration is present and the
/// table registered its key fields before its repository was first requested.
pub struct RepositoryManager {
    entity_manager: EntityManager,
    cache_config: Option<LocalMemCacheConfig>,
    cache_keys: DashMap<String, Vec<String>>,
    repositories: Mutex<HashMap<String, AnyRepository>>,
}

impl RepositoryManager {
    pub fn new(connector: Arc<dyn Connector>, cache_config: Option<LocalMemCacheConfig>) -> Self {
        Self::with_events(connector, cache_config, EntityEventBus::new())
    }

    pub fn with_events(
        connector: Arc<dyn Connector>,
        cache_config: Option<LocalMemCacheConfig>,
        events: EntityEventBus,
    ) -> Self {
        Self {
            entity_manager: EntityManager::new(connector, events),
            cache_config,
            cache_keys: DashMap::new(),
            repositories: Mutex::new(HashMap::new()),
        }
    }

    pub fn entity_manager(&self) -> &EntityManager {
        &self.entity_manager
    }

    /// Declare the unique key used to cache `table` lookups.
    pub fn register_cache_keys<I, S>(&self, table: &str, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cache_keys
            .insert(table.to_string(), fields.into_iter().map(Into::into).collect());
    }

    pub fn cache_keys(&self, table: &str) -> Option<Vec<String>> {
        self.cache_keys.get(table).map(|keys| keys.clone())
    }

    /// The repository of `E`, created and initialized on first request.
    pub async fn get_repository<E: Entity>(&self) -> DbResult<Arc<dyn Repository<E>>> {
        let definition = E::definition();
        let table = definition.table.as_str();
        let mut repositories = self.repositories.lock().await;

        if let Some(existing) = repositories.get(table) {
            return existing
                .downcast_ref::<Arc<dyn Repository<E>>>()
                .cloned()
                .ok_or_else(|| {
                    DbError::configuration(format!(
                        "table '{}' is already bound to another entity type",
                        table
                    ))
                });
        }

        let plain: Arc<dyn Repository<E>> =
            Arc::new(PlainRepository::<E>::new(self.entity_manager.clone()));
        if let Err(e) = plain.init().await {
            error!(table, error = %e, "repository initialization failed");
            return Err(match e {
                DbError::RepositoryInit { .. } => e,
                other => DbError::RepositoryInit {
                    table: table.to_string(),
                    message: other.to_string(),
                },
            });
        }

        let repository: Arc<dyn Repository<E>> = match (&self.cache_config, self.cache_keys(table)) {
            (Some(config), Some(keys)) => {
                info!(table, keys = ?keys, "repository created with cache");
                Arc::new(CachingRepository::new(plain, keys, config))
            }
            _ => {
                info!(table, "repository created");
                plain
            }
        };

        repositories.insert(table.to_string(), Box::new(repository.clone()));
        Ok(repository)
    }

    /// Number of live repositories.
    pub async fn len(&self) -> usize {
        self.repositories.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
