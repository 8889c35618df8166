//! Read-through cache for single-entity lookups.
//!
//! Only [`Repository::find_one`] goes through the cache, and only when the
//! filters carry every registered key field with a non-empty value and no
//! options are set. Writes invalidate the entity's entry before they reach
//! the wrapped repository and again once it returns, so a lookup racing the
//! write cannot leave the old row cached.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::LocalMemCacheConfig;
use crate::db::entity_manager::to_record;
use crate::db::utils::{is_empty_value, value_to_key_string};
use crate::db::{
    AtomicCompareAndSetResult, DbResult, Entity, ExecutionContext, FindFilter, FindOptions,
    ListResult, Record, Repository, UpsertAction,
};

/// Characters `encodeURIComponent` leaves alone.
const KEY_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Cache key for `values`: sorted `field=value` pairs joined by `&`.
///
/// `None` when a key field is missing or empty.
pub fn cache_key(key_fields: &[String], values: &Record) -> Option<String> {
    let mut fields = key_fields.to_vec();
    fields.sort();
    let mut parts = Vec::with_capacity(fields.len());
    for field in &fields {
        let value = values.get(field);
        if is_empty_value(value) {
            return None;
        }
        let value = value_to_key_string(value?);
        parts.push(format!(
            "{}={}",
            utf8_percent_encode(field, KEY_COMPONENT),
            utf8_percent_encode(&value, KEY_COMPONENT)
        ));
    }
    Some(parts.join("&"))
}

/// Snapshot of the current statistics window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Lookups that could not use the cache at all.
    pub wrong_index: u64,
    pub window_start: Instant,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses + self.wrong_index
    }
}

#[derive(Debug)]
struct StatsWindow {
    hits: AtomicU64,
    misses: AtomicU64,
    wrong_index: AtomicU64,
    window_start: std::sync::Mutex<Instant>,
}

impl StatsWindow {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            wrong_index: AtomicU64::new(0),
            window_start: std::sync::Mutex::new(Instant::now()),
        }
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            wrong_index: self.wrong_index.load(Ordering::Relaxed),
            window_start: *self.window_start.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Return the closing window and start a new one.
    fn roll(&self) -> CacheStats {
        let mut start = self.window_start.lock().unwrap_or_else(|e| e.into_inner());
        let closed = CacheStats {
            hits: self.hits.swap(0, Ordering::Relaxed),
            misses: self.misses.swap(0, Ordering::Relaxed),
            wrong_index: self.wrong_index.swap(0, Ordering::Relaxed),
            window_start: *start,
        };
        *start = Instant::now();
        closed
    }
}

/// Outcome of one statistics tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum StatsReport {
    /// The closed window saw lookups.
    Stats(CacheStats),
    /// Nothing happened for at least the idle period.
    Unused,
    Quiet,
}

/// Decide what to log for the window that just closed at `now`.
pub(crate) fn tick(
    window: CacheStats,
    last_active: &mut Instant,
    idle_period: Duration,
    now: Instant,
) -> StatsReport {
    if window.lookups() > 0 {
        *last_active = now;
        StatsReport::Stats(window)
    } else if now.saturating_duration_since(*last_active) >= idle_period {
        *last_active = now;
        StatsReport::Unused
    } else {
        StatsReport::Quiet
    }
}

/// Periodically log the statistics window, or an idle notice.
async fn print_stats(
    table: String,
    stats: Arc<StatsWindow>,
    print_period: Duration,
    idle_period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(print_period);
    ticker.tick().await;
    let mut last_active = Instant::now();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match tick(stats.roll(), &mut last_active, idle_period, Instant::now()) {
                    StatsReport::Stats(window) => {
                        let ratio = window.hits as f64 / window.lookups() as f64;
                        info!(
                            table = %table,
                            hits = window.hits,
                            misses = window.misses,
                            wrong_index = window.wrong_index,
                            hit_ratio = ratio,
                            "cache statistics"
                        );
                    }
                    StatsReport::Unused => {
                        info!(table = %table, idle_ms = idle_period.as_millis() as u64, "cache unused");
                    }
                    StatsReport::Quiet => {}
                }
            }
        }
    }
}

/// [`Repository`] decorator caching `find_one` by unique key.
pub struct CachingRepository<E: Entity> {
    inner: Arc<dyn Repository<E>>,
    key_fields: Vec<String>,
    cache: Cache<String, E>,
    stats: Arc<StatsWindow>,
    printer: CancellationToken,
}

impl<E: Entity> CachingRepository<E> {
    /// Wrap `inner`. The statistics printer starts when a tokio runtime is
    /// available.
    pub fn new(
        inner: Arc<dyn Repository<E>>,
        key_fields: Vec<String>,
        config: &LocalMemCacheConfig,
    ) -> Self {
        let mut builder = Cache::builder()
            .max_capacity(config.max_key_count)
            .time_to_live(Duration::from_secs(config.ttl_s));
        if let Some(capacity) = config.extra_node_cache_config.initial_capacity {
            builder = builder.initial_capacity(capacity);
        }
        if let Some(idle) = config.extra_node_cache_config.time_to_idle_s {
            builder = builder.time_to_idle(Duration::from_secs(idle));
        }

        let stats = Arc::new(StatsWindow::new());
        let printer = CancellationToken::new();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(print_stats(
                E::definition().table.clone(),
                Arc::clone(&stats),
                Duration::from_millis(config.print_period_ms.max(1)),
                Duration::from_millis(config.print_period_idle_ms),
                printer.clone(),
            ));
        }

        Self {
            inner,
            key_fields,
            cache: builder.build(),
            stats,
            printer,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    pub fn key_fields(&self) -> &[String] {
        &self.key_fields
    }

    /// Number of cached entities (approximate until pending tasks run).
    pub fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    fn invalidate(&self, entity: &E) -> DbResult<()> {
        let record = to_record(entity)?;
        if let Some(key) = cache_key(&self.key_fields, &record) {
            debug!(table = %E::definition().table, key = %key, "cache invalidate");
            self.cache.invalidate(&key);
        }
        Ok(())
    }

    /// Filters beyond the key must also hold on the cached entity.
    fn matches_extra_filters(&self, entity: &E, filters: &FindFilter) -> DbResult<bool> {
        let record = to_record(entity)?;
        Ok(filters
            .iter()
            .filter(|(field, _)| !self.key_fields.contains(*field))
            .all(|(field, value)| record.get(field).unwrap_or(&Value::Null) == value))
    }
}

impl<E: Entity> Drop for CachingRepository<E> {
    fn drop(&mut self) {
        self.printer.cancel();
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for CachingRepository<E> {
    async fn init(&self) -> DbResult<()> {
        self.inner.init().await
    }

    async fn find(
        &self,
        filters: &FindFilter,
        options: &FindOptions,
        context: &ExecutionContext,
    ) -> DbResult<ListResult<E>> {
        self.inner.find(filters, options, context).await
    }

    async fn find_one(
        &self,
        filters: &FindFilter,
        options: &FindOptions,
        context: &ExecutionContext,
    ) -> DbResult<Option<E>> {
        let key = match cache_key(&self.key_fields, filters) {
            Some(key) if options.is_default() => key,
            _ => {
                self.stats.wrong_index.fetch_add(1, Ordering::Relaxed);
                return self.inner.find_one(filters, options, context).await;
            }
        };

        if let Some(entity) = self.cache.get(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(if self.matches_extra_filters(&entity, filters)? {
                Some(entity)
            } else {
                None
            });
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        // load by key only so the cached entity is independent of extra filters
        let key_filters: FindFilter = filters
            .iter()
            .filter(|(field, _)| self.key_fields.contains(*field))
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        let found = self.inner.find_one(&key_filters, options, context).await?;
        match found {
            Some(entity) => {
                self.cache.insert(key, entity.clone());
                Ok(if self.matches_extra_filters(&entity, filters)? {
                    Some(entity)
                } else {
                    None
                })
            }
            None => Ok(None),
        }
    }

    async fn save(&self, entity: &mut E) -> DbResult<UpsertAction> {
        self.invalidate(entity)?;
        let result = self.inner.save(entity).await;
        self.invalidate(entity)?;
        result
    }

    async fn save_all(&self, entities: &mut [E]) -> DbResult<Vec<UpsertAction>> {
        for entity in entities.iter() {
            self.invalidate(entity)?;
        }
        let result = self.inner.save_all(entities).await;
        for entity in entities.iter() {
            self.invalidate(entity)?;
        }
        result
    }

    async fn remove(&self, entity: &E) -> DbResult<bool> {
        self.invalidate(entity)?;
        let result = self.inner.remove(entity).await;
        self.invalidate(entity)?;
        result
    }

    async fn atomic_compare_and_set(
        &self,
        entity: &E,
        field: &str,
        previous: &Value,
        next: &Value,
    ) -> DbResult<AtomicCompareAndSetResult> {
        self.invalidate(entity)?;
        let result = self
            .inner
            .atomic_compare_and_set(entity, field, previous, next)
            .await;
        self.invalidate(entity)?;
        result
    }
}
