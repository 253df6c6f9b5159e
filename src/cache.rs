// =============================================================================
// CACHE MODULE
// =============================================================================
// Read-side cache and the invalidation policy applied after stock writes.
//
// KEYS
//   Keys are hierarchical, like the UI's query keys:
//     adega:product:<id>            one product's stock detail
//     adega:product-variants:<id>   its unit/package breakdown
//     adega:products:<page>:<size>  list pages
//     adega:inventory-movements:... movement history queries
//     adega:dashboard:...           KPI aggregates
//     adega:reports:...             report aggregates
//     adega:low-stock               the low-stock set
//   Invalidating a key drops the key itself and everything nested under it,
//   so `adega:products` drops every list page at once.
//
// BACKENDS
//   RedisQueryCache in production, MemoryQueryCache for tests and local runs.
//   Both sit behind CacheHandle, which refuses to store an answer loaded
//   before the latest invalidation of its resource.
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::AppResult;
use crate::low_stock;
use crate::metrics;
use crate::models::{AdjustmentResult, ProductStockRecord};

const KEY_NAMESPACE: &str = "adega";

// =============================================================================
// QUERY KEYS
// =============================================================================

/// Logical resource a cached read belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    ProductDetail,
    ProductVariants,
    ProductList,
    Movements,
    Dashboard,
    Reports,
    LowStock,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::ProductDetail => "product",
            Resource::ProductVariants => "product-variants",
            Resource::ProductList => "products",
            Resource::Movements => "inventory-movements",
            Resource::Dashboard => "dashboard",
            Resource::Reports => "reports",
            Resource::LowStock => "low-stock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    resource: Resource,
    entity: Option<String>,
}

impl QueryKey {
    /// The whole resource; invalidating it drops every nested key.
    pub fn resource(resource: Resource) -> Self {
        Self {
            resource,
            entity: None,
        }
    }

    pub fn entity(resource: Resource, entity: impl Into<String>) -> Self {
        Self {
            resource,
            entity: Some(entity.into()),
        }
    }

    pub fn product_detail(product_id: Uuid) -> Self {
        Self::entity(Resource::ProductDetail, product_id.to_string())
    }

    pub fn product_variants(product_id: Uuid) -> Self {
        Self::entity(Resource::ProductVariants, product_id.to_string())
    }

    pub fn resource_kind(&self) -> Resource {
        self.resource
    }

    /// Does a stored key fall under this one?
    pub fn covers(&self, stored: &str) -> bool {
        let own = self.to_string();
        stored == own
            || stored
                .strip_prefix(own.as_str())
                .is_some_and(|rest| rest.starts_with(':'))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => {
                write!(f, "{}:{}:{}", KEY_NAMESPACE, self.resource.as_str(), entity)
            }
            None => write!(f, "{}:{}", KEY_NAMESPACE, self.resource.as_str()),
        }
    }
}

// =============================================================================
// CACHE STORE
// =============================================================================

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store behind every cached read. Injected, never global.
#[async_trait]
pub trait QueryCache: Send + Sync {
    async fn get(&self, key: &QueryKey) -> Result<Option<String>, CacheError>;

    async fn put(&self, key: &QueryKey, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Drop `key` and every key nested under it. Returns how many were removed.
    async fn invalidate(&self, key: &QueryKey) -> Result<u64, CacheError>;

    async fn ping(&self) -> bool;
}

// -----------------------------------------------------------------------------
// REDIS
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedisQueryCache {
    conn: redis::aio::ConnectionManager,
}

impl RedisQueryCache {
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    async fn nested_keys(&self, key: &QueryKey) -> Result<Vec<String>, CacheError> {
        let pattern = format!("{}:*", key);
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(found)
    }
}

#[async_trait]
impl QueryCache for RedisQueryCache {
    async fn get(&self, key: &QueryKey) -> Result<Option<String>, CacheError> {
        let start = Instant::now();
        let value: Option<String> = redis::cmd("GET")
            .arg(key.to_string())
            .query_async(&mut self.conn.clone())
            .await?;
        metrics::record_cache_operation("get", start.elapsed().as_secs_f64());
        Ok(value)
    }

    async fn put(&self, key: &QueryKey, value: String, ttl: Duration) -> Result<(), CacheError> {
        let start = Instant::now();
        redis::cmd("SETEX")
            .arg(key.to_string())
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async::<_, ()>(&mut self.conn.clone())
            .await?;
        metrics::record_cache_operation("set", start.elapsed().as_secs_f64());
        Ok(())
    }

    async fn invalidate(&self, key: &QueryKey) -> Result<u64, CacheError> {
        let start = Instant::now();
        let mut keys = self.nested_keys(key).await?;
        keys.push(key.to_string());

        let removed: u64 = redis::cmd("DEL")
            .arg(&keys)
            .query_async(&mut self.conn.clone())
            .await?;
        metrics::record_cache_operation("delete", start.elapsed().as_secs_f64());
        Ok(removed)
    }

    async fn ping(&self) -> bool {
        redis::cmd("PING")
            .query_async::<_, String>(&mut self.conn.clone())
            .await
            .is_ok()
    }
}

// -----------------------------------------------------------------------------
// IN-MEMORY
// -----------------------------------------------------------------------------

/// Operation log entry, kept so tests can assert what happened and in which order.
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Get(String),
    Put(String),
    Invalidate(String),
}

/// Single-process store. Expired entries are swept on every write, so the
/// map never holds more than what was written within one TTL.
#[derive(Debug, Default)]
pub struct MemoryQueryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    offline: AtomicBool,
    #[cfg(test)]
    log: Mutex<Vec<CacheOp>>,
}

impl MemoryQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail, as if the backend were down.
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn operations(&self) -> Vec<CacheOp> {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    #[cfg(test)]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&key.to_string())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    #[cfg(test)]
    fn record(&self, op: CacheOp) {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).push(op);
    }

    fn check_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory cache offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueryCache for MemoryQueryCache {
    async fn get(&self, key: &QueryKey) -> Result<Option<String>, CacheError> {
        self.check_online()?;
        let raw = key.to_string();
        #[cfg(test)]
        self.record(CacheOp::Get(raw.clone()));

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(&raw) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Ok(Some(value.clone()))
            }
            Some(_) => {}
            None => return Ok(None),
        }

        // expired
        entries.remove(&raw);
        Ok(None)
    }

    async fn put(&self, key: &QueryKey, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.check_online()?;
        let raw = key.to_string();
        #[cfg(test)]
        self.record(CacheOp::Put(raw.clone()));

        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(raw, (value, now + ttl));
        Ok(())
    }

    async fn invalidate(&self, key: &QueryKey) -> Result<u64, CacheError> {
        self.check_online()?;
        #[cfg(test)]
        self.record(CacheOp::Invalidate(key.to_string()));

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = entries.len();
        entries.retain(|stored, _| !key.covers(stored));
        Ok((before - entries.len()) as u64)
    }

    async fn ping(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

// =============================================================================
// CACHE HANDLE
// =============================================================================
// Every invalidation bumps the generation of the resource it touches. A value
// loaded from the source is stored only if its resource is still at the
// generation observed before the load, so a read that raced a stock write
// cannot put the pre-write answer back after the write's invalidation.
//
// The check and the store happen under the read half of the lock and the bump
// under the write half: a fill that passed the check completes before the
// bump, and the invalidation that follows removes it.

#[derive(Debug, Default)]
struct Generations {
    by_resource: RwLock<HashMap<Resource, u64>>,
}

/// Store plus the generation bookkeeping shared by readers and the
/// invalidation coordinator. Cheap to clone.
#[derive(Clone)]
pub struct CacheHandle {
    store: Arc<dyn QueryCache>,
    generations: Arc<Generations>,
    ttl: Duration,
}

impl CacheHandle {
    pub fn new(store: Arc<dyn QueryCache>, ttl: Duration) -> Self {
        Self {
            store,
            generations: Arc::new(Generations::default()),
            ttl,
        }
    }

    pub async fn ping(&self) -> bool {
        self.store.ping().await
    }

    pub async fn generation(&self, resource: Resource) -> u64 {
        self.generations
            .by_resource
            .read()
            .await
            .get(&resource)
            .copied()
            .unwrap_or(0)
    }

    /// Store `value` unless `key`'s resource was invalidated after `seen`.
    /// Returns whether the value was stored.
    pub async fn put_if_current(
        &self,
        key: &QueryKey,
        value: String,
        seen: u64,
    ) -> Result<bool, CacheError> {
        let generations = self.generations.by_resource.read().await;
        let current = generations.get(&key.resource_kind()).copied().unwrap_or(0);
        if current != seen {
            return Ok(false);
        }
        self.store.put(key, value, self.ttl).await?;
        Ok(true)
    }

    /// Drop `key` and everything nested under it.
    pub async fn invalidate(&self, key: &QueryKey) -> Result<u64, CacheError> {
        *self
            .generations
            .by_resource
            .write()
            .await
            .entry(key.resource_kind())
            .or_insert(0) += 1;
        self.store.invalidate(key).await
    }
}

// =============================================================================
// READ-THROUGH
// =============================================================================
/// Serve `key` from the cache, or run `fetch` and store its answer.
///
/// A cache that is down or holds an unreadable entry is treated as a miss;
/// reads never fail because of the cache. An answer is not stored when the
/// key's resource was invalidated while `fetch` ran.
pub async fn read_through<T, F, Fut>(cache: &CacheHandle, key: &QueryKey, fetch: F) -> AppResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    match cache.store.get(key).await {
        Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
            Ok(value) => {
                metrics::record_cache_lookup("hit");
                return Ok(value);
            }
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Discarding unreadable cache entry")
            }
        },
        Ok(None) => {}
        Err(err) => {
            tracing::warn!(key = %key, error = %err, "Cache read failed, falling back to source")
        }
    }
    metrics::record_cache_lookup("miss");

    let seen = cache.generation(key.resource_kind()).await;
    let value = fetch().await?;

    match serde_json::to_string(&value) {
        Ok(raw) => match cache.put_if_current(key, raw, seen).await {
            Ok(true) => {}
            Ok(false) => tracing::debug!(key = %key, "Invalidated during load, not cached"),
            Err(err) => tracing::warn!(key = %key, error = %err, "Cache write failed"),
        },
        Err(err) => tracing::warn!(key = %key, error = %err, "Could not serialize value for cache"),
    }

    Ok(value)
}

// =============================================================================
// INVALIDATION COORDINATOR
// =============================================================================

/// Where a fresh copy of a product comes from when the coordinator refetches.
#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn load_product(&self, product_id: Uuid) -> AppResult<Option<ProductStockRecord>>;
}

/// Keys to drop after product `product_id` changed, most specific first:
/// the product's own entries, the list, movement history, then aggregates.
pub fn invalidation_plan(product_id: Uuid) -> Vec<QueryKey> {
    vec![
        QueryKey::product_detail(product_id),
        QueryKey::product_variants(product_id),
        QueryKey::resource(Resource::ProductList),
        QueryKey::resource(Resource::Movements),
        QueryKey::resource(Resource::Dashboard),
        QueryKey::resource(Resource::Reports),
        QueryKey::resource(Resource::LowStock),
    ]
}

#[derive(Clone)]
pub struct InvalidationCoordinator {
    cache: CacheHandle,
    source: Arc<dyn ProductSource>,
}

impl InvalidationCoordinator {
    pub fn new(cache: CacheHandle, source: Arc<dyn ProductSource>) -> Self {
        Self { cache, source }
    }

    pub async fn on_adjustment_success(&self, result: &AdjustmentResult) {
        self.on_product_changed(result.product_id).await;
    }

    /// Mark every view of `product_id` stale and schedule a background
    /// refetch of its detail. Returns once the stale entries are gone; does
    /// not wait for the refetch.
    pub async fn on_product_changed(&self, product_id: Uuid) {
        for (position, key) in invalidation_plan(product_id).into_iter().enumerate() {
            match self.cache.invalidate(&key).await {
                Ok(removed) => {
                    metrics::record_invalidation(key.resource_kind().as_str(), "ok");
                    tracing::debug!(key = %key, removed, "Cache entries invalidated");
                }
                Err(err) => {
                    metrics::record_invalidation(key.resource_kind().as_str(), "failed");
                    tracing::warn!(key = %key, error = %err, "Cache invalidation failed");
                }
            }

            // detail entry gone: start refreshing it right away
            if position == 0 {
                self.spawn_refetch(product_id);
            }
        }
    }

    fn spawn_refetch(&self, product_id: Uuid) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.refetch_product(product_id).await {
                tracing::warn!(product_id = %product_id, error = %err, "Background refetch failed");
            }
        });
    }

    /// Load `product_id` from the source and repopulate its detail and
    /// variant entries. An entry invalidated again while loading is left
    /// empty for the next reader.
    pub async fn refetch_product(&self, product_id: Uuid) -> AppResult<Option<ProductStockRecord>> {
        let seen_detail = self.cache.generation(Resource::ProductDetail).await;
        let seen_variants = self.cache.generation(Resource::ProductVariants).await;

        let Some(record) = self.source.load_product(product_id).await? else {
            return Ok(None);
        };

        let variants = low_stock::variants_of(&record);
        let detail_json = serde_json::to_string(&record).map_err(anyhow::Error::from)?;
        let variants_json = serde_json::to_string(&variants).map_err(anyhow::Error::from)?;

        let detail_key = QueryKey::product_detail(product_id);
        if !self.cache.put_if_current(&detail_key, detail_json, seen_detail).await? {
            tracing::debug!(key = %detail_key, "Refetch superseded by a later invalidation");
        }
        self.cache
            .put_if_current(&QueryKey::product_variants(product_id), variants_json, seen_variants)
            .await?;

        Ok(Some(record))
    }
}
