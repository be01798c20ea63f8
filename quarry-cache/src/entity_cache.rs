//! Cache-aside entity cache.
//!
//! Entries are keyed `{prefix}:{entity}:{id}`. Every write also scores the
//! key in a sorted access index (`{prefix}:__access`) with a strictly
//! increasing touch stamp; when the store holds `max_size` entries or more,
//! the next write first evicts the [`EVICTION_BATCH`] lowest-scored keys.
//!
//! Size check, eviction and write are separate round trips. Two writers
//! racing past the size check may both evict a batch; that costs entries,
//! never consistency.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quarry_core::{validate_identifier, CacheSettings, QuarryError, QuarryResult, QueryOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::redis_backend::RedisStore;
use crate::traits::{CacheReport, CacheStats, EntitySource, KeyValueStore};

/// Keys removed per eviction pass.
pub const EVICTION_BATCH: usize = 10;

/// TTL used when a write does not name one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

const ACCESS_INDEX: &str = "__access";

/// Cache-aside layer over a [`KeyValueStore`].
pub struct EntityCache<S: KeyValueStore> {
    store: Arc<S>,
    prefix: String,
    index: String,
    max_size: u64,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    last_touch: AtomicU64,
}

impl EntityCache<RedisStore> {
    /// Connect to the configured Redis deployment.
    ///
    /// In cluster mode the prefix is wrapped in a hash tag so every key the
    /// cache writes lands in the same slot.
    pub async fn from_settings(settings: &CacheSettings) -> QuarryResult<Self> {
        validate_settings(settings)?;
        let store = RedisStore::connect(&settings.redis).await?;
        let prefix = if settings.redis.cluster {
            format!("{{{}}}", settings.key_prefix)
        } else {
            settings.key_prefix.clone()
        };
        Ok(Self::build(Arc::new(store), settings, prefix))
    }
}

impl<S: KeyValueStore> EntityCache<S> {
    pub fn new(store: Arc<S>, settings: &CacheSettings) -> QuarryResult<Self> {
        validate_settings(settings)?;
        Ok(Self::build(store, settings, settings.key_prefix.clone()))
    }

    fn build(store: Arc<S>, settings: &CacheSettings, prefix: String) -> Self {
        let default_ttl = if settings.ttl_seconds == 0 {
            DEFAULT_TTL
        } else {
            settings.ttl()
        };
        Self {
            store,
            index: format!("{}:{}", prefix, ACCESS_INDEX),
            prefix,
            max_size: settings.max_size,
            default_ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            last_touch: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Name of the sorted access index.
    pub fn index_key(&self) -> &str {
        &self.index
    }

    /// Store key for `(entity, id)`. String ids are used verbatim, anything
    /// else as its JSON text.
    pub fn key_for(&self, entity: &str, id: &Value) -> String {
        match id {
            Value::String(s) => format!("{}:{}:{}", self.prefix, entity, s),
            other => format!("{}:{}:{}", self.prefix, entity, other),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Look up one entry. Store and decode failures are logged and count as
    /// a miss.
    pub async fn get<T: DeserializeOwned>(&self, entity: &str, id: &Value) -> Option<T> {
        let key = self.key_for(entity, id);
        let result = self.store.get(&key).await;
        self.resolve(&key, result)
    }

    /// Batched [`get`](Self::get) in one pipelined read. Results line up
    /// with `ids`; a failing key resolves to `None` without affecting the
    /// rest.
    pub async fn mget<T: DeserializeOwned>(&self, entity: &str, ids: &[Value]) -> Vec<Option<T>> {
        let keys: Vec<String> = ids.iter().map(|id| self.key_for(entity, id)).collect();
        let results = self.store.mget(&keys).await;
        keys.iter()
            .zip(results)
            .map(|(key, result)| self.resolve(key, result))
            .collect()
    }

    fn resolve<T: DeserializeOwned>(
        &self,
        key: &str,
        result: QuarryResult<Option<String>>,
    ) -> Option<T> {
        let raw = match result {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(target: "quarry::cache", key, "Cache miss");
                return None;
            }
            Err(err) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(target: "quarry::cache", key, error = %err, "Cache read failed, treating as miss");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(target: "quarry::cache", key, "Cache hit");
                Some(value)
            }
            Err(err) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                warn!(target: "quarry::cache", key, error = %err, "Cached value does not decode, treating as miss");
                None
            }
        }
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Write an entry with `ttl` (default one hour), evicting the oldest
    /// batch first when the store is full.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        entity: &str,
        id: &Value,
        value: &T,
        ttl: Option<Duration>,
    ) -> QuarryResult<()> {
        let payload = serde_json::to_string(value)
            .map_err(|e| QuarryError::cache("Value cannot be serialized").with_source(e))?;

        let size = self.store.size(&self.index).await?;
        if size >= self.max_size {
            self.evict().await?;
        }

        let key = self.key_for(entity, id);
        let stamp = self.touch();
        self.store
            .put(
                &key,
                &payload,
                ttl.unwrap_or(self.default_ttl),
                &self.index,
                stamp as f64,
            )
            .await
    }

    /// Drop the oldest batch of live entries. Index members whose values
    /// already expired are pruned along the way and not counted.
    async fn evict(&self) -> QuarryResult<()> {
        let mut pruned = 0usize;
        loop {
            let victims = self.store.oldest(&self.index, EVICTION_BATCH).await?;
            if victims.is_empty() {
                return Ok(());
            }
            let removed = self.store.remove(&victims, &self.index).await?;
            pruned += victims.len() - (removed as usize).min(victims.len());
            if removed > 0 {
                self.evictions.fetch_add(removed, Ordering::Relaxed);
                info!(
                    target: "quarry::cache",
                    evicted = removed,
                    pruned,
                    "Evicted least recently written entries"
                );
                return Ok(());
            }
        }
    }

    /// Remove one entry and its index member. Returns whether a value
    /// existed.
    pub async fn del(&self, entity: &str, id: &Value) -> QuarryResult<bool> {
        let key = self.key_for(entity, id);
        let removed = self.store.remove(&[key], &self.index).await?;
        Ok(removed > 0)
    }

    /// Remove every entry of `entity`.
    ///
    /// Scan and delete are separate steps: an entry written in between can
    /// survive.
    pub async fn invalidate_model(&self, entity: &str) -> QuarryResult<u64> {
        // Glob metacharacters would widen the match past this entity.
        validate_identifier(entity)?;
        let pattern = format!("{}:{}:*", self.prefix, entity);
        let keys = self.store.scan(&pattern, &self.index).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.store.remove(&keys, &self.index).await?;
        info!(target: "quarry::cache", entity, removed, "Invalidated entity entries");
        Ok(removed)
    }

    // ========================================================================
    // WARMING
    // ========================================================================

    /// Load `ids` from `source` in one read and cache each returned row
    /// under its primary key. Returns the number of rows cached.
    pub async fn warm_cache<E>(&self, source: &E, entity: &str, ids: Vec<Value>) -> QuarryResult<usize>
    where
        E: EntitySource + ?Sized,
    {
        if ids.is_empty() {
            return Ok(0);
        }
        let pk = source.primary_key(entity)?;
        let mut op = Map::new();
        op.insert("in".to_string(), Value::Array(ids));
        let mut filter = Map::new();
        filter.insert(pk.clone(), Value::Object(op));

        let rows = source
            .load(entity, QueryOptions::new().with_filter(filter))
            .await?;
        self.populate(entity, &pk, rows).await
    }

    /// Cache every row `options` selects.
    pub async fn warm_cache_by_query<E>(
        &self,
        source: &E,
        entity: &str,
        options: QueryOptions,
    ) -> QuarryResult<usize>
    where
        E: EntitySource + ?Sized,
    {
        let pk = source.primary_key(entity)?;
        let rows = source.load(entity, options).await?;
        self.populate(entity, &pk, rows).await
    }

    async fn populate(&self, entity: &str, pk: &str, rows: Vec<Value>) -> QuarryResult<usize> {
        let mut cached = 0;
        for row in rows {
            let Some(id) = row.get(pk).filter(|id| !id.is_null()).cloned() else {
                warn!(target: "quarry::cache", entity, primary_key = pk, "Row without primary key skipped");
                continue;
            };
            self.set(entity, &id, &row, None).await?;
            cached += 1;
        }
        debug!(target: "quarry::cache", entity, cached, "Cache warmed");
        Ok(cached)
    }

    // ========================================================================
    // STATS
    // ========================================================================

    /// Counters since this cache was built, plus the store's current size.
    pub async fn stats(&self) -> QuarryResult<CacheStats> {
        let size = self.store.size(&self.index).await?;
        Ok(CacheStats::new(
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            size,
        ))
    }

    pub async fn cache_stats(&self) -> QuarryResult<CacheReport> {
        let stats = self.stats().await?;
        let utilization = if self.max_size == 0 {
            0.0
        } else {
            stats.size as f64 / self.max_size as f64
        };
        Ok(CacheReport {
            stats,
            max_size: self.max_size,
            default_ttl_secs: self.default_ttl.as_secs(),
            utilization,
        })
    }

    /// Milliseconds since the epoch, bumped past the previous stamp so two
    /// writes in the same millisecond still order.
    fn touch(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let mut prev = self.last_touch.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_touch.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn validate_settings(settings: &CacheSettings) -> QuarryResult<()> {
    if settings.max_size == 0 {
        return Err(QuarryError::config("cache.maxSize must be greater than 0"));
    }
    if settings.key_prefix.trim().is_empty() {
        return Err(QuarryError::config("cache.keyPrefix must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryStore;
    use quarry_core::ErrorKind;
    use serde_json::json;

    fn cache(max_size: u64) -> (Arc<MemoryStore>, EntityCache<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let settings = CacheSettings {
            max_size,
            key_prefix: "t".into(),
            ..Default::default()
        };
        let cache = EntityCache::new(Arc::clone(&store), &settings).unwrap();
        (store, cache)
    }

    #[test]
    fn test_key_layout() {
        let (_, cache) = cache(10);
        assert_eq!(cache.key_for("user", &json!(1)), "t:user:1");
        assert_eq!(cache.key_for("user", &json!("abc")), "t:user:abc");
        assert_eq!(cache.index_key(), "t:__access");
    }

    #[test]
    fn test_rejects_bad_settings() {
        let store = Arc::new(MemoryStore::new());
        let settings = CacheSettings {
            max_size: 0,
            ..Default::default()
        };
        let err = EntityCache::new(store, &settings).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_touch_is_strictly_increasing() {
        let (_, cache) = cache(10);
        let stamps: Vec<u64> = (0..100).map(|_| cache.touch()).collect();
        assert!(stamps.windows(2).all(|w| w[1] > w[0]));
    }

    #[tokio::test]
    async fn test_get_counts_every_lookup() {
        let (_, cache) = cache(10);
        cache.set("user", &json!(1), &json!({ "id": 1 }), None).await.unwrap();

        let hit: Option<Value> = cache.get("user", &json!(1)).await;
        let miss: Option<Value> = cache.get("user", &json!(2)).await;
        assert_eq!(hit, Some(json!({ "id": 1 })));
        assert_eq!(miss, None);

        let stats = cache.stats().await.unwrap();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_a_miss() {
        let (_, cache) = cache(10);
        cache.set("user", &json!(1), &json!("not a number"), None).await.unwrap();
        let value: Option<u64> = cache.get("user", &json!(1)).await;
        assert_eq!(value, None);
        assert_eq!(cache.stats().await.unwrap().misses, 1);
    }

    #[tokio::test]
    async fn test_set_uses_default_ttl_and_scores_index() {
        let (store, cache) = cache(10);
        cache.set("user", &json!(1), &json!({}), None).await.unwrap();
        cache
            .set("user", &json!(2), &json!({}), Some(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(store.ttl_of("t:user:1"), Some(DEFAULT_TTL));
        assert_eq!(store.ttl_of("t:user:2"), Some(Duration::from_secs(5)));
        assert_eq!(store.index_members("t:__access"), vec!["t:user:1", "t:user:2"]);
    }

    #[tokio::test]
    async fn test_write_failure_surfaces() {
        let (store, cache) = cache(10);
        store.fail_writes(true);
        let err = cache.set("user", &json!(1), &json!({}), None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cache);
    }

    #[tokio::test]
    async fn test_del_removes_value_and_index_member() {
        let (store, cache) = cache(10);
        cache.set("user", &json!(1), &json!({}), None).await.unwrap();
        assert!(cache.del("user", &json!(1)).await.unwrap());
        assert!(!cache.del("user", &json!(1)).await.unwrap());
        assert!(store.index_members("t:__access").is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_model_only_touches_entity() {
        let (store, cache) = cache(100);
        for id in 1..=3 {
            cache.set("user", &json!(id), &json!({ "id": id }), None).await.unwrap();
        }
        cache.set("post", &json!(1), &json!({ "id": 1 }), None).await.unwrap();

        assert_eq!(cache.invalidate_model("user").await.unwrap(), 3);
        assert_eq!(store.index_members("t:__access"), vec!["t:post:1"]);
        assert_eq!(cache.invalidate_model("user").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_model_rejects_glob_entity() {
        let (store, cache) = cache(100);
        cache.set("user", &json!(1), &json!({}), None).await.unwrap();
        cache.set("post", &json!(1), &json!({}), None).await.unwrap();

        for entity in ["*", "us?r", "[up]*"] {
            let err = cache.invalidate_model(entity).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Security);
        }
        assert_eq!(store.index_members("t:__access").len(), 2);
    }

    #[tokio::test]
    async fn test_report_utilization() {
        let (_, cache) = cache(4);
        cache.set("user", &json!(1), &json!({}), None).await.unwrap();
        let report = cache.cache_stats().await.unwrap();
        assert_eq!(report.stats.size, 1);
        assert_eq!(report.utilization, 0.25);
        assert_eq!(report.default_ttl_secs, 3600);
    }
}
