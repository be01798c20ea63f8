//! Store and source traits, plus cache statistics.

use std::time::Duration;

use async_trait::async_trait;
use quarry_core::{QuarryResult, QueryOptions};
use serde::Serialize;
use serde_json::Value;

/// Key-value store backing the entity cache.
///
/// Values are serialized strings. Every value written through [`put`]
/// also gets a member in a sorted access index scored by its last-touch
/// stamp; [`remove`] drops both in one round trip.
///
/// [`put`]: KeyValueStore::put
/// [`remove`]: KeyValueStore::remove
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> QuarryResult<Option<String>>;

    /// Batched read. Each key gets its own result so one bad key does not
    /// fail the batch.
    async fn mget(&self, keys: &[String]) -> Vec<QuarryResult<Option<String>>>;

    /// Write `value` with `ttl` and set `key`'s score in `index`, pipelined.
    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        index: &str,
        score: f64,
    ) -> QuarryResult<()>;

    /// Delete `keys` and their `index` members, pipelined. Returns the
    /// number of values that existed.
    async fn remove(&self, keys: &[String], index: &str) -> QuarryResult<u64>;

    /// Up to `n` index members with the lowest scores, oldest first.
    async fn oldest(&self, index: &str, n: usize) -> QuarryResult<Vec<String>>;

    /// Value keys matching a glob `pattern`.
    async fn scan(&self, pattern: &str, index: &str) -> QuarryResult<Vec<String>>;

    /// Number of value entries in the store, excluding `index` itself.
    async fn size(&self, index: &str) -> QuarryResult<u64>;
}

/// Where cache warming reads rows from.
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Column that identifies a row of `entity`.
    fn primary_key(&self, entity: &str) -> QuarryResult<String>;

    /// Rows of `entity` matching `options`, in one read.
    async fn load(&self, entity: &str, options: QueryOptions) -> QuarryResult<Vec<Value>>;
}

/// Point-in-time cache statistics.
///
/// Counters are per cache instance and only reset when it is dropped.
/// Rates divide by total lookups (hits + misses) and are 0.0 before the
/// first lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Entries in the store right now.
    pub size: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub eviction_rate: f64,
}

impl CacheStats {
    pub fn new(hits: u64, misses: u64, evictions: u64, size: u64) -> Self {
        let total = hits + misses;
        let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        Self {
            hits,
            misses,
            evictions,
            size,
            hit_rate: rate(hits),
            miss_rate: rate(misses),
            eviction_rate: rate(evictions),
        }
    }

    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}

/// [`CacheStats`] plus the limits the cache runs with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheReport {
    #[serde(flatten)]
    pub stats: CacheStats,
    pub max_size: u64,
    pub default_ttl_secs: u64,
    /// `size / max_size`.
    pub utilization: f64,
}
