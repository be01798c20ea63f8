//! Quarry Cache - cache-aside entity cache
//!
//! Entries live in a [`KeyValueStore`] (Redis in production, [`MemoryStore`]
//! in tests) under `{prefix}:{entity}:{id}`, with a sorted access index used
//! to evict the oldest batch when the store fills up.
//!
//! # Example
//!
//! ```ignore
//! use quarry_cache::{CachedReader, EntityCache};
//!
//! let cache = Arc::new(EntityCache::from_settings(&config.cache).await?);
//! cache.warm_cache(&*adapter, "user", vec![json!(1), json!(2)]).await?;
//!
//! let reader = CachedReader::new(adapter, cache);
//! let user = reader.get_or_load("user", &json!(1)).await?;
//! ```

pub mod entity_cache;
pub mod memory_backend;
pub mod read_through;
pub mod redis_backend;
mod source;
pub mod traits;

pub use entity_cache::{EntityCache, DEFAULT_TTL, EVICTION_BATCH};
pub use memory_backend::MemoryStore;
pub use read_through::CachedReader;
pub use redis_backend::{redis_error, RedisStore};
pub use traits::{CacheReport, CacheStats, EntitySource, KeyValueStore};
