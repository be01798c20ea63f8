//! Property and scenario tests for the entity cache.
//!
//! Eviction, warming and batched reads against the in-memory store and the
//! in-memory connection.

use std::sync::Arc;

use proptest::prelude::*;
use quarry_cache::{EntityCache, MemoryStore, DEFAULT_TTL, EVICTION_BATCH};
use quarry_core::{AdapterConfig, CacheSettings, EntityDefinition, QueryOptions};
use quarry_db::{Adapter, MemoryConnection};
use serde_json::{json, Map, Value};
use tokio::runtime::Runtime;

// ============================================================================
// HELPERS
// ============================================================================

fn test_runtime() -> Result<Runtime, TestCaseError> {
    Runtime::new().map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

fn cache_with(max_size: u64) -> (Arc<MemoryStore>, EntityCache<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let settings = CacheSettings {
        max_size,
        ..Default::default()
    };
    let cache = EntityCache::new(Arc::clone(&store), &settings).expect("valid settings");
    (store, cache)
}

fn user_adapter() -> (MemoryConnection, Adapter<MemoryConnection>) {
    let replica = MemoryConnection::new("memory://replica-0")
        .with_entity(EntityDefinition::new("user").with_table("users"))
        .with_rows(
            "users",
            vec![
                json!({ "id": 1, "name": "Ada" }),
                json!({ "id": 2, "name": "Brian" }),
                json!({ "id": 3, "name": "Cleo" }),
            ],
        );
    let primary = MemoryConnection::new("memory://primary")
        .with_entity(EntityDefinition::new("user").with_table("users"));
    let config = AdapterConfig::new().with_url("postgres://localhost/app");
    let adapter = Adapter::with_connections(config, primary, vec![replica.clone()])
        .expect("valid config");
    (replica, adapter)
}

// ============================================================================
// EVICTION
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Writing the (N+1)th distinct key into a cache of size N removes the
    /// oldest batch, values and index members both.
    #[test]
    fn prop_overflow_evicts_oldest_batch(max_size in 1u64..40) {
        let rt = test_runtime()?;
        rt.block_on(async {
            let (store, cache) = cache_with(max_size);
            for id in 0..max_size {
                cache.set("user", &json!(id), &json!({ "id": id }), None).await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
            }
            let before = store.index_members(cache.index_key());
            prop_assert_eq!(before.len() as u64, max_size);

            cache.set("user", &json!(max_size), &json!({ "id": max_size }), None).await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            let expected_evicted = EVICTION_BATCH.min(max_size as usize);
            let after = store.index_members(cache.index_key());
            for key in &before[..expected_evicted] {
                prop_assert!(store.raw(key).is_none());
                prop_assert!(!after.contains(key));
            }
            for key in &before[expected_evicted..] {
                prop_assert!(store.raw(key).is_some());
            }
            prop_assert!(after.contains(&cache.key_for("user", &json!(max_size))));

            let stats = cache.stats().await.map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(stats.evictions, expected_evicted as u64);
            prop_assert_eq!(stats.size, max_size - expected_evicted as u64 + 1);
            Ok(())
        })?;
    }
}

#[tokio::test]
async fn test_no_eviction_below_max_size() {
    let (store, cache) = cache_with(20);
    for id in 0..20 {
        cache.set("user", &json!(id), &json!(id), None).await.unwrap();
    }
    assert_eq!(store.remove_calls(), 0);
    assert_eq!(cache.stats().await.unwrap().evictions, 0);
}

#[tokio::test]
async fn test_rewriting_a_key_refreshes_its_rank() {
    let (store, cache) = cache_with(12);
    for id in 0..11 {
        cache.set("user", &json!(id), &json!(id), None).await.unwrap();
    }
    // Key 0 moves to the back of the access order.
    cache.set("user", &json!(0), &json!("fresh"), None).await.unwrap();
    cache.set("user", &json!(11), &json!(11), None).await.unwrap();
    assert_eq!(store.remove_calls(), 0);

    cache.set("user", &json!(100), &json!(100), None).await.unwrap();
    assert_eq!(store.raw("quarry:user:0").as_deref(), Some("\"fresh\""));
    assert!(store.raw("quarry:user:11").is_some());
    assert!(store.raw("quarry:user:100").is_some());
    for id in 1..=10 {
        assert!(store.raw(&format!("quarry:user:{}", id)).is_none());
    }
}

// ============================================================================
// WARMING
// ============================================================================

#[tokio::test]
async fn test_warm_cache_reads_once_and_writes_each_row() {
    let (replica, adapter) = user_adapter();
    let (store, cache) = cache_with(100);

    let warmed = cache
        .warm_cache(&adapter, "user", vec![json!(1), json!(2)])
        .await
        .unwrap();

    assert_eq!(warmed, 2);
    assert_eq!(replica.query_calls(), 1);
    assert_eq!(store.put_calls(), 2);
    assert_eq!(store.ttl_of("quarry:user:1"), Some(DEFAULT_TTL));
    assert_eq!(store.ttl_of("quarry:user:2"), Some(DEFAULT_TTL));
    assert!(store.raw("quarry:user:3").is_none());

    let user: Option<Value> = cache.get("user", &json!(2)).await;
    assert_eq!(user.unwrap()["name"], "Brian");
}

#[tokio::test]
async fn test_warm_cache_with_no_ids_skips_the_read() {
    let (replica, adapter) = user_adapter();
    let (_, cache) = cache_with(100);
    assert_eq!(cache.warm_cache(&adapter, "user", Vec::new()).await.unwrap(), 0);
    assert_eq!(replica.query_calls(), 0);
}

#[tokio::test]
async fn test_warm_cache_by_query() {
    let (replica, adapter) = user_adapter();
    let (store, cache) = cache_with(100);

    let mut filter = Map::new();
    filter.insert("name".into(), json!({ "startsWith": "C" }));
    let warmed = cache
        .warm_cache_by_query(&adapter, "user", QueryOptions::new().with_filter(filter))
        .await
        .unwrap();

    assert_eq!(warmed, 1);
    assert_eq!(replica.query_calls(), 1);
    assert!(store.raw("quarry:user:3").is_some());
}

#[tokio::test]
async fn test_warm_cache_read_failure_propagates() {
    let (replica, adapter) = user_adapter();
    let (store, cache) = cache_with(100);
    replica.fail_entity_queries(true);

    assert!(cache.warm_cache(&adapter, "user", vec![json!(1)]).await.is_err());
    assert_eq!(store.put_calls(), 0);
}

#[tokio::test]
async fn test_warming_is_subject_to_eviction() {
    let (_, adapter) = user_adapter();
    let (store, cache) = cache_with(2);
    cache.set("post", &json!(1), &json!({}), None).await.unwrap();
    cache.set("post", &json!(2), &json!({}), None).await.unwrap();

    cache
        .warm_cache(&adapter, "user", vec![json!(1), json!(2), json!(3)])
        .await
        .unwrap();

    assert!(store.raw("quarry:post:1").is_none());
    assert!(store.raw("quarry:post:2").is_none());
    assert!(cache.stats().await.unwrap().evictions >= 2);
}

// ============================================================================
// BATCHED READS AND STATS
// ============================================================================

#[tokio::test]
async fn test_mget_degrades_per_key() {
    let (store, cache) = cache_with(100);
    for id in 1..=3 {
        cache.set("user", &json!(id), &json!({ "id": id }), None).await.unwrap();
    }
    store.fail_reads_for("quarry:user:2");

    let users: Vec<Option<Value>> = cache
        .mget("user", &[json!(1), json!(2), json!(3), json!(4)])
        .await;

    assert_eq!(users[0], Some(json!({ "id": 1 })));
    assert_eq!(users[1], None);
    assert_eq!(users[2], Some(json!({ "id": 3 })));
    assert_eq!(users[3], None);

    let stats = cache.stats().await.unwrap();
    assert_eq!((stats.hits, stats.misses), (2, 2));
}

#[tokio::test]
async fn test_stats_before_any_lookup() {
    let (_, cache) = cache_with(100);
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.hit_rate, 0.0);
    assert_eq!(stats.miss_rate, 0.0);
    assert_eq!(stats.eviction_rate, 0.0);

    let json = serde_json::to_value(cache.cache_stats().await.unwrap()).unwrap();
    assert_eq!(json["max_size"], 100);
    assert_eq!(json["hits"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_expired_entries_are_misses() {
    let (_, cache) = cache_with(100);
    cache
        .set("user", &json!(1), &json!({}), Some(std::time::Duration::from_secs(2)))
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

    let value: Option<Value> = cache.get("user", &json!(1)).await;
    assert_eq!(value, None);
    assert_eq!(cache.stats().await.unwrap().size, 0);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_skips_expired_index_members() {
    let (store, cache) = cache_with(10);
    for id in 0..10 {
        cache
            .set("user", &json!(id), &json!(id), Some(std::time::Duration::from_secs(1)))
            .await
            .unwrap();
    }
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    for id in 100..111 {
        cache.set("user", &json!(id), &json!(id), None).await.unwrap();
    }

    // The expired members were pruned; the ten oldest live entries went.
    let stats = cache.stats().await.unwrap();
    assert_eq!(stats.evictions, 10);
    assert_eq!(stats.size, 1);
    for id in 100..110 {
        assert!(store.raw(&format!("quarry:user:{}", id)).is_none());
    }
    assert_eq!(store.index_members(cache.index_key()), vec!["quarry:user:110"]);
}
