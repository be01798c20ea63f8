//! Redis-backed key-value store.
//!
//! Single-node deployments go through a [`ConnectionManager`], which
//! reconnects on its own. Cluster deployments use the async cluster
//! client; the entity cache wraps its key prefix in a hash tag in that mode
//! so value keys and the access index share one slot and the pipelines
//! below stay single-node.

use std::time::Duration;

use async_trait::async_trait;
use quarry_core::{QuarryError, QuarryResult, RedisSettings};
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{AsyncCommands, Cmd, Pipeline, RedisError, RedisFuture};
use tracing::{debug, error, warn};

use crate::traits::KeyValueStore;

/// Keys requested per `SCAN` / `ZSCAN` round trip.
const SCAN_BATCH: usize = 100;

#[derive(Clone)]
enum RedisConnection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for RedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, redis::Value> {
        match self {
            RedisConnection::Single(conn) => conn.req_packed_command(cmd),
            RedisConnection::Cluster(conn) => conn.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<redis::Value>> {
        match self {
            RedisConnection::Single(conn) => conn.req_packed_commands(cmd, offset, count),
            RedisConnection::Cluster(conn) => conn.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            RedisConnection::Single(conn) => conn.get_db(),
            RedisConnection::Cluster(conn) => conn.get_db(),
        }
    }
}

/// [`KeyValueStore`] over Redis.
#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConnection,
}

impl RedisStore {
    /// Open a connection described by `settings`.
    pub async fn connect(settings: &RedisSettings) -> QuarryResult<Self> {
        let conn = if settings.cluster {
            if settings.nodes.is_empty() {
                return Err(QuarryError::config(
                    "cache.redis.cluster requires at least one node",
                ));
            }
            let client = ClusterClient::new(settings.nodes.clone()).map_err(redis_error)?;
            let conn = client.get_async_connection().await.map_err(redis_error)?;
            debug!(target: "quarry::cache", nodes = settings.nodes.len(), "Connected to Redis cluster");
            RedisConnection::Cluster(conn)
        } else {
            let url = settings
                .url
                .as_deref()
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| QuarryError::config("cache.redis.url is required"))?;
            let client = redis::Client::open(url).map_err(redis_error)?;
            let conn = ConnectionManager::new(client).await.map_err(redis_error)?;
            debug!(target: "quarry::cache", "Connected to Redis");
            RedisConnection::Single(conn)
        };
        Ok(Self { conn })
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self.conn, RedisConnection::Cluster(_))
    }

    fn conn(&self) -> RedisConnection {
        self.conn.clone()
    }

    async fn scan_keys(&self, pattern: &str, index: &str) -> QuarryResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            keys.extend(batch.into_iter().filter(|k| k != index));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    /// Cluster `SCAN` only sees one node, so walk the access index instead.
    async fn scan_index(&self, pattern: &str, index: &str) -> QuarryResult<Vec<String>> {
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, flat): (u64, Vec<String>) = redis::cmd("ZSCAN")
                .arg(index)
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(redis_error)?;
            // Replies alternate member, score.
            keys.extend(flat.into_iter().step_by(2));
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> QuarryResult<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(redis_error)
    }

    async fn mget(&self, keys: &[String]) -> Vec<QuarryResult<Option<String>>> {
        if keys.is_empty() {
            return Vec::new();
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.get(key);
        }
        let batch: Result<Vec<Option<String>>, RedisError> = pipe.query_async(&mut conn).await;
        match batch {
            Ok(values) => values.into_iter().map(Ok).collect(),
            Err(err) => {
                // A pipeline fails as a whole; fall back to single reads so
                // the failure stays with the key that caused it.
                warn!(target: "quarry::cache", error = %err, "Pipelined read failed, retrying per key");
                let mut results = Vec::with_capacity(keys.len());
                for key in keys {
                    results.push(self.get(key).await);
                }
                results
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        index: &str,
        score: f64,
    ) -> QuarryResult<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set_ex(key, value, ttl.as_secs().max(1))
            .ignore()
            .zadd(index, key, score)
            .ignore();
        let () = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn remove(&self, keys: &[String], index: &str) -> QuarryResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic().del(keys).zrem(index, keys).ignore();
        let (deleted,): (u64,) = pipe.query_async(&mut conn).await.map_err(redis_error)?;
        Ok(deleted)
    }

    async fn oldest(&self, index: &str, n: usize) -> QuarryResult<Vec<String>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        conn.zrange(index, 0, n as isize - 1)
            .await
            .map_err(redis_error)
    }

    async fn scan(&self, pattern: &str, index: &str) -> QuarryResult<Vec<String>> {
        if self.is_cluster() {
            self.scan_index(pattern, index).await
        } else {
            self.scan_keys(pattern, index).await
        }
    }

    async fn size(&self, index: &str) -> QuarryResult<u64> {
        let mut conn = self.conn();
        let total: u64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        let has_index: bool = conn.exists(index).await.map_err(redis_error)?;
        Ok(total.saturating_sub(u64::from(has_index)))
    }
}

/// Map a Redis error to a cache error, logging the full error.
pub fn redis_error(err: RedisError) -> QuarryError {
    error!(target: "quarry::cache", error = ?err, "Redis error");
    let message = if err.is_timeout() {
        "Cache store timed out"
    } else if err.is_connection_refusal() || err.is_connection_dropped() {
        "Cache store unreachable"
    } else {
        "Cache store operation failed"
    };
    QuarryError::cache(message).with_source(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::ErrorKind;

    #[tokio::test]
    async fn test_missing_url_is_config_error() {
        let err = RedisStore::connect(&RedisSettings::default()).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = RedisStore::connect(&RedisSettings {
            cluster: true,
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_malformed_url_is_cache_error() {
        let err = RedisStore::connect(&RedisSettings {
            url: Some("definitely not a url".into()),
            ..Default::default()
        })
        .await
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Cache);
        assert!(err.cause().is_some());
    }
}
