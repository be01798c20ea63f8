//! Connection registry: one write connection, a rotating read pool.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quarry_core::{AdapterConfig, QuarryError, QuarryResult};
use tracing::{error, info, warn};

use crate::connection::Connection;

/// Statement used for pool round-trip checks.
pub const PING_SQL: &str = "SELECT 1";

/// Owns the write connection and the read pool.
///
/// The read pool is never empty: without replicas it holds the write
/// connection itself.
pub struct ConnectionRegistry<C: Connection> {
    write: Arc<C>,
    reads: Vec<Arc<C>>,
    /// True when `reads` holds dedicated replicas rather than the primary.
    has_replicas: bool,
    cursor: AtomicUsize,
    connected: AtomicBool,
}

impl<C: Connection> ConnectionRegistry<C> {
    /// Build a registry from already-constructed connections.
    pub fn new(write: C, replicas: Vec<C>) -> Self {
        let write = Arc::new(write);
        let has_replicas = !replicas.is_empty();
        let reads = if has_replicas {
            replicas.into_iter().map(Arc::new).collect()
        } else {
            vec![Arc::clone(&write)]
        };
        Self {
            write,
            reads,
            has_replicas,
            cursor: AtomicUsize::new(0),
            connected: AtomicBool::new(false),
        }
    }

    /// Build a registry from config, creating one connection per URL.
    ///
    /// The write connection uses the primary URL. When replication is
    /// enabled every read URL gets its own connection built by the same
    /// factory, so replicas share the base client settings and differ only
    /// in endpoint.
    pub fn from_config<F>(config: &AdapterConfig, factory: F) -> QuarryResult<Self>
    where
        F: Fn(&str) -> QuarryResult<C>,
    {
        let write = factory(&config.resolved_url()?)?;
        let replicas = config
            .replica_urls()
            .iter()
            .map(|url| factory(url))
            .collect::<QuarryResult<Vec<_>>>()?;
        Ok(Self::new(write, replicas))
    }

    /// Next read connection in round-robin order.
    pub fn select_for_read(&self) -> Arc<C> {
        let len = self.reads.len();
        let index = self
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |i| Some((i + 1) % len))
            .unwrap_or(0);
        Arc::clone(&self.reads[index % len])
    }

    /// The single write connection.
    pub fn select_for_write(&self) -> Arc<C> {
        Arc::clone(&self.write)
    }

    /// Number of connections in the read pool.
    pub fn read_pool_size(&self) -> usize {
        self.reads.len()
    }

    pub fn has_replicas(&self) -> bool {
        self.has_replicas
    }

    /// Dedicated replicas (empty when reads fall back to the primary).
    pub fn replicas(&self) -> &[Arc<C>] {
        if self.has_replicas {
            &self.reads
        } else {
            &[]
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Establish the write connection, retrying up to `retries` extra times.
    ///
    /// Replicas are connected afterwards on a best-effort basis; a replica
    /// that fails here will surface its error when it is used for a read.
    pub async fn connect(&self, retries: u32, retry_delay: Duration) -> QuarryResult<()> {
        let mut remaining = retries;
        let mut attempt: u32 = 1;
        loop {
            match self.write.connect().await {
                Ok(()) => break,
                Err(err) if remaining == 0 => {
                    error!(
                        target: "quarry::pool",
                        endpoint = self.write.endpoint(),
                        attempts = attempt,
                        error = %err,
                        "Failed to connect to primary"
                    );
                    return Err(QuarryError::connection(format!(
                        "Failed to connect to {} after {} attempt(s)",
                        self.write.endpoint(),
                        attempt
                    ))
                    .with_source(err));
                }
                Err(err) => {
                    warn!(
                        target: "quarry::pool",
                        endpoint = self.write.endpoint(),
                        attempt,
                        remaining,
                        error = %err,
                        "Connection attempt failed, retrying"
                    );
                    remaining -= 1;
                    attempt += 1;
                    if !retry_delay.is_zero() {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }

        for replica in self.replicas() {
            if let Err(err) = replica.connect().await {
                warn!(
                    target: "quarry::pool",
                    endpoint = replica.endpoint(),
                    error = %err,
                    "Replica did not connect"
                );
            }
        }

        self.connected.store(true, Ordering::Release);
        info!(
            target: "quarry::pool",
            endpoint = self.write.endpoint(),
            replicas = self.replicas().len(),
            "Connected"
        );
        Ok(())
    }

    /// Tear down the write connection and close replicas.
    pub async fn disconnect(&self) -> QuarryResult<()> {
        let result = self.write.disconnect().await;
        for replica in self.replicas() {
            if let Err(err) = replica.disconnect().await {
                warn!(
                    target: "quarry::pool",
                    endpoint = replica.endpoint(),
                    error = %err,
                    "Replica did not disconnect cleanly"
                );
            }
        }
        self.connected.store(false, Ordering::Release);
        info!(target: "quarry::pool", endpoint = self.write.endpoint(), "Disconnected");
        result
    }

    /// Round-trip `SELECT 1` against the primary. Never fails; errors are
    /// logged and reported as `false`.
    pub async fn check_connection_pool(&self) -> bool {
        match self.write.query_raw(PING_SQL, &[]).await {
            Ok(_) => true,
            Err(err) => {
                error!(
                    target: "quarry::pool",
                    endpoint = self.write.endpoint(),
                    error = %err,
                    "Connection pool check failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use proptest::prelude::*;

    fn registry(replicas: usize) -> ConnectionRegistry<MemoryConnection> {
        let write = MemoryConnection::new("memory://primary");
        let reads = (0..replicas)
            .map(|i| MemoryConnection::new(format!("memory://replica-{}", i)))
            .collect();
        ConnectionRegistry::new(write, reads)
    }

    #[test]
    fn test_no_replicas_reads_from_primary() {
        let reg = registry(0);
        assert_eq!(reg.read_pool_size(), 1);
        assert!(!reg.has_replicas());
        assert!(reg.replicas().is_empty());
        assert!(Arc::ptr_eq(&reg.select_for_read(), &reg.select_for_write()));
    }

    #[test]
    fn test_write_is_always_primary() {
        let reg = registry(3);
        for _ in 0..5 {
            assert_eq!(reg.select_for_write().endpoint(), "memory://primary");
        }
    }

    #[test]
    fn test_round_robin_wraps() {
        let reg = registry(3);
        let seen: Vec<String> = (0..7)
            .map(|_| reg.select_for_read().endpoint().to_string())
            .collect();
        assert_eq!(
            seen,
            vec![
                "memory://replica-0",
                "memory://replica-1",
                "memory://replica-2",
                "memory://replica-0",
                "memory://replica-1",
                "memory://replica-2",
                "memory://replica-0",
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_retries_then_succeeds() {
        let reg = registry(0);
        reg.select_for_write().fail_next_connects(1);

        reg.connect(1, Duration::ZERO).await.unwrap();
        assert!(reg.is_connected());
        assert_eq!(reg.select_for_write().connect_calls(), 2);
    }

    #[tokio::test]
    async fn test_connect_zero_retries_fails_fast() {
        let reg = registry(0);
        reg.select_for_write().fail_next_connects(1);

        let err = reg.connect(0, Duration::ZERO).await.unwrap_err();
        assert_eq!(err.kind(), quarry_core::ErrorKind::Connection);
        assert!(err.cause().is_some());
        assert_eq!(reg.select_for_write().connect_calls(), 1);
        assert!(!reg.is_connected());
    }

    #[tokio::test]
    async fn test_connect_also_connects_replicas() {
        let reg = registry(2);
        reg.connect(0, Duration::ZERO).await.unwrap();
        for replica in reg.replicas() {
            assert_eq!(replica.connect_calls(), 1);
        }
        reg.disconnect().await.unwrap();
        assert!(!reg.is_connected());
    }

    #[tokio::test]
    async fn test_check_connection_pool_swallows_failure() {
        let reg = registry(0);
        assert!(reg.check_connection_pool().await);

        reg.select_for_write().fail_raw_queries(true);
        assert!(!reg.check_connection_pool().await);
    }

    proptest! {
        #[test]
        fn prop_rotation_visits_every_replica_once(n in 1usize..12, warmup in 0usize..20) {
            let reg = registry(n);
            for _ in 0..warmup {
                reg.select_for_read();
            }
            let mut seen: Vec<String> = (0..n)
                .map(|_| reg.select_for_read().endpoint().to_string())
                .collect();
            seen.sort();
            seen.dedup();
            prop_assert_eq!(seen.len(), n);
        }

        #[test]
        fn prop_consecutive_reads_differ(n in 2usize..12, calls in 2usize..40) {
            let reg = registry(n);
            let mut previous = reg.select_for_read();
            for _ in 1..calls {
                let next = reg.select_for_read();
                prop_assert!(!Arc::ptr_eq(&previous, &next));
                previous = next;
            }
        }
    }
}
