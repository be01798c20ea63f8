//! The adapter façade.
//!
//! [`Adapter`] is the single entry point consumers use: it owns the
//! connection registry, routes reads across replicas and writes to the
//! primary, and hands each request to a [`QueryBuilder`].

use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use quarry_core::{
    overall_status, AdapterConfig, HealthCheck, HealthStatus, QuarryResult, QueryOptions,
    QueryOutput,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::builder::QueryBuilder;
use crate::connection::{Connection, TransactionFuture, TransactionHandle};
use crate::postgres::PgConnection;
use crate::registry::{ConnectionRegistry, PING_SQL};

/// Pause between connection attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Replica-aware data-access façade.
pub struct Adapter<C: Connection = PgConnection> {
    config: AdapterConfig,
    registry: ConnectionRegistry<C>,
    retry_delay: Duration,
}

impl Adapter<PgConnection> {
    /// Validate `config` and build one PostgreSQL pool for the primary and
    /// one per replica URL. Nothing is opened until [`connect`](Self::connect).
    pub fn from_config(config: AdapterConfig) -> QuarryResult<Self> {
        config.validate()?;
        let registry = ConnectionRegistry::from_config(&config, |url| {
            PgConnection::new(url, &config.pool, &config.entities)
        })?;
        info!(
            target: "quarry::pool",
            replicas = registry.replicas().len(),
            soft_delete = config.soft_delete,
            "Adapter configured"
        );
        Ok(Self {
            config,
            registry,
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }
}

impl<C: Connection> Adapter<C> {
    /// Build an adapter over already-constructed connections. The config
    /// is validated first and supplies routing-independent settings.
    pub fn with_connections(config: AdapterConfig, write: C, replicas: Vec<C>) -> QuarryResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: ConnectionRegistry::new(write, replicas),
            retry_delay: DEFAULT_RETRY_DELAY,
        })
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry<C> {
        &self.registry
    }

    /// Connect using the configured retry budget.
    pub async fn connect(&self) -> QuarryResult<()> {
        self.connect_with_retries(self.config.connect_retries).await
    }

    /// Connect, retrying up to `retries` times after the first failure.
    pub async fn connect_with_retries(&self, retries: u32) -> QuarryResult<()> {
        self.registry.connect(retries, self.retry_delay).await
    }

    pub async fn disconnect(&self) -> QuarryResult<()> {
        self.registry.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.registry.is_connected()
    }

    /// Builder over the next read connection.
    pub fn from(&self, entity: &str) -> QueryBuilder<C> {
        QueryBuilder::new(self.registry.select_for_read(), entity)
            .timeout(self.config.query_timeout())
    }

    /// Builder over the write connection.
    pub fn from_primary(&self, entity: &str) -> QueryBuilder<C> {
        QueryBuilder::new(self.registry.select_for_write(), entity)
            .timeout(self.config.query_timeout())
    }

    /// Run a structured query.
    ///
    /// `options.write` routes to the primary; otherwise the next replica is
    /// used. With soft deletes enabled, rows whose deletion field is set are
    /// excluded unless the filter already mentions that field.
    pub async fn query(&self, entity: &str, options: QueryOptions) -> QuarryResult<QueryOutput> {
        let connection = if options.write {
            self.registry.select_for_write()
        } else {
            self.registry.select_for_read()
        };

        let mut builder = QueryBuilder::with_options(connection.clone(), entity, options)
            .timeout(self.config.query_timeout());

        if self.config.soft_delete {
            let store = connection.entity(entity)?;
            let field = store.soft_delete_field().to_string();
            if !builder.descriptor().filter.contains_key(&field) {
                let mut live = Map::new();
                live.insert(field, Value::Null);
                builder = builder.filter_complex(live);
            }
        }

        builder.execute().await
    }

    /// Run a read-only raw statement on a replica with the configured
    /// deadline. See [`QueryBuilder::execute_raw`] for what is rejected.
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> QuarryResult<Vec<Value>> {
        let builder = QueryBuilder::new(self.registry.select_for_read(), "")
            .timeout(self.config.query_timeout());
        builder.execute_raw(sql, params).await
    }

    /// [`execute`](Self::execute) with rows decoded into `T`.
    pub async fn execute_as<T: DeserializeOwned>(&self, sql: &str, params: Vec<Value>) -> QuarryResult<Vec<T>> {
        QueryOutput::Many(self.execute(sql, params).await?).decode_many()
    }

    /// Run `work` in a transaction on the primary.
    pub async fn transaction<T, F>(&self, work: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t dyn TransactionHandle) -> TransactionFuture<'t, T> + Send + 'static,
    {
        self.registry.select_for_write().transaction(work).await
    }

    /// Update one row on the primary and return it.
    pub async fn update(&self, entity: &str, id: &Value, changes: Map<String, Value>) -> QuarryResult<Value> {
        let store = self.registry.select_for_write().entity(entity)?;
        store.update(id, changes).await
    }

    /// Stamp the entity's deletion field with the current time instead of
    /// removing the row. Returns `false` on any failure.
    pub async fn soft_delete(&self, entity: &str, id: &Value) -> bool {
        let result = async {
            let store = self.registry.select_for_write().entity(entity)?;
            let mut changes = Map::new();
            changes.insert(
                store.soft_delete_field().to_string(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            );
            store.update(id, changes).await
        }
        .await;

        match result {
            Ok(_) => true,
            Err(err) => {
                error!(
                    target: "quarry::query",
                    entity,
                    %id,
                    error = %err,
                    "Soft delete failed"
                );
                false
            }
        }
    }

    /// `SELECT 1` against the primary. Never fails.
    pub async fn check_connection_pool(&self) -> bool {
        self.registry.check_connection_pool().await
    }

    /// Round-trip every endpoint and report per-endpoint health.
    ///
    /// The first check is the primary. A failing replica degrades the
    /// overall status; a failing primary makes it unhealthy.
    pub async fn health(&self) -> (HealthStatus, Vec<HealthCheck>) {
        let primary = ping(&*self.registry.select_for_write(), "primary").await;
        let mut replicas = Vec::with_capacity(self.registry.replicas().len());
        for (i, replica) in self.registry.replicas().iter().enumerate() {
            replicas.push(ping(&**replica, &format!("replica-{}", i)).await);
        }
        let status = overall_status(&primary, &replicas);
        let mut checks = Vec::with_capacity(replicas.len() + 1);
        checks.push(primary);
        checks.extend(replicas);
        (status, checks)
    }
}

async fn ping<C: Connection>(connection: &C, component: &str) -> HealthCheck {
    let start = Instant::now();
    let result = connection.query_raw(PING_SQL, &[]).await;
    let elapsed = start.elapsed().as_millis() as u64;
    let check = match result {
        Ok(_) => HealthCheck::healthy(component),
        Err(err) => HealthCheck::unhealthy(component, err.to_string()),
    };
    check
        .with_response_time(elapsed)
        .with_metadata("endpoint", Value::from(connection.endpoint()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use quarry_core::{EntityDefinition, ErrorKind, ExecutionMode, QuarryError};
    use serde_json::json;

    fn config() -> AdapterConfig {
        AdapterConfig::new()
            .with_url("postgres://localhost/app")
            .with_entity(EntityDefinition::new("user").with_table("users"))
    }

    fn seeded(endpoint: &str) -> MemoryConnection {
        MemoryConnection::new(endpoint)
            .with_entity(EntityDefinition::new("user").with_table("users"))
            .with_rows(
                "users",
                vec![
                    json!({ "id": 1, "name": "Ada", "deleted_at": null }),
                    json!({ "id": 2, "name": "Brian", "deleted_at": "2024-05-01T00:00:00Z" }),
                ],
            )
    }

    fn adapter(replicas: usize) -> Adapter<MemoryConnection> {
        let reads = (0..replicas)
            .map(|i| seeded(&format!("memory://replica-{}", i)))
            .collect();
        Adapter::with_connections(config(), seeded("memory://primary"), reads)
            .unwrap()
            .with_retry_delay(Duration::ZERO)
    }

    struct EnvVarGuard {
        key: &'static str,
        original: Option<String>,
    }

    impl EnvVarGuard {
        fn unset(key: &'static str) -> Self {
            let original = std::env::var(key).ok();
            std::env::remove_var(key);
            Self { key, original }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            if let Some(v) = self.original.as_deref() {
                std::env::set_var(self.key, v);
            }
        }
    }

    #[test]
    fn test_invalid_config_rejected_before_construction() {
        let bad = AdapterConfig {
            url: None,
            ..config()
        };
        let _guard = EnvVarGuard::unset(quarry_core::DATABASE_URL_ENV);
        let err = Adapter::with_connections(bad, seeded("memory://p"), vec![])
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[tokio::test]
    async fn test_reads_rotate_and_writes_hit_primary() {
        let adapter = adapter(2);
        for _ in 0..4 {
            adapter.query("user", QueryOptions::new()).await.unwrap();
        }
        adapter
            .query("user", QueryOptions::new().with_write(true))
            .await
            .unwrap();

        let reg = adapter.registry();
        assert_eq!(reg.select_for_write().query_calls(), 1);
        for replica in reg.replicas() {
            assert_eq!(replica.query_calls(), 2);
        }
    }

    #[tokio::test]
    async fn test_soft_delete_filter_applied_when_enabled() {
        let adapter = Adapter::with_connections(
            config().with_soft_delete(true),
            seeded("memory://primary"),
            vec![],
        )
        .unwrap();

        let live = adapter
            .query("user", QueryOptions::new().with_mode(ExecutionMode::Count))
            .await
            .unwrap();
        assert_eq!(live, QueryOutput::Count(1));

        let mut all = Map::new();
        all.insert("deleted_at".into(), json!({ "not": null }));
        let deleted = adapter
            .query(
                "user",
                QueryOptions::new()
                    .with_filter(all)
                    .with_mode(ExecutionMode::Count),
            )
            .await
            .unwrap();
        assert_eq!(deleted, QueryOutput::Count(1));
    }

    #[tokio::test]
    async fn test_soft_delete_stamps_field_and_swallows_errors() {
        let adapter = adapter(0);
        assert!(adapter.soft_delete("user", &json!(1)).await);
        let row = &adapter.registry().select_for_write().rows("users")[0];
        let stamp = row["deleted_at"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(stamp).is_ok());

        assert!(!adapter.soft_delete("user", &json!(404)).await);
        assert!(!adapter.soft_delete("ghost", &json!(1)).await);
    }

    #[tokio::test]
    async fn test_execute_routes_to_replica_and_validates() {
        let adapter = adapter(1);
        adapter.execute("SELECT 1", vec![]).await.unwrap();
        assert_eq!(adapter.registry().replicas()[0].raw_calls(), 1);
        assert_eq!(adapter.registry().select_for_write().raw_calls(), 0);

        let err = adapter.execute("delete from users", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_execute_as_decodes_rows() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct One {
            n: i64,
        }
        let adapter = adapter(0);
        adapter
            .registry()
            .select_for_write()
            .set_raw_rows(vec![json!({ "n": 1 })]);
        let rows: Vec<One> = adapter.execute_as("SELECT 1 AS n", vec![]).await.unwrap();
        assert_eq!(rows, vec![One { n: 1 }]);
    }

    #[tokio::test]
    async fn test_connect_uses_retry_budget() {
        let adapter = Adapter::with_connections(
            config().with_connect_retries(1),
            MemoryConnection::new("memory://primary"),
            vec![],
        )
        .unwrap()
        .with_retry_delay(Duration::ZERO);
        adapter.registry().select_for_write().fail_next_connects(1);

        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());
        assert_eq!(adapter.registry().select_for_write().connect_calls(), 2);

        adapter.disconnect().await.unwrap();
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_transaction_runs_on_primary() {
        let adapter = adapter(1);
        let affected = adapter
            .transaction(|tx| {
                Box::pin(async move { tx.execute("UPDATE users SET name = 'x'", &[]).await })
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(adapter.registry().select_for_write().statements().len(), 1);
        assert!(adapter.registry().replicas()[0].statements().is_empty());

        let err = adapter
            .transaction(|_tx| Box::pin(async move { Err::<(), _>(QuarryError::validation("no")) }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_health_degrades_on_replica_failure() {
        let adapter = adapter(2);
        let (status, checks) = adapter.health().await;
        assert_eq!(status, HealthStatus::Healthy);
        assert_eq!(checks.len(), 3);

        adapter.registry().replicas()[1].fail_raw_queries(true);
        let (status, _) = adapter.health().await;
        assert_eq!(status, HealthStatus::Degraded);

        adapter.registry().select_for_write().fail_raw_queries(true);
        let (status, _) = adapter.health().await;
        assert_eq!(status, HealthStatus::Unhealthy);
        assert!(!adapter.check_connection_pool().await);
    }
}
