//! PostgreSQL connection backed by a deadpool connection pool.

use std::cell::Cell;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use futures_util::future::try_join_all;
use parking_lot::Mutex;
use quarry_core::{EntityDefinition, PoolConfig, QuarryError, QuarryResult, QueryDescriptor};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::connection::{Connection, EntityStore, TransactionFuture, TransactionHandle};
use crate::registry::PING_SQL;
use crate::sql::{self, Statement};

// ============================================================================
// CONNECTION
// ============================================================================

/// One PostgreSQL endpoint with its own pool.
pub struct PgConnection {
    endpoint: String,
    pool: Pool,
    settings: PoolConfig,
    entities: Arc<HashMap<String, EntityDefinition>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PgConnection {
    /// Build the pool for `url`. No connection is opened until
    /// [`Connection::connect`].
    pub fn new(url: &str, settings: &PoolConfig, entities: &[EntityDefinition]) -> QuarryResult<Self> {
        let mut cfg = Config::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool_cfg = deadpool_postgres::PoolConfig::new(settings.max as usize);
        pool_cfg.timeouts.wait = Some(settings.acquire_timeout());
        pool_cfg.timeouts.create = Some(settings.acquire_timeout());
        cfg.pool = Some(pool_cfg);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| QuarryError::config("Failed to create connection pool").with_source(e))?;

        Ok(Self {
            endpoint: redact_url(url),
            pool,
            settings: settings.clone(),
            entities: Arc::new(
                entities
                    .iter()
                    .map(|e| (e.name.clone(), e.clone()))
                    .collect(),
            ),
            reaper: Mutex::new(None),
        })
    }

    /// Current pool size for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    /// Close pooled connections that have been idle longer than the
    /// configured idle timeout, keeping at least `min` open.
    pub fn prune_idle(&self) -> usize {
        reap_idle(&self.pool, self.settings.idle(), self.settings.min as usize)
    }

    async fn client(&self) -> QuarryResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl Connection for PgConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open `min` pooled connections and round-trip `SELECT 1` on one.
    async fn connect(&self) -> QuarryResult<()> {
        let warm = (self.settings.min as usize).max(1);
        let clients = try_join_all((0..warm).map(|_| self.pool.get()))
            .await
            .map_err(pool_error)?;
        if let Some(client) = clients.first() {
            client.query_one(PING_SQL, &[]).await.map_err(pg_error)?;
        }
        drop(clients);

        let idle = self.settings.idle();
        if !idle.is_zero() {
            let pool = self.pool.clone();
            let keep = self.settings.min as usize;
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(idle);
                loop {
                    ticker.tick().await;
                    let removed = reap_idle(&pool, idle, keep);
                    if removed > 0 {
                        debug!(target: "quarry::pool", removed, "Closed idle connections");
                    }
                }
            });
            if let Some(previous) = self.reaper.lock().replace(handle) {
                previous.abort();
            }
        }

        debug!(target: "quarry::pool", endpoint = %self.endpoint, warm, "Pool warmed");
        Ok(())
    }

    async fn disconnect(&self) -> QuarryResult<()> {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        self.pool.close();
        Ok(())
    }

    fn entity(&self, entity: &str) -> QuarryResult<Arc<dyn EntityStore>> {
        let definition = self
            .entities
            .get(entity)
            .cloned()
            .ok_or_else(|| QuarryError::validation(format!("Unknown entity '{}'", entity)))?;
        Ok(Arc::new(PgEntityStore {
            definition,
            pool: self.pool.clone(),
        }))
    }

    async fn query_raw(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Value>> {
        let client = self.client().await?;
        let stmt = Statement {
            sql: sql::wrap_raw(sql),
            params: params.to_vec(),
        };
        query_json(&client, &stmt).await
    }

    async fn transaction<T, F>(&self, work: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t dyn TransactionHandle) -> TransactionFuture<'t, T> + Send + 'static,
    {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(pg_error)?;
        let handle = PgTransaction {
            tx: tokio::sync::Mutex::new(tx),
        };

        let result = work(&handle).await;
        let tx = handle.tx.into_inner();
        match result {
            Ok(value) => {
                tx.commit().await.map_err(pg_error)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(
                        target: "quarry::query",
                        endpoint = %self.endpoint,
                        error = %rollback,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }
}

fn reap_idle(pool: &Pool, idle: Duration, keep: usize) -> usize {
    let kept = Cell::new(0usize);
    let result = pool.retain(|_, metrics| {
        if metrics.last_used() < idle || kept.get() < keep {
            kept.set(kept.get() + 1);
            true
        } else {
            false
        }
    });
    result.removed.len()
}

struct PgTransaction<'a> {
    tx: tokio::sync::Mutex<deadpool_postgres::Transaction<'a>>,
}

#[async_trait]
impl TransactionHandle for PgTransaction<'_> {
    async fn query_raw(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Value>> {
        let tx = self.tx.lock().await;
        let prepared = tx.prepare_cached(&sql::wrap_raw(sql)).await.map_err(pg_error)?;
        let params = to_params(params);
        let rows = tx.query(&prepared, &param_refs(&params)).await.map_err(pg_error)?;
        rows_to_json(rows)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64> {
        let tx = self.tx.lock().await;
        let prepared = tx.prepare_cached(sql).await.map_err(pg_error)?;
        let params = to_params(params);
        tx.execute(&prepared, &param_refs(&params)).await.map_err(pg_error)
    }
}

// ============================================================================
// ENTITY STORE
// ============================================================================

struct PgEntityStore {
    definition: EntityDefinition,
    pool: Pool,
}

impl PgEntityStore {
    async fn client(&self) -> QuarryResult<deadpool_postgres::Object> {
        self.pool.get().await.map_err(pool_error)
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn primary_key(&self) -> &str {
        &self.definition.primary_key
    }

    fn soft_delete_field(&self) -> &str {
        &self.definition.soft_delete_field
    }

    async fn find_many(&self, query: &QueryDescriptor) -> QuarryResult<Vec<Value>> {
        let stmt = sql::render_select(&self.definition, query, false)?;
        let client = self.client().await?;
        query_json(&client, &stmt).await
    }

    async fn find_first(&self, query: &QueryDescriptor) -> QuarryResult<Option<Value>> {
        let stmt = sql::render_select(&self.definition, query, true)?;
        let client = self.client().await?;
        Ok(query_json(&client, &stmt).await?.into_iter().next())
    }

    async fn count(&self, query: &QueryDescriptor) -> QuarryResult<u64> {
        let stmt = sql::render_count(&self.definition, query)?;
        let client = self.client().await?;
        let prepared = client.prepare_cached(&stmt.sql).await.map_err(pg_error)?;
        let params = to_params(&stmt.params);
        let row = client
            .query_one(&prepared, &param_refs(&params))
            .await
            .map_err(pg_error)?;
        let count: i64 = row.try_get(0).map_err(pg_error)?;
        Ok(count.max(0) as u64)
    }

    async fn update(&self, id: &Value, changes: Map<String, Value>) -> QuarryResult<Value> {
        let stmt = sql::render_update(&self.definition, id, &changes)?;
        let client = self.client().await?;
        query_json(&client, &stmt)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                QuarryError::validation(format!(
                    "No '{}' row with {} = {}",
                    self.definition.name, self.definition.primary_key, id
                ))
            })
    }
}

async fn query_json(client: &deadpool_postgres::Object, stmt: &Statement) -> QuarryResult<Vec<Value>> {
    debug!(target: "quarry::query", sql = %stmt.sql, params = stmt.params.len(), "Query");
    let prepared = client.prepare_cached(&stmt.sql).await.map_err(pg_error)?;
    let params = to_params(&stmt.params);
    let rows = client
        .query(&prepared, &param_refs(&params))
        .await
        .map_err(pg_error)?;
    rows_to_json(rows)
}

fn rows_to_json(rows: Vec<tokio_postgres::Row>) -> QuarryResult<Vec<Value>> {
    rows.into_iter()
        .map(|row| {
            row.try_get::<_, Option<Value>>(0)
                .map(|v| v.unwrap_or(Value::Null))
                .map_err(pg_error)
        })
        .collect()
}

// ============================================================================
// PARAMETERS
// ============================================================================

/// A JSON value bound as a statement parameter.
///
/// The server infers each placeholder's type from the statement; the value
/// is encoded for whatever type it inferred.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl From<&Value> for SqlParam {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlParam::Int(i),
                None => SqlParam::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Json(other.clone()),
        }
    }
}

type BoxError = Box<dyn StdError + Sync + Send>;

impl ToSql for SqlParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Bool(b) => match *ty {
                Type::JSON | Type::JSONB => Value::Bool(*b).to_sql(ty, out),
                _ => b.to_sql(ty, out),
            },
            SqlParam::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    i.to_string().as_str().to_sql(ty, out)
                }
                Type::JSON | Type::JSONB => Value::from(*i).to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            SqlParam::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                    f.to_string().as_str().to_sql(ty, out)
                }
                Type::JSON | Type::JSONB => Value::from(*f).to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            SqlParam::Text(s) => match *ty {
                Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s)?
                    .with_timezone(&Utc)
                    .to_sql(ty, out),
                Type::TIMESTAMP => s.parse::<NaiveDateTime>()?.to_sql(ty, out),
                Type::DATE => s.parse::<NaiveDate>()?.to_sql(ty, out),
                Type::UUID => Uuid::parse_str(s)?.to_sql(ty, out),
                Type::INT2 => s.parse::<i16>()?.to_sql(ty, out),
                Type::INT4 => s.parse::<i32>()?.to_sql(ty, out),
                Type::INT8 => s.parse::<i64>()?.to_sql(ty, out),
                Type::JSON | Type::JSONB => Value::String(s.clone()).to_sql(ty, out),
                _ => s.as_str().to_sql(ty, out),
            },
            SqlParam::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn to_params(values: &[Value]) -> Vec<SqlParam> {
    values.iter().map(SqlParam::from).collect()
}

fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

/// Map a driver error to a [`QuarryError`], logging the full error.
pub fn pg_error(err: tokio_postgres::Error) -> QuarryError {
    error!(target: "quarry::query", error = ?err, "Database error");

    let mapped = match err.code() {
        Some(code) if *code == SqlState::QUERY_CANCELED => {
            QuarryError::timeout("Statement was cancelled by the server")
        }
        Some(code) if code.code().starts_with("22") || code.code().starts_with("23") => {
            QuarryError::validation(
                err.as_db_error()
                    .map(|db| db.message().to_string())
                    .unwrap_or_else(|| "Constraint violation".to_string()),
            )
        }
        Some(code) if *code == SqlState::INSUFFICIENT_PRIVILEGE => {
            QuarryError::security("Permission denied")
        }
        _ if err.is_closed() => QuarryError::connection("Database connection closed"),
        _ => QuarryError::connection("Database operation failed"),
    };
    mapped.with_source(err)
}

/// Map a pool error. Acquire timeouts become timeouts; a closed pool is a
/// connection error.
pub fn pool_error(err: PoolError) -> QuarryError {
    error!(target: "quarry::pool", error = ?err, "Connection pool error");

    let mapped = match &err {
        PoolError::Timeout(_) => QuarryError::timeout("Timed out acquiring a pooled connection"),
        PoolError::Closed => QuarryError::connection("Connection pool is closed"),
        PoolError::Backend(_) => QuarryError::connection("Failed to open a database connection"),
        _ => QuarryError::connection("Failed to acquire database connection"),
    };
    mapped.with_source(err)
}

/// Drop credentials from a connection URL for logging.
pub fn redact_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}
