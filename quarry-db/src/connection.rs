//! Connection capability traits.
//!
//! The adapter never talks to a database client directly. It goes through
//! three seams:
//!
//! - [`Connection`]: one database endpoint (the primary or a replica) that
//!   can connect, run raw reads, open transactions and hand out per-entity
//!   stores.
//! - [`EntityStore`]: typed CRUD for one entity, resolved by name from a
//!   mapping built once when the connection is constructed.
//! - [`TransactionHandle`]: what a transaction callback gets to work with.
//!
//! Rows travel as `serde_json::Value` objects; callers decode them with
//! [`QueryOutput::decode_many`](quarry_core::QueryOutput::decode_many) and
//! friends.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use quarry_core::{QuarryResult, QueryDescriptor};
use serde_json::{Map, Value};

/// Typed CRUD operations for one entity.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Entity name as used by callers.
    fn name(&self) -> &str;

    /// Column holding the row identity.
    fn primary_key(&self) -> &str;

    /// Column stamped by soft deletes.
    fn soft_delete_field(&self) -> &str;

    /// Rows matching the descriptor, in the order the descriptor asks for.
    async fn find_many(&self, query: &QueryDescriptor) -> QuarryResult<Vec<Value>>;

    /// First matching row, if any.
    async fn find_first(&self, query: &QueryDescriptor) -> QuarryResult<Option<Value>>;

    /// Number of rows matching the descriptor's filter.
    async fn count(&self, query: &QueryDescriptor) -> QuarryResult<u64>;

    /// Apply `changes` to the row whose primary key is `id` and return the
    /// updated row.
    async fn update(&self, id: &Value, changes: Map<String, Value>) -> QuarryResult<Value>;
}

/// Connection-scoped handle passed to transaction callbacks.
#[async_trait]
pub trait TransactionHandle: Send + Sync {
    /// Run a statement and return its rows as JSON objects.
    async fn query_raw(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Value>>;

    /// Run a statement and return the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> QuarryResult<u64>;
}

/// Future returned by a transaction callback.
pub type TransactionFuture<'t, T> = BoxFuture<'t, QuarryResult<T>>;

/// One database endpoint.
///
/// Implementations are expected to pool or serialize internally; the
/// adapter shares a single write connection across all callers without any
/// locking of its own.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Endpoint label for logs, with credentials removed.
    fn endpoint(&self) -> &str;

    /// Establish the connection.
    async fn connect(&self) -> QuarryResult<()>;

    /// Tear the connection down.
    async fn disconnect(&self) -> QuarryResult<()>;

    /// Resolve the store for `entity`. Unknown names are a validation error.
    fn entity(&self, entity: &str) -> QuarryResult<Arc<dyn EntityStore>>;

    /// Run a raw statement and return its rows as JSON objects.
    async fn query_raw(&self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Value>>;

    /// Run `work` inside the endpoint's transaction primitive.
    ///
    /// Commit/rollback semantics are the primitive's: an `Ok` from the
    /// callback commits, an `Err` rolls back. Failures are returned as-is.
    async fn transaction<T, F>(&self, work: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t dyn TransactionHandle) -> TransactionFuture<'t, T> + Send + 'static;
}
