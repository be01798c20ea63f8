//! Fluent query builder.
//!
//! Each chained call consumes the builder and returns it with the
//! descriptor updated, so a descriptor is only ever owned by one chain.
//!
//! ```ignore
//! let users = adapter
//!     .from("user")
//!     .select(["id", "name"])
//!     .filter(json!({ "status": "active" }).as_object().cloned().unwrap_or_default())
//!     .order_by("createdAt", SortDirection::Desc)
//!     .paginate(2, 25)
//!     .execute()
//!     .await?
//!     .into_many()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use quarry_core::{
    sanitize_value, validate_params, validate_read_only, ExecutionMode, OrderBy, QuarryError,
    QuarryResult, QueryDescriptor, QueryOptions, QueryOutput, RowTransform, SortDirection,
    DEFAULT_PER_PAGE,
};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::connection::Connection;

/// Default deadline for `execute_raw` when none is configured.
pub const DEFAULT_RAW_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a [`QueryDescriptor`] and executes it against one connection.
pub struct QueryBuilder<C: Connection> {
    connection: Arc<C>,
    entity: String,
    descriptor: QueryDescriptor,
    transform: Option<RowTransform>,
    timeout: Duration,
}

impl<C: Connection> QueryBuilder<C> {
    pub fn new(connection: Arc<C>, entity: impl Into<String>) -> Self {
        Self {
            connection,
            entity: entity.into(),
            descriptor: QueryDescriptor::default(),
            transform: None,
            timeout: DEFAULT_RAW_TIMEOUT,
        }
    }

    /// Seed a builder from initial options. The filter goes through the
    /// same sanitization as [`filter`](Self::filter).
    pub fn with_options(connection: Arc<C>, entity: impl Into<String>, options: QueryOptions) -> Self {
        let mut builder = Self::new(connection, entity);
        if let Some(fields) = options.select {
            builder = builder.select(fields);
        }
        if let Some(relations) = options.include {
            builder = builder.include(relations);
        }
        if let Some(filter) = options.filter {
            builder = builder.filter(filter);
        }
        for order in options.order_by {
            builder = builder.order_by(order.field, order.direction);
        }
        match (options.page, options.per_page) {
            (Some(page), Some(per_page)) => builder = builder.paginate(page, per_page),
            (Some(page), None) => builder = builder.page(page),
            (None, Some(per_page)) => builder = builder.per_page(per_page),
            (None, None) => {}
        }
        match options.mode {
            ExecutionMode::Count => builder = builder.count(),
            ExecutionMode::Single => builder = builder.single(),
            ExecutionMode::List => {}
        }
        builder.transform = options.transform;
        builder
    }

    /// Deadline applied by [`execute_raw`](Self::execute_raw).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the projection.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Replace the set of embedded relations.
    pub fn include<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.descriptor.include = Some(relations.into_iter().map(Into::into).collect());
        self
    }

    /// Sanitize each value and merge it into the filter. Later keys
    /// overwrite earlier ones.
    pub fn filter(mut self, condition: Map<String, Value>) -> Self {
        for (field, value) in condition {
            self.descriptor.filter.insert(field, sanitize_value(value));
        }
        self
    }

    /// Merge a multi-condition fragment (`AND` / `OR` / `NOT` trees)
    /// without sanitization. The caller is responsible for its contents.
    pub fn filter_complex(mut self, fragment: Map<String, Value>) -> Self {
        self.descriptor.filter.extend(fragment);
        self
    }

    /// Append an ordering term.
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.descriptor.order_by.push(OrderBy::new(field, direction));
        self
    }

    /// Set both `skip` and `take` from a 1-based page number.
    pub fn paginate(mut self, page: u64, per_page: u64) -> Self {
        self.descriptor.skip = Some(page.saturating_sub(1).saturating_mul(per_page));
        self.descriptor.take = Some(per_page);
        self
    }

    /// Recompute `skip` from the page number and whatever `take` is
    /// currently set (10 if none).
    ///
    /// Call order matters: `page(2).per_page(20)` skips 10 rows while
    /// `per_page(20).page(2)` skips 20.
    pub fn page(mut self, page: u64) -> Self {
        let take = self.descriptor.take.unwrap_or(DEFAULT_PER_PAGE);
        self.descriptor.skip = Some(page.saturating_sub(1).saturating_mul(take));
        self
    }

    /// Set `take` only; `skip` is left as it is.
    pub fn per_page(mut self, per_page: u64) -> Self {
        self.descriptor.take = Some(per_page);
        self
    }

    /// Return the number of matching rows. Takes precedence over `single`.
    pub fn count(mut self) -> Self {
        self.descriptor.count = true;
        self
    }

    /// Return at most one row.
    pub fn single(mut self) -> Self {
        self.descriptor.single = true;
        self
    }

    /// Transform each row of a list result.
    pub fn map<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.descriptor
    }

    pub fn into_descriptor(self) -> QueryDescriptor {
        self.descriptor
    }

    /// Run the descriptor against the connection.
    ///
    /// Errors from the connection are returned unchanged.
    pub async fn execute(self) -> QuarryResult<QueryOutput> {
        let store = self.connection.entity(&self.entity)?;
        let mode = self.descriptor.mode();
        debug!(
            target: "quarry::query",
            entity = %self.entity,
            endpoint = self.connection.endpoint(),
            ?mode,
            "Executing query"
        );

        match mode {
            ExecutionMode::Count => Ok(QueryOutput::Count(store.count(&self.descriptor).await?)),
            ExecutionMode::Single => Ok(QueryOutput::One(
                store.find_first(&self.descriptor).await?,
            )),
            ExecutionMode::List => {
                let rows = store.find_many(&self.descriptor).await?;
                let rows = match &self.transform {
                    Some(transform) => rows.into_iter().map(|row| transform(row)).collect(),
                    None => rows,
                };
                Ok(QueryOutput::Many(rows))
            }
        }
    }

    /// Run a read-only raw statement with a deadline.
    ///
    /// The statement must start with `SELECT` and every parameter must be a
    /// scalar without a `--` sequence. The statement runs on its own task;
    /// when the deadline passes the caller gets a timeout error but the task
    /// is left running, so the statement may still complete on the server.
    pub async fn execute_raw(&self, sql: &str, params: Vec<Value>) -> QuarryResult<Vec<Value>> {
        validate_read_only(sql)?;
        validate_params(&params)?;

        let connection = Arc::clone(&self.connection);
        let statement = sql.to_string();
        let task = tokio::spawn(async move { connection.query_raw(&statement, &params).await });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                Err(QuarryError::connection("Raw query task did not complete").with_source(join_err))
            }
            Err(_) => {
                warn!(
                    target: "quarry::query",
                    endpoint = self.connection.endpoint(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Raw query timed out; statement left running"
                );
                Err(QuarryError::timeout(format!(
                    "Raw query exceeded {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryConnection;
    use quarry_core::ErrorKind;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn users() -> Arc<MemoryConnection> {
        let conn = MemoryConnection::new("memory://primary").with_rows(
            "user",
            vec![
                json!({ "id": 1, "name": "Ada", "status": "active", "createdAt": 3 }),
                json!({ "id": 2, "name": "Brian", "status": "active", "createdAt": 1 }),
                json!({ "id": 3, "name": "Cleo", "status": "banned", "createdAt": 2 }),
            ],
        );
        Arc::new(conn)
    }

    fn builder() -> QueryBuilder<MemoryConnection> {
        QueryBuilder::new(users(), "user")
    }

    #[test]
    fn test_filter_sanitizes_values() {
        let b = builder().filter(obj(json!({ "a": "x--y" })));
        assert_eq!(b.descriptor().filter, obj(json!({ "a": "xy" })));
    }

    #[test]
    fn test_filter_merges_across_calls() {
        let b = builder()
            .filter(obj(json!({ "a": 1 })))
            .filter(obj(json!({ "b": 2 })))
            .filter(obj(json!({ "a": 3 })));
        assert_eq!(b.descriptor().filter, obj(json!({ "a": 3, "b": 2 })));
    }

    #[test]
    fn test_filter_complex_skips_sanitization() {
        let b = builder().filter_complex(obj(json!({ "OR": [{ "name": "x--y" }] })));
        assert_eq!(
            b.descriptor().filter,
            obj(json!({ "OR": [{ "name": "x--y" }] }))
        );
    }

    #[test]
    fn test_order_by_appends() {
        let b = builder()
            .order_by("createdAt", SortDirection::Desc)
            .order_by("name", SortDirection::Asc);
        assert_eq!(
            b.descriptor().order_by,
            vec![OrderBy::desc("createdAt"), OrderBy::asc("name")]
        );
    }

    #[test]
    fn test_page_then_per_page() {
        let d = builder().page(2).per_page(10).into_descriptor();
        assert_eq!((d.skip, d.take), (Some(10), Some(10)));

        let d = builder().page(1).per_page(20).into_descriptor();
        assert_eq!((d.skip, d.take), (Some(0), Some(20)));
    }

    #[test]
    fn test_page_depends_on_current_take() {
        let d = builder().per_page(20).page(2).into_descriptor();
        assert_eq!((d.skip, d.take), (Some(20), Some(20)));

        let d = builder().page(2).per_page(20).into_descriptor();
        assert_eq!((d.skip, d.take), (Some(10), Some(20)));
    }

    #[test]
    fn test_paginate_last_call_wins() {
        let d = builder().paginate(3, 5).paginate(2, 50).into_descriptor();
        assert_eq!((d.skip, d.take), (Some(50), Some(50)));

        let d = builder().paginate(0, 5).into_descriptor();
        assert_eq!(d.skip, Some(0));
    }

    #[test]
    fn test_select_and_include_replace() {
        let d = builder()
            .select(["id"])
            .select(["id", "name"])
            .include(["posts"])
            .include(["profile"])
            .into_descriptor();
        assert_eq!(
            d.select.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["id".to_string(), "name".to_string()]
        );
        assert_eq!(
            d.include.unwrap().into_iter().collect::<Vec<_>>(),
            vec!["profile".to_string()]
        );
    }

    #[test]
    fn test_with_options_seeds_descriptor() {
        let options = QueryOptions::new()
            .with_select(["id"])
            .with_filter(obj(json!({ "name": "A;" })))
            .with_order(OrderBy::desc("createdAt"))
            .with_page(3, 5)
            .with_mode(ExecutionMode::Single);
        let d = QueryBuilder::with_options(users(), "user", options).into_descriptor();
        assert_eq!(d.filter, obj(json!({ "name": "A" })));
        assert_eq!((d.skip, d.take), (Some(10), Some(5)));
        assert_eq!(d.mode(), ExecutionMode::Single);
        assert_eq!(d.order_by, vec![OrderBy::desc("createdAt")]);
    }

    #[tokio::test]
    async fn test_execute_list_preserves_connection_order_and_transforms() {
        let rows = builder()
            .filter(obj(json!({ "status": "active" })))
            .order_by("createdAt", SortDirection::Asc)
            .map(|mut row| {
                if let Some(obj) = row.as_object_mut() {
                    obj.insert("seen".into(), json!(true));
                }
                row
            })
            .execute()
            .await
            .unwrap()
            .into_many()
            .unwrap();

        let ids: Vec<i64> = rows.iter().filter_map(|r| r["id"].as_i64()).collect();
        assert_eq!(ids, vec![2, 1]);
        assert!(rows.iter().all(|r| r["seen"] == json!(true)));
    }

    #[tokio::test]
    async fn test_execute_count_wins_over_single() {
        let out = builder().single().count().execute().await.unwrap();
        assert_eq!(out, QueryOutput::Count(3));
    }

    #[tokio::test]
    async fn test_execute_single() {
        let out = builder()
            .filter(obj(json!({ "name": "Cleo" })))
            .single()
            .execute()
            .await
            .unwrap()
            .into_one()
            .unwrap();
        assert_eq!(out.unwrap()["id"], json!(3));

        let none = builder()
            .filter(obj(json!({ "name": "Nobody" })))
            .single()
            .execute()
            .await
            .unwrap();
        assert_eq!(none, QueryOutput::One(None));
    }

    #[tokio::test]
    async fn test_execute_propagates_connection_errors() {
        let conn = users();
        conn.fail_entity_queries(true);
        let err = QueryBuilder::new(conn, "user").execute().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_unknown_entity_is_validation_error() {
        let err = QueryBuilder::new(users(), "ghost").execute().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_execute_raw_rejects_non_select_before_connection() {
        let conn = users();
        let b = QueryBuilder::new(Arc::clone(&conn), "user");

        let err = b.execute_raw("DROP TABLE x", vec![]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = b.execute_raw("SELECT 1", vec![json!({ "a": 1 })]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);

        let err = b.execute_raw("SELECT 1", vec![json!("a--b")]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Security);

        assert_eq!(conn.raw_calls(), 0);
    }

    #[tokio::test]
    async fn test_execute_raw_returns_rows() {
        let conn = users();
        conn.set_raw_rows(vec![json!({ "?column?": 1 })]);
        let rows = QueryBuilder::new(Arc::clone(&conn), "user")
            .execute_raw("SELECT 1", vec![json!(1)])
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({ "?column?": 1 })]);
        assert_eq!(conn.raw_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_raw_times_out_without_cancelling() {
        let conn = users();
        conn.set_raw_delay(Duration::from_secs(10));

        let err = QueryBuilder::new(Arc::clone(&conn), "user")
            .timeout(Duration::from_millis(100))
            .execute_raw("SELECT pg_sleep(10)", vec![])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(conn.raw_completed(), 0);

        // The detached statement still runs to completion.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(conn.raw_completed(), 1);
    }
}
