//! In-memory connection for testing.
//!
//! Tables are vectors of JSON objects keyed by table name. Filters,
//! ordering, pagination, projection and relation embedding are evaluated
//! in process with the same operator vocabulary the PostgreSQL connection
//! renders. Failure injection and call counters let tests observe routing
//! and retry behaviour without a database.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_core::{EntityDefinition, QuarryError, QuarryResult, QueryDescriptor, SortDirection};
use serde_json::{Map, Value};

use crate::connection::{Connection, EntityStore, TransactionFuture, TransactionHandle};
use crate::sql::is_operator_set;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, Vec<Value>>,
    /// Statements run through a transaction handle and committed.
    statements: Vec<String>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: Mutex<Tables>,
    entities: Mutex<HashMap<String, EntityDefinition>>,
    raw_rows: Mutex<Vec<Value>>,
    raw_delay: Mutex<Duration>,
    pending_connect_failures: AtomicUsize,
    fail_raw: AtomicBool,
    fail_entity: AtomicBool,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    raw_calls: AtomicUsize,
    raw_completed: AtomicUsize,
    query_calls: AtomicUsize,
}

/// In-memory [`Connection`] for tests.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    endpoint: String,
    state: Arc<MemoryState>,
}

impl MemoryConnection {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Arc::new(MemoryState::default()),
        }
    }

    /// Seed a table. Entities without a definition resolve to the table of
    /// the same name with primary key `id`.
    pub fn with_rows(self, table: impl Into<String>, rows: Vec<Value>) -> Self {
        self.state.tables.lock().rows.insert(table.into(), rows);
        self
    }

    /// Register an entity mapping (table name, keys, relations).
    pub fn with_entity(self, entity: EntityDefinition) -> Self {
        self.state
            .entities
            .lock()
            .insert(entity.name.clone(), entity);
        self
    }

    /// Snapshot of a table's rows.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .tables
            .lock()
            .rows
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Statements committed through transaction handles.
    pub fn statements(&self) -> Vec<String> {
        self.state.tables.lock().statements.clone()
    }

    /// Make the next `n` calls to `connect` fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.state.pending_connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_raw_queries(&self, fail: bool) {
        self.state.fail_raw.store(fail, Ordering::SeqCst);
    }

    /// Make every entity-store operation fail with a connection error.
    pub fn fail_entity_queries(&self, fail: bool) {
        self.state.fail_entity.store(fail, Ordering::SeqCst);
    }

    /// Rows returned by every raw query.
    pub fn set_raw_rows(&self, rows: Vec<Value>) {
        *self.state.raw_rows.lock() = rows;
    }

    /// Delay applied before a raw query returns.
    pub fn set_raw_delay(&self, delay: Duration) {
        *self.state.raw_delay.lock() = delay;
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.state.connect_calls.load(Ordering::SeqCst)
    }

    /// Raw queries started.
    pub fn raw_calls(&self) -> usize {
        self.state.raw_calls.load(Ordering::SeqCst)
    }

    /// Raw queries that ran to completion.
    pub fn raw_completed(&self) -> usize {
        self.state.raw_completed.load(Ordering::SeqCst)
    }

    /// Entity-store reads (`find_many`, `find_first`, `count`).
    pub fn query_calls(&self) -> usize {
        self.state.query_calls.load(Ordering::SeqCst)
    }

    fn definition(&self, entity: &str) -> Option<EntityDefinition> {
        if let Some(def) = self.state.entities.lock().get(entity) {
            return Some(def.clone());
        }
        if self.state.tables.lock().rows.contains_key(entity) {
            return Some(EntityDefinition::new(entity));
        }
        None
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn connect(&self) -> QuarryResult<()> {
        self.state.connect_calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .state
            .pending_connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(QuarryError::connection(format!(
                "{} refused the connection",
                self.endpoint
            )));
        }
        self.state.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> QuarryResult<()> {
        self.state.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn entity(&self, entity: &str) -> QuarryResult<Arc<dyn EntityStore>> {
        let definition = self
            .definition(entity)
            .ok_or_else(|| QuarryError::validation(format!("Unknown entity '{}'", entity)))?;
        Ok(Arc::new(MemoryEntityStore {
            definition,
            state: Arc::clone(&self.state),
        }))
    }

    async fn query_raw(&self, _sql: &str, _params: &[Value]) -> QuarryResult<Vec<Value>> {
        run_raw(&self.state).await
    }

    /// Tables are snapshotted before `work` runs and restored if it fails.
    /// Concurrent transactions are not isolated from each other.
    async fn transaction<T, F>(&self, work: F) -> QuarryResult<T>
    where
        T: Send + 'static,
        F: for<'t> FnOnce(&'t dyn TransactionHandle) -> TransactionFuture<'t, T> + Send + 'static,
    {
        let snapshot = self.state.tables.lock().clone();
        let handle = MemoryTransaction {
            state: Arc::clone(&self.state),
        };
        let result = work(&handle).await;
        if result.is_err() {
            *self.state.tables.lock() = snapshot;
        }
        result
    }
}

async fn run_raw(state: &MemoryState) -> QuarryResult<Vec<Value>> {
    state.raw_calls.fetch_add(1, Ordering::SeqCst);
    if state.fail_raw.load(Ordering::SeqCst) {
        return Err(QuarryError::connection("Raw query failed"));
    }
    let delay = *state.raw_delay.lock();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    state.raw_completed.fetch_add(1, Ordering::SeqCst);
    Ok(state.raw_rows.lock().clone())
}

struct MemoryTransaction {
    state: Arc<MemoryState>,
}

#[async_trait]
impl TransactionHandle for MemoryTransaction {
    async fn query_raw(&self, _sql: &str, _params: &[Value]) -> QuarryResult<Vec<Value>> {
        run_raw(&self.state).await
    }

    async fn execute(&self, sql: &str, _params: &[Value]) -> QuarryResult<u64> {
        self.state.tables.lock().statements.push(sql.to_string());
        Ok(1)
    }
}

// ============================================================================
// ENTITY STORE
// ============================================================================

struct MemoryEntityStore {
    definition: EntityDefinition,
    state: Arc<MemoryState>,
}

impl MemoryEntityStore {
    fn check(&self) -> QuarryResult<()> {
        if self.state.fail_entity.load(Ordering::SeqCst) {
            return Err(QuarryError::connection(format!(
                "Query on '{}' failed",
                self.definition.name
            )));
        }
        Ok(())
    }

    fn matching(&self, query: &QueryDescriptor) -> Vec<Value> {
        let tables = self.state.tables.lock();
        let mut rows: Vec<Value> = tables
            .rows
            .get(&self.definition.table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| matches_filter(row, &query.filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !query.order_by.is_empty() {
            rows.sort_by(|a, b| {
                for term in &query.order_by {
                    let ord = compare(field(a, &term.field), field(b, &term.field))
                        .unwrap_or(CmpOrdering::Equal);
                    let ord = match term.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != CmpOrdering::Equal {
                        return ord;
                    }
                }
                CmpOrdering::Equal
            });
        }

        let skip = query.skip.unwrap_or(0) as usize;
        let take = query.take.map(|t| t as usize).unwrap_or(usize::MAX);
        rows.into_iter().skip(skip).take(take).collect()
    }

    fn shape(&self, row: Value, query: &QueryDescriptor) -> QuarryResult<Value> {
        let Value::Object(source) = row else {
            return Ok(row);
        };
        let mut out = match &query.select {
            Some(fields) => source
                .iter()
                .filter(|(k, _)| fields.contains(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            None => source.clone(),
        };

        if let Some(relations) = &query.include {
            let tables = self.state.tables.lock();
            let parent_key = source
                .get(&self.definition.primary_key)
                .cloned()
                .unwrap_or(Value::Null);
            for name in relations {
                let relation = self.definition.relation(name).ok_or_else(|| {
                    QuarryError::validation(format!(
                        "Entity '{}' has no relation '{}'",
                        self.definition.name, name
                    ))
                })?;
                let children: Vec<Value> = tables
                    .rows
                    .get(&relation.table)
                    .map(|rows| {
                        rows.iter()
                            .filter(|child| loose_eq(field(child, &relation.foreign_key), &parent_key))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                out.insert(name.clone(), Value::Array(children));
            }
        }

        Ok(Value::Object(out))
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
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
        self.state.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.matching(query)
            .into_iter()
            .map(|row| self.shape(row, query))
            .collect()
    }

    async fn find_first(&self, query: &QueryDescriptor) -> QuarryResult<Option<Value>> {
        self.state.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        self.matching(query)
            .into_iter()
            .next()
            .map(|row| self.shape(row, query))
            .transpose()
    }

    async fn count(&self, query: &QueryDescriptor) -> QuarryResult<u64> {
        self.state.query_calls.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        let tables = self.state.tables.lock();
        let count = tables
            .rows
            .get(&self.definition.table)
            .map(|rows| rows.iter().filter(|r| matches_filter(r, &query.filter)).count())
            .unwrap_or(0);
        Ok(count as u64)
    }

    async fn update(&self, id: &Value, changes: Map<String, Value>) -> QuarryResult<Value> {
        self.check()?;
        let mut tables = self.state.tables.lock();
        let row = tables
            .rows
            .get_mut(&self.definition.table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|row| loose_eq(field(row, &self.definition.primary_key), id))
            })
            .ok_or_else(|| {
                QuarryError::validation(format!(
                    "No '{}' row with {} = {}",
                    self.definition.name, self.definition.primary_key, id
                ))
            })?;
        if let Some(obj) = row.as_object_mut() {
            obj.extend(changes);
        }
        Ok(row.clone())
    }
}

// ============================================================================
// FILTER EVALUATION
// ============================================================================

fn field<'a>(row: &'a Value, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}

/// Does `row` satisfy every condition in `filter`?
pub(crate) fn matches_filter(row: &Value, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "AND" => sub_filters(condition).iter().all(|f| matches_filter(row, f)),
        "OR" => sub_filters(condition).iter().any(|f| matches_filter(row, f)),
        "NOT" => !sub_filters(condition).iter().any(|f| matches_filter(row, f)),
        name => matches_condition(field(row, name), condition),
    })
}

fn sub_filters(condition: &Value) -> Vec<&Map<String, Value>> {
    match condition {
        Value::Object(map) => vec![map],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

fn matches_condition(value: &Value, condition: &Value) -> bool {
    let Some(ops) = condition.as_object().filter(|_| is_operator_set(condition)) else {
        return loose_eq(value, condition);
    };
    ops.iter().all(|(op, operand)| match op.as_str() {
        "equals" => loose_eq(value, operand),
        "not" => {
            if is_operator_set(operand) {
                !matches_condition(value, operand)
            } else {
                !loose_eq(value, operand)
            }
        }
        "in" => operand
            .as_array()
            .is_some_and(|items| items.iter().any(|item| loose_eq(value, item))),
        "notIn" => operand
            .as_array()
            .map_or(true, |items| !items.iter().any(|item| loose_eq(value, item))),
        "lt" => compare(value, operand) == Some(CmpOrdering::Less),
        "lte" => matches!(compare(value, operand), Some(CmpOrdering::Less | CmpOrdering::Equal)),
        "gt" => compare(value, operand) == Some(CmpOrdering::Greater),
        "gte" => matches!(
            compare(value, operand),
            Some(CmpOrdering::Greater | CmpOrdering::Equal)
        ),
        "contains" => str_pair(value, operand).is_some_and(|(v, o)| v.contains(o)),
        "startsWith" => str_pair(value, operand).is_some_and(|(v, o)| v.starts_with(o)),
        "endsWith" => str_pair(value, operand).is_some_and(|(v, o)| v.ends_with(o)),
        _ => false,
    })
}

fn str_pair<'a>(value: &'a Value, operand: &'a Value) -> Option<(&'a str, &'a str)> {
    Some((value.as_str()?, operand.as_str()?))
}

/// Equality that treats `1` and `1.0` as the same number.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(CmpOrdering::Equal),
        // Nulls sort last.
        (Value::Null, _) => Some(CmpOrdering::Greater),
        (_, Value::Null) => Some(CmpOrdering::Less),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::OrderBy;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn seeded() -> MemoryConnection {
        MemoryConnection::new("memory://test")
            .with_entity(
                EntityDefinition::new("user")
                    .with_table("users")
                    .with_relation("posts", "posts", "author_id"),
            )
            .with_rows(
                "users",
                vec![
                    json!({ "id": 1, "name": "Ada", "age": 36, "deleted_at": null }),
                    json!({ "id": 2, "name": "Brian", "age": 24, "deleted_at": null }),
                    json!({ "id": 3, "name": "Cleo", "age": 51, "deleted_at": "2024-01-01" }),
                ],
            )
            .with_rows(
                "posts",
                vec![
                    json!({ "id": 10, "author_id": 1, "title": "On engines" }),
                    json!({ "id": 11, "author_id": 1, "title": "Notes" }),
                    json!({ "id": 12, "author_id": 2, "title": "Hello" }),
                ],
            )
    }

    #[test]
    fn test_operators() {
        let row = json!({ "name": "Ada Lovelace", "age": 36, "deleted_at": null });
        let cases = [
            (json!({ "age": { "gt": 30, "lte": 36 } }), true),
            (json!({ "age": { "lt": 30 } }), false),
            (json!({ "age": { "in": [1, 36] } }), true),
            (json!({ "age": { "notIn": [36] } }), false),
            (json!({ "name": { "startsWith": "Ada" } }), true),
            (json!({ "name": { "endsWith": "Ada" } }), false),
            (json!({ "name": { "contains": "Love" } }), true),
            (json!({ "name": { "not": "Ada" } }), true),
            (json!({ "deleted_at": null }), true),
            (json!({ "missing": null }), true),
            (json!({ "age": 36.0 }), true),
        ];
        for (filter, expected) in cases {
            assert_eq!(matches_filter(&row, &obj(filter.clone())), expected, "{}", filter);
        }
    }

    #[test]
    fn test_logical_combinators() {
        let row = json!({ "a": 1, "b": 2 });
        assert!(matches_filter(&row, &obj(json!({ "OR": [{ "a": 5 }, { "b": 2 }] }))));
        assert!(!matches_filter(&row, &obj(json!({ "AND": [{ "a": 1 }, { "b": 3 }] }))));
        assert!(matches_filter(&row, &obj(json!({ "NOT": { "a": 2 } }))));
    }

    #[test]
    fn test_plain_object_is_equality() {
        let row = json!({ "meta": { "equals": 1, "other": 2 } });
        assert!(matches_filter(
            &row,
            &obj(json!({ "meta": { "equals": 1, "other": 2 } }))
        ));
    }

    #[tokio::test]
    async fn test_find_many_orders_paginates_and_projects() {
        let conn = seeded();
        let store = conn.entity("user").unwrap();
        let query = QueryDescriptor {
            select: Some(["name".to_string()].into_iter().collect()),
            order_by: vec![OrderBy::desc("age")],
            skip: Some(1),
            take: Some(1),
            ..Default::default()
        };
        let rows = store.find_many(&query).await.unwrap();
        assert_eq!(rows, vec![json!({ "name": "Ada" })]);
    }

    #[tokio::test]
    async fn test_include_embeds_children() {
        let conn = seeded();
        let store = conn.entity("user").unwrap();
        let query = QueryDescriptor {
            filter: obj(json!({ "id": 1 })),
            include: Some(["posts".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let row = store.find_first(&query).await.unwrap().unwrap();
        assert_eq!(row["posts"].as_array().map(Vec::len), Some(2));

        let bad = QueryDescriptor {
            include: Some(["comments".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(store.find_many(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_count_ignores_pagination() {
        let conn = seeded();
        let store = conn.entity("user").unwrap();
        let query = QueryDescriptor {
            filter: obj(json!({ "deleted_at": null })),
            take: Some(1),
            ..Default::default()
        };
        assert_eq!(store.count(&query).await.unwrap(), 2);
        assert_eq!(conn.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_and_missing_row_errors() {
        let conn = seeded();
        let store = conn.entity("user").unwrap();
        let updated = store
            .update(&json!(2), obj(json!({ "name": "Bryony" })))
            .await
            .unwrap();
        assert_eq!(updated["name"], json!("Bryony"));
        assert_eq!(conn.rows("users")[1]["name"], json!("Bryony"));

        assert!(store.update(&json!(99), Map::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let conn = seeded();

        let committed = conn
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute("UPDATE users SET name = 'x'", &[]).await?;
                    Ok::<_, QuarryError>(7)
                })
            })
            .await
            .unwrap();
        assert_eq!(committed, 7);
        assert_eq!(conn.statements().len(), 1);

        let failed: QuarryResult<()> = conn
            .transaction(|tx| {
                Box::pin(async move {
                    tx.execute("DELETE FROM users", &[]).await?;
                    Err::<(), _>(QuarryError::validation("abort"))
                })
            })
            .await;
        assert!(failed.is_err());
        assert_eq!(conn.statements(), vec!["UPDATE users SET name = 'x'".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let conn = MemoryConnection::new("memory://x");
        conn.fail_next_connects(2);
        assert!(conn.connect().await.is_err());
        assert!(conn.connect().await.is_err());
        assert!(conn.connect().await.is_ok());
        assert!(conn.is_connected());
        assert_eq!(conn.connect_calls(), 3);
    }

    #[test]
    fn test_unknown_entity() {
        let conn = seeded();
        assert!(conn.entity("ghost").is_err());
    }
}
