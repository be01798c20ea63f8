//! Query descriptors and options.
//!
//! A [`QueryDescriptor`] is the structured description a connection turns
//! into a database request. It is accumulated by the fluent builder in
//! `quarry-db`, or seeded directly from [`QueryOptions`].

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{QuarryError, QuarryResult};

/// Rows per page when `page()` is called before any `per_page()`.
pub const DEFAULT_PER_PAGE: u64 = 10;

/// Post-processing applied to each row of a list result.
pub type RowTransform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

// ============================================================================
// ORDERING
// ============================================================================

/// Sort direction for an `ORDER BY` term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[serde(alias = "ascending")]
    Asc,
    #[serde(alias = "descending")]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Asc),
            "desc" | "descending" => Ok(SortDirection::Desc),
            other => Err(QuarryError::validation(format!(
                "Invalid sort direction '{}', expected asc or desc",
                other
            ))),
        }
    }
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => f.write_str("asc"),
            SortDirection::Desc => f.write_str("desc"),
        }
    }
}

/// One `{field: direction}` ordering term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, direction: SortDirection) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Asc)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, SortDirection::Desc)
    }
}

// ============================================================================
// EXECUTION MODE
// ============================================================================

/// What `execute()` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    List,
    Single,
    Count,
}

// ============================================================================
// QUERY OPTIONS
// ============================================================================

/// Options accepted by the adapter's `query` entry point and used to seed a
/// builder.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub include: Option<Vec<String>>,
    #[serde(rename = "where")]
    pub filter: Option<Map<String, Value>>,
    pub order_by: Vec<OrderBy>,
    pub page: Option<u64>,
    pub per_page: Option<u64>,
    /// Route to the write connection instead of a replica.
    pub write: bool,
    pub mode: ExecutionMode,
    #[serde(skip)]
    pub transform: Option<RowTransform>,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("select", &self.select)
            .field("include", &self.include)
            .field("filter", &self.filter)
            .field("order_by", &self.order_by)
            .field("page", &self.page)
            .field("per_page", &self.per_page)
            .field("write", &self.write)
            .field("mode", &self.mode)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_include<I, S>(mut self, relations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(relations.into_iter().map(Into::into).collect());
        self
    }

    /// Set the filter. Values are sanitized when the options seed a builder.
    pub fn with_filter(mut self, filter: Map<String, Value>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_order(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn with_page(mut self, page: u64, per_page: u64) -> Self {
        self.page = Some(page);
        self.per_page = Some(per_page);
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }
}

// ============================================================================
// QUERY DESCRIPTOR
// ============================================================================

/// Builder-accumulated description of a structured query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryDescriptor {
    /// Projected fields; `None` selects every column.
    pub select: Option<BTreeSet<String>>,
    /// Related entities to embed.
    pub include: Option<BTreeSet<String>>,
    /// Field → (sanitized) value. Merged across `where` calls.
    pub filter: Map<String, Value>,
    /// Append-only ordering terms.
    pub order_by: Vec<OrderBy>,
    pub skip: Option<u64>,
    pub take: Option<u64>,
    pub count: bool,
    pub single: bool,
}

impl QueryDescriptor {
    /// Effective mode. `count` wins over `single` when both are set.
    pub fn mode(&self) -> ExecutionMode {
        if self.count {
            ExecutionMode::Count
        } else if self.single {
            ExecutionMode::Single
        } else {
            ExecutionMode::List
        }
    }

    /// Descriptor that matches rows whose `key` is one of `ids`.
    pub fn by_ids(key: &str, ids: Vec<Value>) -> Self {
        let mut filter = Map::new();
        let mut op = Map::new();
        op.insert("in".to_string(), Value::Array(ids));
        filter.insert(key.to_string(), Value::Object(op));
        Self {
            filter,
            ..Default::default()
        }
    }
}

// ============================================================================
// QUERY OUTPUT
// ============================================================================

/// Result of executing a query: a list, at most one row, or a count.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Many(Vec<Value>),
    One(Option<Value>),
    Count(u64),
}

impl QueryOutput {
    pub fn into_many(self) -> QuarryResult<Vec<Value>> {
        match self {
            QueryOutput::Many(rows) => Ok(rows),
            other => Err(mode_mismatch("list", &other)),
        }
    }

    pub fn into_one(self) -> QuarryResult<Option<Value>> {
        match self {
            QueryOutput::One(row) => Ok(row),
            other => Err(mode_mismatch("single", &other)),
        }
    }

    pub fn into_count(self) -> QuarryResult<u64> {
        match self {
            QueryOutput::Count(n) => Ok(n),
            other => Err(mode_mismatch("count", &other)),
        }
    }

    /// Deserialize a list result into typed rows.
    pub fn decode_many<T: DeserializeOwned>(self) -> QuarryResult<Vec<T>> {
        self.into_many()?
            .into_iter()
            .map(|row| serde_json::from_value(row).map_err(decode_error))
            .collect()
    }

    /// Deserialize a single-row result.
    pub fn decode_one<T: DeserializeOwned>(self) -> QuarryResult<Option<T>> {
        self.into_one()?
            .map(|row| serde_json::from_value(row).map_err(decode_error))
            .transpose()
    }
}

fn mode_mismatch(expected: &str, got: &QueryOutput) -> QuarryError {
    let got = match got {
        QueryOutput::Many(_) => "list",
        QueryOutput::One(_) => "single",
        QueryOutput::Count(_) => "count",
    };
    QuarryError::validation(format!("Expected a {} result, got a {} result", expected, got))
}

fn decode_error(err: serde_json::Error) -> QuarryError {
    QuarryError::validation("Row does not match the requested type").with_source(err)
}
