//! Quarry DB - replica-aware database access
//!
//! One write connection, a round-robin read pool, a fluent query builder
//! and a PostgreSQL connection built on deadpool.
//!
//! # Example
//!
//! ```ignore
//! use quarry_core::{AdapterConfig, QueryOptions};
//! use quarry_db::Adapter;
//!
//! let adapter = Adapter::from_config(AdapterConfig::from_env()?)?;
//! adapter.connect().await?;
//! let users = adapter.query("user", QueryOptions::new()).await?.into_many()?;
//! ```

pub mod adapter;
pub mod builder;
pub mod connection;
pub mod memory;
pub mod postgres;
pub mod registry;
pub mod sql;

pub use adapter::{Adapter, DEFAULT_RETRY_DELAY};
pub use builder::{QueryBuilder, DEFAULT_RAW_TIMEOUT};
pub use connection::{Connection, EntityStore, TransactionFuture, TransactionHandle};
pub use memory::MemoryConnection;
pub use postgres::{pg_error, pool_error, redact_url, PgConnection, SqlParam};
pub use registry::{ConnectionRegistry, PING_SQL};
