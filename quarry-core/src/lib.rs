//! Quarry Core - shared types for the data-access layer
//!
//! Errors, construction config, query descriptors and the input guards used
//! by `quarry-db` and `quarry-cache`. This crate performs no I/O.

pub mod config;
pub mod error;
pub mod health;
pub mod query;
pub mod sanitize;

pub use config::{
    AdapterConfig, CacheSettings, EntityDefinition, ErrorFormat, LogLevel, PoolConfig,
    RedisSettings, RelationDefinition, ReplicationConfig, DATABASE_URL_ENV, REDIS_URL_ENV,
};
pub use error::{ErrorCause, ErrorKind, QuarryError, QuarryResult};
pub use health::{overall_status, HealthCheck, HealthStatus};
pub use query::{
    ExecutionMode, OrderBy, QueryDescriptor, QueryOptions, QueryOutput, RowTransform,
    SortDirection, DEFAULT_PER_PAGE,
};
pub use sanitize::{
    quote_identifier, sanitize_str, sanitize_value, validate_identifier, validate_params,
    validate_read_only,
};
