//! Adapter Configuration Module
//!
//! Construction-time configuration for the adapter, the cache and logging.
//! Configuration can be built in code, deserialized (TOML/JSON, camelCase
//! keys) or loaded from environment variables. Whatever the source,
//! [`AdapterConfig::validate`] runs before anything is constructed and the
//! first failure is returned; nothing is partially applied.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, QuarryResult};
use crate::sanitize::validate_identifier;

/// Environment variable holding the primary database URL.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Environment variable holding the key-value store URL.
pub const REDIS_URL_ENV: &str = "REDIS_URL";

// ============================================================================
// LOGGING OPTIONS
// ============================================================================

/// Log categories that can be switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Query,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Query => "query",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "query" => Ok(LogLevel::Query),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(QuarryError::config(format!(
                "Unknown log level '{}', expected one of query, info, warn, error",
                other
            ))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorFormat {
    Pretty,
    #[default]
    Colorless,
    Minimal,
}

impl FromStr for ErrorFormat {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(ErrorFormat::Pretty),
            "colorless" => Ok(ErrorFormat::Colorless),
            "minimal" => Ok(ErrorFormat::Minimal),
            other => Err(QuarryError::config(format!(
                "Unknown error format '{}', expected one of pretty, colorless, minimal",
                other
            ))),
        }
    }
}

// ============================================================================
// POOL / REPLICATION / CACHE SECTIONS
// ============================================================================

/// Connection pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub min: u32,
    pub max: u32,
    pub idle_ms: u64,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            idle_ms: 10_000,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Read replica endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplicationConfig {
    pub enabled: bool,
    pub reads: Vec<String>,
}

/// Key-value store endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisSettings {
    pub url: Option<String>,
    pub cluster: bool,
    pub nodes: Vec<String>,
}

/// Cache section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSettings {
    pub enabled: bool,
    pub redis: RedisSettings,
    pub ttl_seconds: u64,
    /// Entry count at which `set` starts evicting.
    pub max_size: u64,
    pub invalidate_on_write: bool,
    pub key_prefix: String,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            redis: RedisSettings::default(),
            ttl_seconds: 3600,
            max_size: 10_000,
            invalidate_on_write: true,
            key_prefix: "quarry".to_string(),
        }
    }
}

impl CacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

// ============================================================================
// ENTITY MAPPING
// ============================================================================

/// A related entity reachable from a parent row through a foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelationDefinition {
    pub name: String,
    pub table: String,
    /// Column on the related table that references the parent's key.
    pub foreign_key: String,
}

/// Mapping from an entity name to its table, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDefinition {
    pub name: String,
    pub table: String,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default = "default_soft_delete_field")]
    pub soft_delete_field: String,
    #[serde(default)]
    pub relations: Vec<RelationDefinition>,
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_soft_delete_field() -> String {
    "deleted_at".to_string()
}

impl EntityDefinition {
    /// Entity whose table has the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            primary_key: default_primary_key(),
            soft_delete_field: default_soft_delete_field(),
            relations: Vec::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_primary_key(mut self, key: impl Into<String>) -> Self {
        self.primary_key = key.into();
        self
    }

    pub fn with_relation(
        mut self,
        name: impl Into<String>,
        table: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        self.relations.push(RelationDefinition {
            name: name.into(),
            table: table.into(),
            foreign_key: foreign_key.into(),
        });
        self
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDefinition> {
        self.relations.iter().find(|r| r.name == name)
    }

    fn validate(&self) -> QuarryResult<()> {
        let checks = [
            ("table", &self.table),
            ("primaryKey", &self.primary_key),
            ("softDeleteField", &self.soft_delete_field),
        ];
        for (field, value) in checks {
            validate_identifier(value).map_err(|e| {
                QuarryError::config(format!(
                    "Entity '{}' has an invalid {}: {}",
                    self.name,
                    field,
                    e.message()
                ))
            })?;
        }
        for relation in &self.relations {
            for value in [&relation.name, &relation.table, &relation.foreign_key] {
                validate_identifier(value).map_err(|e| {
                    QuarryError::config(format!(
                        "Relation '{}' of entity '{}' is invalid: {}",
                        relation.name,
                        self.name,
                        e.message()
                    ))
                })?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// ADAPTER CONFIGURATION
// ============================================================================

/// Top-level construction config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdapterConfig {
    /// Primary database URL. Falls back to `DATABASE_URL` when unset.
    pub url: Option<String>,
    pub log: BTreeSet<LogLevel>,
    pub error_format: ErrorFormat,
    pub pool: PoolConfig,
    pub replication: ReplicationConfig,
    pub cache: CacheSettings,
    pub soft_delete: bool,
    /// Deadline for raw queries.
    pub query_timeout_ms: u64,
    /// Extra attempts made by `connect` after the first failure.
    pub connect_retries: u32,
    pub entities: Vec<EntityDefinition>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            url: None,
            log: [LogLevel::Warn, LogLevel::Error].into_iter().collect(),
            error_format: ErrorFormat::default(),
            pool: PoolConfig::default(),
            replication: ReplicationConfig::default(),
            cache: CacheSettings::default(),
            soft_delete: false,
            query_timeout_ms: 5_000,
            connect_retries: 3,
            entities: Vec::new(),
        }
    }
}

impl AdapterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: primary database (required at validation time)
    /// - `REDIS_URL`: enables the cache when set
    /// - `QUARRY_REDIS_CLUSTER_NODES`: comma-separated; enables cluster mode
    /// - `QUARRY_READ_REPLICAS`: comma-separated; enables replication
    /// - `QUARRY_LOG`: comma-separated log levels (default: warn,error)
    /// - `QUARRY_ERROR_FORMAT`: pretty | colorless | minimal
    /// - `QUARRY_POOL_MIN` / `QUARRY_POOL_MAX` (default: 2 / 10)
    /// - `QUARRY_POOL_IDLE_MS` / `QUARRY_POOL_ACQUIRE_TIMEOUT_MS`
    /// - `QUARRY_CACHE_TTL_SECS` (default: 3600)
    /// - `QUARRY_CACHE_MAX_SIZE` (default: 10000)
    /// - `QUARRY_CACHE_INVALIDATE_ON_WRITE` (default: true)
    /// - `QUARRY_SOFT_DELETE` (default: false)
    /// - `QUARRY_QUERY_TIMEOUT_MS` (default: 5000)
    /// - `QUARRY_CONNECT_RETRIES` (default: 3)
    ///
    /// Unparseable numbers fall back to their defaults with a warning;
    /// unknown log levels or formats are errors.
    pub fn from_env() -> QuarryResult<Self> {
        let defaults = Self::default();

        let log = match std::env::var("QUARRY_LOG") {
            Ok(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(LogLevel::from_str)
                .collect::<QuarryResult<BTreeSet<_>>>()?,
            Err(_) => defaults.log,
        };

        let error_format = match std::env::var("QUARRY_ERROR_FORMAT") {
            Ok(raw) => raw.parse()?,
            Err(_) => ErrorFormat::default(),
        };

        let reads = env_list("QUARRY_READ_REPLICAS");
        let nodes = env_list("QUARRY_REDIS_CLUSTER_NODES");
        let redis_url = std::env::var(REDIS_URL_ENV).ok().filter(|s| !s.is_empty());
        let cache_defaults = CacheSettings::default();

        Ok(Self {
            url: std::env::var(DATABASE_URL_ENV).ok().filter(|s| !s.is_empty()),
            log,
            error_format,
            pool: PoolConfig {
                min: env_parse("QUARRY_POOL_MIN", defaults.pool.min),
                max: env_parse("QUARRY_POOL_MAX", defaults.pool.max),
                idle_ms: env_parse("QUARRY_POOL_IDLE_MS", defaults.pool.idle_ms),
                acquire_timeout_ms: env_parse(
                    "QUARRY_POOL_ACQUIRE_TIMEOUT_MS",
                    defaults.pool.acquire_timeout_ms,
                ),
            },
            replication: ReplicationConfig {
                enabled: !reads.is_empty(),
                reads,
            },
            cache: CacheSettings {
                enabled: redis_url.is_some() || !nodes.is_empty(),
                redis: RedisSettings {
                    url: redis_url,
                    cluster: !nodes.is_empty(),
                    nodes,
                },
                ttl_seconds: env_parse("QUARRY_CACHE_TTL_SECS", cache_defaults.ttl_seconds),
                max_size: env_parse("QUARRY_CACHE_MAX_SIZE", cache_defaults.max_size),
                invalidate_on_write: env_parse(
                    "QUARRY_CACHE_INVALIDATE_ON_WRITE",
                    cache_defaults.invalidate_on_write,
                ),
                key_prefix: cache_defaults.key_prefix,
            },
            soft_delete: env_parse("QUARRY_SOFT_DELETE", defaults.soft_delete),
            query_timeout_ms: env_parse("QUARRY_QUERY_TIMEOUT_MS", defaults.query_timeout_ms),
            connect_retries: env_parse("QUARRY_CONNECT_RETRIES", defaults.connect_retries),
            entities: Vec::new(),
        })
    }

    /// Parse a TOML document (camelCase keys, every section optional).
    pub fn from_toml_str(raw: &str) -> QuarryResult<Self> {
        toml::from_str(raw)
            .map_err(|e| QuarryError::config("Invalid TOML configuration").with_source(e))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_replicas<I, S>(mut self, reads: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.replication = ReplicationConfig {
            enabled: true,
            reads: reads.into_iter().map(Into::into).collect(),
        };
        self
    }

    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_log_levels<I: IntoIterator<Item = LogLevel>>(mut self, levels: I) -> Self {
        self.log = levels.into_iter().collect();
        self
    }

    pub fn with_error_format(mut self, format: ErrorFormat) -> Self {
        self.error_format = format;
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = enabled;
        self
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_retries(mut self, retries: u32) -> Self {
        self.connect_retries = retries;
        self
    }

    pub fn with_entity(mut self, entity: EntityDefinition) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    /// Explicit URL, or `DATABASE_URL`.
    pub fn resolved_url(&self) -> QuarryResult<String> {
        self.url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .or_else(|| std::env::var(DATABASE_URL_ENV).ok().filter(|u| !u.trim().is_empty()))
            .ok_or_else(|| {
                QuarryError::config(format!(
                    "A database URL is required (set `url` or {})",
                    DATABASE_URL_ENV
                ))
            })
    }

    /// Read endpoints that will actually be opened.
    pub fn replica_urls(&self) -> &[String] {
        if self.replication.enabled {
            &self.replication.reads
        } else {
            &[]
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDefinition> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Check every constraint and return the first violation.
    pub fn validate(&self) -> QuarryResult<()> {
        self.resolved_url()?;

        if self.pool.max == 0 {
            return Err(QuarryError::config("pool.max must be greater than 0"));
        }
        if self.pool.min > self.pool.max {
            return Err(QuarryError::config(format!(
                "pool.min ({}) must not exceed pool.max ({})",
                self.pool.min, self.pool.max
            )));
        }

        if self.replication.enabled
            && self.replication.reads.iter().any(|u| u.trim().is_empty())
        {
            return Err(QuarryError::config(
                "replication.reads must not contain empty URLs",
            ));
        }

        self.validate_cache()?;

        let mut seen = HashSet::new();
        for entity in &self.entities {
            if !seen.insert(entity.name.as_str()) {
                return Err(QuarryError::config(format!(
                    "Entity '{}' is defined more than once",
                    entity.name
                )));
            }
            entity.validate()?;
        }

        Ok(())
    }

    fn validate_cache(&self) -> QuarryResult<()> {
        let cache = &self.cache;
        if !cache.enabled {
            return Ok(());
        }
        if cache.redis.cluster {
            if cache.redis.nodes.is_empty() {
                return Err(QuarryError::config(
                    "cache.redis.cluster requires at least one node",
                ));
            }
        } else if cache.redis.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
            return Err(QuarryError::config(
                "cache.enabled requires cache.redis.url",
            ));
        }
        if cache.max_size == 0 {
            return Err(QuarryError::config("cache.maxSize must be greater than 0"));
        }
        Ok(())
    }
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .ok()
        .map(|s| {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn env_parse<T>(name: &str, default: T) -> T
where
    T: FromStr + fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(variable = name, value = %raw, %default, "Unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
