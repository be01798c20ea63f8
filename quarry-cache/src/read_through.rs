//! Cache-aside reads and invalidating writes over an [`Adapter`].

use std::sync::Arc;

use quarry_core::{ExecutionMode, QuarryError, QuarryResult, QueryOptions};
use quarry_db::{Adapter, Connection};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::entity_cache::EntityCache;
use crate::traits::{EntitySource, KeyValueStore};

/// Pairs an adapter with an entity cache.
///
/// Reads check the cache first and populate it on a miss. Writes go to the
/// primary and, when `invalidate_on_write` is set, drop the cached entry
/// afterwards. The cache is never written with data that did not come from
/// the database.
pub struct CachedReader<C: Connection, S: KeyValueStore> {
    adapter: Arc<Adapter<C>>,
    cache: Arc<EntityCache<S>>,
    invalidate_on_write: bool,
}

impl<C: Connection, S: KeyValueStore> CachedReader<C, S> {
    /// `invalidate_on_write` is taken from the adapter's cache settings.
    pub fn new(adapter: Arc<Adapter<C>>, cache: Arc<EntityCache<S>>) -> Self {
        let invalidate_on_write = adapter.config().cache.invalidate_on_write;
        Self {
            adapter,
            cache,
            invalidate_on_write,
        }
    }

    pub fn with_invalidate_on_write(mut self, enabled: bool) -> Self {
        self.invalidate_on_write = enabled;
        self
    }

    pub fn adapter(&self) -> &Adapter<C> {
        &self.adapter
    }

    pub fn cache(&self) -> &EntityCache<S> {
        &self.cache
    }

    /// Cached row for `(entity, id)`, loading it from a replica on a miss.
    ///
    /// A failure to populate the cache is logged; the loaded row is still
    /// returned.
    pub async fn get_or_load(&self, entity: &str, id: &Value) -> QuarryResult<Option<Value>> {
        if let Some(row) = self.cache.get::<Value>(entity, id).await {
            return Ok(Some(row));
        }

        let pk = self.adapter.primary_key(entity)?;
        let mut filter = Map::new();
        filter.insert(pk, id.clone());
        let options = QueryOptions::new()
            .with_filter(filter)
            .with_mode(ExecutionMode::Single);

        let row = self.adapter.query(entity, options).await?.into_one()?;
        if let Some(row) = &row {
            if let Err(err) = self.cache.set(entity, id, row, None).await {
                warn!(target: "quarry::cache", entity, %id, error = %err, "Failed to populate cache");
            }
        }
        Ok(row)
    }

    /// [`get_or_load`](Self::get_or_load) decoded into `T`.
    pub async fn get_or_load_as<T: DeserializeOwned>(
        &self,
        entity: &str,
        id: &Value,
    ) -> QuarryResult<Option<T>> {
        self.get_or_load(entity, id)
            .await?
            .map(|row| {
                serde_json::from_value(row).map_err(|e| {
                    QuarryError::validation("Row does not match the requested type").with_source(e)
                })
            })
            .transpose()
    }

    /// Update on the primary, then invalidate the cached row.
    pub async fn update(
        &self,
        entity: &str,
        id: &Value,
        changes: Map<String, Value>,
    ) -> QuarryResult<Value> {
        let row = self.adapter.update(entity, id, changes).await?;
        if self.invalidate_on_write {
            self.cache.del(entity, id).await?;
        }
        Ok(row)
    }

    /// Soft delete on the primary, then invalidate the cached row.
    pub async fn soft_delete(&self, entity: &str, id: &Value) -> bool {
        if !self.adapter.soft_delete(entity, id).await {
            return false;
        }
        if self.invalidate_on_write {
            if let Err(err) = self.cache.del(entity, id).await {
                error!(target: "quarry::cache", entity, %id, error = %err, "Failed to invalidate soft-deleted row");
            }
        }
        true
    }
}
