//! The adapter as a warming source.

use async_trait::async_trait;
use quarry_core::{QuarryResult, QueryOptions};
use quarry_db::{Adapter, Connection};
use serde_json::Value;

use crate::traits::EntitySource;

#[async_trait]
impl<C: Connection> EntitySource for Adapter<C> {
    /// Resolved on the primary so the replica rotation is left alone.
    fn primary_key(&self, entity: &str) -> QuarryResult<String> {
        let store = self.registry().select_for_write().entity(entity)?;
        Ok(store.primary_key().to_string())
    }

    /// Reads go to the next replica unless `options.write` is set.
    async fn load(&self, entity: &str, options: QueryOptions) -> QuarryResult<Vec<Value>> {
        self.query(entity, options).await?.into_many()
    }
}
