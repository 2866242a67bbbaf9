use crate::error::AppError;

use super::types::StoredObject;
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    ///
    /// # Returns
    /// * `SurrealDbClient` initialized
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.build_indexes().await?;
        Ok(())
    }

    pub async fn build_indexes(&self) -> Result<(), Error> {
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_knowledge_kb ON knowledge FIELDS tenant_id, knowledge_base_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_knowledge_hash ON knowledge FIELDS knowledge_base_id, file_hash")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_knowledge ON chunk FIELDS knowledge_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_chunk_kb_seq ON chunk FIELDS knowledge_base_id, seq_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_index_entry_knowledge ON index_entry FIELDS knowledge_id")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_task_state ON background_task FIELDS state, scheduled_at")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_task_dedup ON background_task FIELDS dedup_key")
            .await?;
        self.client
            .query("DEFINE INDEX IF NOT EXISTS idx_tag_name ON knowledge_tag FIELDS tenant_id, knowledge_base_id, name UNIQUE")
            .await?;

        Ok(())
    }

    /// Operation to store a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Replaces the full content of an existing record.
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Operation to retrieve a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to retrieve
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The found item or Error
    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    /// Operation to delete a single object by its ID, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `id` - The ID of the item to delete
    ///
    /// # Returns
    /// * `Result<Option<T>, Error>` - The deleted item or Error
    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Allocates `count` consecutive values from a named counter and returns the first one.
    pub async fn next_sequence(&self, name: &str, count: i64) -> Result<i64, AppError> {
        #[derive(serde::Deserialize)]
        struct Row {
            value: i64,
        }

        let mut result = self
            .client
            .query(
                "UPSERT type::thing('sequence', $name) SET value = (value OR 0) + $count RETURN AFTER;",
            )
            .bind(("name", name.to_string()))
            .bind(("count", count))
            .await?;

        let row: Option<Row> = result.take(0)?;
        let last = row
            .map(|r| r.value)
            .ok_or_else(|| AppError::InternalError(format!("sequence {name} not returned")))?;
        Ok(last.saturating_sub(count).saturating_add(1))
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
