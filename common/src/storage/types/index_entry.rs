use std::collections::HashMap;

use serde::Deserialize;
use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::knowledge::KnowledgeType;

stored_object!(IndexEntry, "index_entry", {
    tenant_id: u64,
    /// Chunk id, or `"{chunk_id}-{n}"` for extra entries of one chunk.
    source_id: String,
    chunk_id: String,
    knowledge_id: String,
    knowledge_base_id: String,
    knowledge_type: KnowledgeType,
    #[serde(default)]
    tag_id: String,
    is_enabled: bool,
    #[serde(default)]
    is_recommended: bool,
    content: String,
    embedding: Vec<f32>,
    embedding_model_id: String,
    dimensions: u32
});

impl IndexEntry {
    /// Inserts or replaces entries keyed by their source id.
    pub async fn upsert_batch(db: &SurrealDbClient, entries: Vec<IndexEntry>) -> Result<(), AppError> {
        for entry in entries {
            db.upsert_item(entry).await?;
        }
        Ok(())
    }

    pub async fn list_by_knowledge(
        db: &SurrealDbClient,
        knowledge_id: &str,
    ) -> Result<Vec<IndexEntry>, AppError> {
        let entries: Vec<IndexEntry> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE knowledge_id = $knowledge_id
                 ORDER BY source_id ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("knowledge_id", knowledge_id.to_string()))
            .await?
            .take(0)?;
        Ok(entries)
    }

    pub async fn list_by_knowledge_base(
        db: &SurrealDbClient,
        knowledge_base_id: &str,
    ) -> Result<Vec<IndexEntry>, AppError> {
        let entries: Vec<IndexEntry> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE knowledge_base_id = $kb_id
                 ORDER BY source_id ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .await?
            .take(0)?;
        Ok(entries)
    }

    /// Deletes entries whose `field` value is in `values`, scoped to one
    /// tenant, embedding width and knowledge type.
    pub async fn delete_where_in(
        db: &SurrealDbClient,
        field: IndexEntryKey,
        values: &[String],
        tenant_id: u64,
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<usize, AppError> {
        if values.is_empty() {
            return Ok(0);
        }
        let query = format!(
            "DELETE FROM index_entry
             WHERE {} IN $values
               AND tenant_id = $tenant_id
               AND dimensions = $dimensions
               AND knowledge_type = $knowledge_type
             RETURN BEFORE",
            field.column()
        );
        let removed: Vec<IndexEntry> = db
            .query(query)
            .bind(("values", values.to_vec()))
            .bind(("tenant_id", tenant_id))
            .bind(("dimensions", dimensions))
            .bind(("knowledge_type", knowledge_type.as_str()))
            .await?
            .take(0)?;
        Ok(removed.len())
    }

    /// Enabled entries of one base ranked by cosine similarity to
    /// `embedding`, best first. Entries scoring below `threshold` are
    /// dropped; an empty `tag_ids` matches every tag.
    pub async fn search(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        embedding: Vec<f32>,
        tag_ids: &[String],
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, AppError> {
        let dimensions = u32::try_from(embedding.len()).unwrap_or(u32::MAX);
        let hits: Vec<ScoredEntry> = db
            .query(
                "SELECT * FROM (
                    SELECT source_id, chunk_id, content,
                           vector::similarity::cosine(embedding, $embedding) AS score
                    FROM type::table($table)
                    WHERE tenant_id = $tenant_id
                      AND knowledge_base_id = $kb_id
                      AND is_enabled = true
                      AND dimensions = $dimensions
                      AND (array::len($tag_ids) = 0 OR tag_id IN $tag_ids)
                 )
                 WHERE score >= $threshold
                 ORDER BY score DESC
                 LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("embedding", embedding))
            .bind(("dimensions", dimensions))
            .bind(("tag_ids", tag_ids.to_vec()))
            .bind(("threshold", threshold))
            .bind(("limit", limit))
            .await?
            .take(0)?;
        Ok(hits)
    }

    pub async fn set_enabled(
        db: &SurrealDbClient,
        updates: &HashMap<String, bool>,
    ) -> Result<(), AppError> {
        for (chunk_id, enabled) in updates {
            db.client
                .query(
                    "UPDATE index_entry SET is_enabled = $enabled, updated_at = $now
                     WHERE chunk_id = $chunk_id",
                )
                .bind(("chunk_id", chunk_id.clone()))
                .bind(("enabled", *enabled))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .await?
                .check()?;
        }
        Ok(())
    }

    pub async fn set_tag(
        db: &SurrealDbClient,
        updates: &HashMap<String, String>,
    ) -> Result<(), AppError> {
        for (chunk_id, tag_id) in updates {
            db.client
                .query(
                    "UPDATE index_entry SET tag_id = $tag_id, updated_at = $now
                     WHERE chunk_id = $chunk_id",
                )
                .bind(("chunk_id", chunk_id.clone()))
                .bind(("tag_id", tag_id.clone()))
                .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
                .await?
                .check()?;
        }
        Ok(())
    }
}

/// An index entry ranked against a query vector.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScoredEntry {
    pub source_id: String,
    pub chunk_id: String,
    pub content: String,
    pub score: f64,
}

/// Columns `delete_where_in` may filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexEntryKey {
    KnowledgeId,
    ChunkId,
    SourceId,
}

impl IndexEntryKey {
    fn column(self) -> &'static str {
        match self {
            IndexEntryKey::KnowledgeId => "knowledge_id",
            IndexEntryKey::ChunkId => "chunk_id",
            IndexEntryKey::SourceId => "source_id",
        }
    }
}
