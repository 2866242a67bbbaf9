use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::faq::FaqChunkMetadata;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    #[default]
    Text,
    Summary,
    ImageOcr,
    ImageCaption,
    Faq,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Text => "text",
            ChunkType::Summary => "summary",
            ChunkType::ImageOcr => "image_ocr",
            ChunkType::ImageCaption => "image_caption",
            ChunkType::Faq => "faq",
        }
    }
}

/// Whether the vector side of a chunk is in sync.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    #[default]
    Stored,
    Indexed,
}

impl ChunkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Stored => "stored",
            ChunkStatus::Indexed => "indexed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ChunkFlags(pub u32);

impl ChunkFlags {
    pub const RECOMMENDED: u32 = 1;

    pub fn has(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    #[must_use]
    pub fn set(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    #[must_use]
    pub fn clear(self, flag: u32) -> Self {
        Self(self.0 & !flag)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageInfo {
    pub url: String,
    #[serde(default)]
    pub original_url: String,
    pub start_pos: i64,
    pub end_pos: i64,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub ocr_text: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedQuestion {
    pub id: String,
    pub question: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    #[serde(default)]
    pub faq: Option<FaqChunkMetadata>,
    #[serde(default)]
    pub generated_questions: Vec<GeneratedQuestion>,
}

/// Narrows a page of FAQ chunks.
#[derive(Debug, Default, Clone)]
pub struct FaqChunkFilter {
    /// Empty matches every tag.
    pub tag_id: String,
    /// Case-insensitive substring of the chunk text; empty matches all.
    pub keyword: String,
}

stored_object!(Chunk, "chunk", {
    tenant_id: u64,
    knowledge_id: String,
    knowledge_base_id: String,
    content: String,
    chunk_index: i64,
    chunk_type: ChunkType,
    is_enabled: bool,
    status: ChunkStatus,
    #[serde(default)]
    start_at: i64,
    #[serde(default)]
    end_at: i64,
    #[serde(default)]
    pre_chunk_id: String,
    #[serde(default)]
    next_chunk_id: String,
    #[serde(default)]
    parent_chunk_id: String,
    #[serde(default)]
    content_hash: String,
    #[serde(default)]
    tag_id: String,
    #[serde(default)]
    flags: ChunkFlags,
    #[serde(default)]
    seq_id: i64,
    #[serde(default)]
    metadata: ChunkMetadata,
    #[serde(default)]
    image_info: Vec<ImageInfo>
});

impl Chunk {
    pub fn new(
        tenant_id: u64,
        knowledge_id: &str,
        knowledge_base_id: &str,
        chunk_type: ChunkType,
        content: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            knowledge_id: knowledge_id.to_string(),
            knowledge_base_id: knowledge_base_id.to_string(),
            content: content.into(),
            chunk_index: 0,
            chunk_type,
            is_enabled: true,
            status: ChunkStatus::Stored,
            start_at: 0,
            end_at: 0,
            pre_chunk_id: String::new(),
            next_chunk_id: String::new(),
            parent_chunk_id: String::new(),
            content_hash: String::new(),
            tag_id: String::new(),
            flags: ChunkFlags::default(),
            seq_id: 0,
            metadata: ChunkMetadata::default(),
            image_info: Vec::new(),
        }
    }

    pub fn faq_metadata(&self) -> Option<&FaqChunkMetadata> {
        self.metadata.faq.as_ref()
    }

    /// Replaces the FAQ metadata and keeps `content_hash` in step with it.
    pub fn set_faq_metadata(&mut self, metadata: FaqChunkMetadata) {
        self.content_hash = metadata.content_hash();
        self.metadata.faq = Some(metadata);
    }

    pub fn is_recommended(&self) -> bool {
        self.flags.has(ChunkFlags::RECOMMENDED)
    }

    /// Persists a batch of new chunks. Chunks without a seq id get one from the
    /// `chunk` sequence, allocated as one contiguous block.
    pub async fn create_batch(
        db: &SurrealDbClient,
        mut chunks: Vec<Chunk>,
    ) -> Result<Vec<Chunk>, AppError> {
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let missing = chunks.iter().filter(|c| c.seq_id <= 0).count();
        if missing > 0 {
            let mut next = db
                .next_sequence(Self::table_name(), i64::try_from(missing).unwrap_or(i64::MAX))
                .await?;
            for chunk in chunks.iter_mut().filter(|c| c.seq_id <= 0) {
                chunk.seq_id = next;
                next = next.saturating_add(1);
            }
        }

        let inserted: Vec<Chunk> = db
            .client
            .insert(Self::table_name())
            .content(chunks)
            .await?;
        Ok(inserted)
    }

    pub async fn save(mut self, db: &SurrealDbClient) -> Result<Chunk, AppError> {
        self.updated_at = chrono::Utc::now();
        let stored = db.upsert_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("chunk was not stored".into()))
    }

    pub async fn mark_indexed(db: &SurrealDbClient, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("UPDATE chunk SET status = $indexed, updated_at = $now WHERE id IN $ids")
            .bind(("ids", record_ids(ids)))
            .bind(("indexed", ChunkStatus::Indexed.as_str()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn list_by_knowledge(
        db: &SurrealDbClient,
        knowledge_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let chunks: Vec<Chunk> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE knowledge_id = $knowledge_id
                 ORDER BY chunk_index ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("knowledge_id", knowledge_id.to_string()))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    pub async fn list_by_knowledge_and_types(
        db: &SurrealDbClient,
        knowledge_id: &str,
        types: &[ChunkType],
    ) -> Result<Vec<Chunk>, AppError> {
        let types: Vec<&'static str> = types.iter().map(ChunkType::as_str).collect();
        let chunks: Vec<Chunk> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE knowledge_id = $knowledge_id AND chunk_type IN $types
                 ORDER BY chunk_index ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("knowledge_id", knowledge_id.to_string()))
            .bind(("types", types))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    pub async fn list_by_ids(db: &SurrealDbClient, ids: &[String]) -> Result<Vec<Chunk>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: Vec<Chunk> = db
            .query("SELECT * FROM chunk WHERE id IN $ids ORDER BY seq_id ASC")
            .bind(("ids", record_ids(ids)))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    pub async fn get_by_seq_id(
        db: &SurrealDbClient,
        tenant_id: u64,
        seq_id: i64,
    ) -> Result<Option<Chunk>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND seq_id = $seq_id
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("seq_id", seq_id))
            .await?;
        let chunk: Option<Chunk> = result.take(0)?;
        Ok(chunk)
    }

    /// Every FAQ chunk in a knowledge base, in seq order.
    pub async fn list_faq_by_knowledge_base(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let chunks: Vec<Chunk> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND knowledge_base_id = $kb_id
                   AND chunk_type = $faq
                 ORDER BY seq_id ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("faq", ChunkType::Faq.as_str()))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    /// One page of the FAQ chunks in a base, in seq order, with the number of
    /// chunks matching `filter` overall.
    pub async fn page_faq_by_knowledge_base(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        filter: &FaqChunkFilter,
        start: usize,
        limit: usize,
    ) -> Result<(Vec<Chunk>, usize), AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            total: usize,
        }

        let mut result = db
            .client
            .query(
                "LET $matching = SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND knowledge_base_id = $kb_id
                   AND chunk_type = $faq
                   AND ($tag_id = '' OR tag_id = $tag_id)
                   AND ($keyword = '' OR string::contains(string::lowercase(content), $keyword));
                 SELECT count() AS total FROM $matching GROUP ALL;
                 SELECT * FROM $matching ORDER BY seq_id ASC LIMIT $limit START $start;",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("faq", ChunkType::Faq.as_str()))
            .bind(("tag_id", filter.tag_id.clone()))
            .bind(("keyword", filter.keyword.trim().to_lowercase()))
            .bind(("limit", limit))
            .bind(("start", start))
            .await?;
        let total: Option<CountRow> = result.take(1)?;
        let chunks: Vec<Chunk> = result.take(2)?;
        Ok((chunks, total.map_or(0, |row| row.total)))
    }

    /// FAQ chunks of a base carrying `tag_id`.
    pub async fn list_faq_by_tag(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        tag_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let chunks: Vec<Chunk> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND knowledge_base_id = $kb_id
                   AND chunk_type = $faq
                   AND tag_id = $tag_id
                 ORDER BY seq_id ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("faq", ChunkType::Faq.as_str()))
            .bind(("tag_id", tag_id.to_string()))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    pub async fn list_by_seq_ids(
        db: &SurrealDbClient,
        tenant_id: u64,
        seq_ids: &[i64],
    ) -> Result<Vec<Chunk>, AppError> {
        if seq_ids.is_empty() {
            return Ok(Vec::new());
        }
        let chunks: Vec<Chunk> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND seq_id IN $seq_ids
                 ORDER BY seq_id ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("seq_ids", seq_ids.to_vec()))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    /// Image sub-chunks hanging off `parent_id`.
    pub async fn list_by_parent(
        db: &SurrealDbClient,
        tenant_id: u64,
        parent_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let chunks: Vec<Chunk> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND parent_chunk_id = $parent_id
                 ORDER BY chunk_index ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("parent_id", parent_id.to_string()))
            .await?
            .take(0)?;
        Ok(chunks)
    }

    /// Removes chunks of a knowledge that never reached `indexed` and returns them.
    pub async fn delete_unindexed(
        db: &SurrealDbClient,
        knowledge_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let deleted: Vec<Chunk> = db
            .query(
                "DELETE FROM chunk
                 WHERE knowledge_id = $knowledge_id AND status = $stored
                 RETURN BEFORE",
            )
            .bind(("knowledge_id", knowledge_id.to_string()))
            .bind(("stored", ChunkStatus::Stored.as_str()))
            .await?
            .take(0)?;
        Ok(deleted)
    }

    pub async fn delete_by_knowledge_ids(
        db: &SurrealDbClient,
        knowledge_ids: &[String],
    ) -> Result<(), AppError> {
        if knowledge_ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("DELETE FROM chunk WHERE knowledge_id IN $knowledge_ids")
            .bind(("knowledge_ids", knowledge_ids.to_vec()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn delete_by_ids(db: &SurrealDbClient, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("DELETE FROM chunk WHERE id IN $ids")
            .bind(("ids", record_ids(ids)))
            .await?
            .check()?;
        Ok(())
    }

    /// Content-hash diff between the FAQ chunks of two knowledge bases.
    /// Returns `(present in source only, present in target only)` as chunk ids.
    pub async fn faq_chunk_diff(
        db: &SurrealDbClient,
        source: (u64, &str),
        target: (u64, &str),
    ) -> Result<(Vec<String>, Vec<String>), AppError> {
        let source_chunks = Self::list_faq_by_knowledge_base(db, source.0, source.1).await?;
        let target_chunks = Self::list_faq_by_knowledge_base(db, target.0, target.1).await?;

        let source_hashes: HashSet<&str> =
            source_chunks.iter().map(|c| c.content_hash.as_str()).collect();
        let target_hashes: HashSet<&str> =
            target_chunks.iter().map(|c| c.content_hash.as_str()).collect();

        let to_add = source_chunks
            .iter()
            .filter(|c| !target_hashes.contains(c.content_hash.as_str()))
            .map(|c| c.id.clone())
            .collect();
        let to_delete = target_chunks
            .iter()
            .filter(|c| !source_hashes.contains(c.content_hash.as_str()))
            .map(|c| c.id.clone())
            .collect();
        Ok((to_add, to_delete))
    }
}

fn record_ids(ids: &[String]) -> Vec<surrealdb::RecordId> {
    ids.iter()
        .map(|id| surrealdb::RecordId::from_table_key(Chunk::table_name(), id))
        .collect()
}
