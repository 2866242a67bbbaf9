use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            index_entry::{IndexEntry, IndexEntryKey},
            knowledge::KnowledgeType,
        },
    },
};
use tracing::{debug, info};

use crate::services::{EmbeddingModel, IndexInfo, RetrievalEngine, SearchHit, SearchParams};

const FLOAT_BYTES: i64 = 4;
/// Rows fetched per requested hit; a chunk can own several index rows.
const SEARCH_OVERFETCH: usize = 4;

/// Keeps one `index_entry` row per indexed text, embedding included.
pub struct SurrealRetrievalEngine {
    db: Arc<SurrealDbClient>,
    embed_batch_size: usize,
}

impl SurrealRetrievalEngine {
    pub fn new(db: Arc<SurrealDbClient>, embed_batch_size: usize) -> Self {
        Self {
            db,
            embed_batch_size: embed_batch_size.max(1),
        }
    }
}

/// Rewrites a source id onto a new chunk id, keeping any `-suffix`.
fn remap_source_id(source_id: &str, old_chunk: &str, new_chunk: &str) -> String {
    match source_id.strip_prefix(old_chunk) {
        Some("") => new_chunk.to_string(),
        Some(rest) if rest.starts_with('-') => format!("{new_chunk}{rest}"),
        _ => source_id.to_string(),
    }
}

#[async_trait]
impl RetrievalEngine for SurrealRetrievalEngine {
    async fn batch_index(
        &self,
        tenant_id: u64,
        model: &dyn EmbeddingModel,
        infos: &[IndexInfo],
    ) -> Result<(), AppError> {
        for batch in infos.chunks(self.embed_batch_size) {
            let texts: Vec<String> = batch.iter().map(|info| info.content.clone()).collect();
            let embeddings = model.embed_batch(texts).await?;
            if embeddings.len() != batch.len() {
                return Err(AppError::Processing(format!(
                    "expected {} embeddings, received {}",
                    batch.len(),
                    embeddings.len()
                )));
            }

            let now = Utc::now();
            let entries = batch
                .iter()
                .zip(embeddings)
                .map(|(info, embedding)| IndexEntry {
                    id: info.source_id.clone(),
                    created_at: now,
                    updated_at: now,
                    tenant_id,
                    source_id: info.source_id.clone(),
                    chunk_id: info.chunk_id.clone(),
                    knowledge_id: info.knowledge_id.clone(),
                    knowledge_base_id: info.knowledge_base_id.clone(),
                    knowledge_type: info.knowledge_type,
                    tag_id: info.tag_id.clone(),
                    is_enabled: info.is_enabled,
                    is_recommended: info.is_recommended,
                    content: info.content.clone(),
                    embedding,
                    embedding_model_id: model.id().to_string(),
                    dimensions: model.dimensions(),
                })
                .collect();
            IndexEntry::upsert_batch(&self.db, entries).await?;
        }
        debug!(tenant_id, entries = infos.len(), model = model.id(), "indexed entries");
        Ok(())
    }

    async fn delete_by_knowledge_ids(
        &self,
        tenant_id: u64,
        knowledge_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        let removed = IndexEntry::delete_where_in(
            &self.db,
            IndexEntryKey::KnowledgeId,
            knowledge_ids,
            tenant_id,
            dimensions,
            knowledge_type,
        )
        .await?;
        debug!(tenant_id, removed, "deleted index entries by knowledge");
        Ok(())
    }

    async fn delete_by_chunk_ids(
        &self,
        tenant_id: u64,
        chunk_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        IndexEntry::delete_where_in(
            &self.db,
            IndexEntryKey::ChunkId,
            chunk_ids,
            tenant_id,
            dimensions,
            knowledge_type,
        )
        .await?;
        Ok(())
    }

    async fn delete_by_source_ids(
        &self,
        tenant_id: u64,
        source_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        IndexEntry::delete_where_in(
            &self.db,
            IndexEntryKey::SourceId,
            source_ids,
            tenant_id,
            dimensions,
            knowledge_type,
        )
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: u64,
        model: &dyn EmbeddingModel,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, AppError> {
        let embedding = model
            .embed_batch(vec![params.query.clone()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Processing("no embedding returned for query".into()))?;
        let rows = IndexEntry::search(
            &self.db,
            tenant_id,
            &params.knowledge_base_id,
            embedding,
            &params.tag_ids,
            params.vector_threshold,
            params.match_count.saturating_mul(SEARCH_OVERFETCH),
        )
        .await?;

        let mut seen = HashSet::new();
        let hits: Vec<SearchHit> = rows
            .into_iter()
            .filter(|row| seen.insert(row.chunk_id.clone()))
            .take(params.match_count)
            .map(|row| SearchHit {
                chunk_id: row.chunk_id,
                score: row.score,
                matched_content: row.content,
            })
            .collect();
        debug!(tenant_id, kb_id = %params.knowledge_base_id, hits = hits.len(), "searched index");
        Ok(hits)
    }

    fn estimate_storage_size(&self, model: &dyn EmbeddingModel, infos: &[IndexInfo]) -> i64 {
        let vector_bytes = i64::from(model.dimensions()).saturating_mul(FLOAT_BYTES);
        infos.iter().fold(0_i64, |total, info| {
            let content = i64::try_from(info.content.len()).unwrap_or(i64::MAX);
            total.saturating_add(content.saturating_add(vector_bytes))
        })
    }

    async fn copy_indices(
        &self,
        target_tenant: u64,
        source_kb: &str,
        target_kb: &str,
        knowledge_map: &HashMap<String, String>,
        chunk_map: &HashMap<String, String>,
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let copies: Vec<IndexEntry> = IndexEntry::list_by_knowledge_base(&self.db, source_kb)
            .await?
            .into_iter()
            .filter(|entry| entry.dimensions == dimensions && entry.knowledge_type == knowledge_type)
            .filter_map(|entry| {
                let knowledge_id = knowledge_map.get(&entry.knowledge_id)?;
                let chunk_id = chunk_map.get(&entry.chunk_id)?;
                let source_id = remap_source_id(&entry.source_id, &entry.chunk_id, chunk_id);
                Some(IndexEntry {
                    id: source_id.clone(),
                    created_at: now,
                    updated_at: now,
                    tenant_id: target_tenant,
                    source_id,
                    chunk_id: chunk_id.clone(),
                    knowledge_id: knowledge_id.clone(),
                    knowledge_base_id: target_kb.to_string(),
                    ..entry
                })
            })
            .collect();

        let copied = copies.len();
        IndexEntry::upsert_batch(&self.db, copies).await?;
        info!(%source_kb, %target_kb, copied, "copied index entries");
        Ok(())
    }

    async fn batch_update_chunk_enabled_status(
        &self,
        updates: &HashMap<String, bool>,
    ) -> Result<(), AppError> {
        IndexEntry::set_enabled(&self.db, updates).await
    }

    async fn batch_update_chunk_tag(
        &self,
        updates: &HashMap<String, String>,
    ) -> Result<(), AppError> {
        IndexEntry::set_tag(&self.db, updates).await
    }
}
