//! FAQ knowledge bases: batch imports with validation and resumable commits,
//! single-entry edits with incremental re-indexing, and CSV exports.
//!
//! All entries of a FAQ base live as `faq` chunks under one container
//! knowledge, created on first use.

mod content;
mod entries;
mod import;
mod queries;
mod report;
mod validation;


use std::sync::Arc;

use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkFlags, ChunkType},
        faq::{FaqChunkMetadata, FaqEntry, FaqEntryPayload},
        knowledge::{EnableStatus, Knowledge, KnowledgeType, ParseStatus},
        knowledge_base::KnowledgeBase,
        tag::{KnowledgeTag, UNTAGGED_TAG_NAME},
        tenant::Tenant,
    },
};
use futures::{stream, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

pub(crate) use content::index_infos;
pub use entries::{FaqFieldUpdate, FaqFieldsBatchUpdate};
pub use import::FaqImportRequest;
pub use queries::{FaqListQuery, FaqPage, FaqSearchHit, FaqSearchRequest};
pub use report::{EXPORT_HEADER, FAILED_ENTRIES_HEADER};

use crate::{engine::KnowledgeEngine, pipeline::QUOTA_EXCEEDED_MESSAGE, services::IndexInfo};

pub const FAQ_CONTAINER_DESCRIPTION: &str = "FAQ 条目容器";
pub const NOT_FAQ_KNOWLEDGE_BASE: &str = "仅 FAQ 知识库支持该操作";

impl KnowledgeEngine {
    /// Loads a knowledge base owned by `tenant_id` and requires it to be a FAQ base.
    pub(crate) async fn faq_knowledge_base(
        &self,
        tenant_id: u64,
        kb_id: &str,
    ) -> Result<KnowledgeBase, AppError> {
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;
        if !kb.is_faq() {
            return Err(AppError::BadRequest(NOT_FAQ_KNOWLEDGE_BASE.into()));
        }
        Ok(kb)
    }

    /// Returns the base's FAQ container, creating it when missing.
    pub(crate) async fn ensure_faq_container(
        &self,
        kb: &KnowledgeBase,
    ) -> Result<Knowledge, AppError> {
        if let Some(existing) = Knowledge::find_faq_container(&self.db, kb.tenant_id, &kb.id).await?
        {
            return Ok(existing);
        }
        let mut container = Knowledge::new(
            kb.tenant_id,
            &kb.id,
            KnowledgeType::Faq,
            format!("{} - FAQ", kb.name),
            &kb.embedding_model_id,
        );
        container.description = FAQ_CONTAINER_DESCRIPTION.to_string();
        container.source = "faq".to_string();
        container.parse_status = ParseStatus::Completed;
        container.enable_status = EnableStatus::Enabled;
        let created = container.create(&self.db).await?;
        info!(kb_id = %kb.id, knowledge_id = %created.id, "created FAQ container");
        Ok(created)
    }

    /// Resolves the tag an entry points at: explicit tag seq id, then tag
    /// name (created on demand), then the base's untagged tag.
    pub(crate) async fn resolve_entry_tag(
        &self,
        kb: &KnowledgeBase,
        entry: &FaqEntryPayload,
    ) -> Result<KnowledgeTag, AppError> {
        if entry.tag_id > 0 {
            let tag = KnowledgeTag::get_by_seq_id(&self.db, kb.tenant_id, entry.tag_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("标签 {} 不存在", entry.tag_id)))?;
            if tag.knowledge_base_id != kb.id {
                return Err(AppError::BadRequest("标签不属于当前知识库".into()));
            }
            return Ok(tag);
        }
        let name = match entry.tag_name.trim() {
            "" => UNTAGGED_TAG_NAME,
            name => name,
        };
        KnowledgeTag::find_or_create_by_name(&self.db, kb.tenant_id, &kb.id, name).await
    }

    /// Writes the index projections of `chunks`. With `charge_storage` the
    /// estimated size is checked against the tenant quota first and then
    /// added to the tenant and container totals.
    pub(crate) async fn index_faq_chunks(
        &self,
        kb: &KnowledgeBase,
        knowledge_id: &str,
        chunks: &[Chunk],
        charge_storage: bool,
    ) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let model = self.embedding_model(kb).await?;
        let infos: Vec<IndexInfo> = chunks.iter().flat_map(|c| index_infos(kb, c)).collect();
        let size = if charge_storage {
            self.services
                .retrieval
                .estimate_storage_size(model.as_ref(), &infos)
        } else {
            0
        };
        if size > 0 {
            self.ensure_storage_headroom(kb.tenant_id, size).await?;
        }

        let tuning = &self.config.tuning;
        let tenant_id = kb.tenant_id;
        let groups: Vec<Vec<IndexInfo>> = infos
            .chunks(tuning.embed_batch_size.max(1))
            .map(<[IndexInfo]>::to_vec)
            .collect();
        let _: Vec<()> = stream::iter(groups.into_iter().map(|group| {
            let retrieval = Arc::clone(&self.services.retrieval);
            let model = Arc::clone(&model);
            async move { retrieval.batch_index(tenant_id, model.as_ref(), &group).await }
        }))
        .buffer_unordered(tuning.faq_insert_concurrency.max(1))
        .try_collect()
        .await?;
        debug!(%knowledge_id, projections = infos.len(), size, "indexed FAQ chunks");

        if charge_storage {
            Tenant::adjust_storage_used(&self.db, kb.tenant_id, size).await?;
            Knowledge::adjust_storage_size(&self.db, knowledge_id, size).await?;
        } else {
            Knowledge::mark_processed(&self.db, knowledge_id).await?;
        }
        Ok(())
    }

    /// Removes every index projection of `chunks` and refunds their
    /// estimated size.
    pub(crate) async fn delete_faq_chunk_vectors(
        &self,
        kb: &KnowledgeBase,
        knowledge_id: &str,
        chunks: &[Chunk],
    ) -> Result<(), AppError> {
        if chunks.is_empty() {
            return Ok(());
        }
        let model = self.embedding_model(kb).await?;
        let infos: Vec<IndexInfo> = chunks.iter().flat_map(|c| index_infos(kb, c)).collect();
        let size = self
            .services
            .retrieval
            .estimate_storage_size(model.as_ref(), &infos);
        let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        self.services
            .retrieval
            .delete_by_chunk_ids(kb.tenant_id, &ids, model.dimensions(), KnowledgeType::Faq)
            .await?;
        if size > 0 {
            Tenant::adjust_storage_used(&self.db, kb.tenant_id, size.saturating_neg()).await?;
            Knowledge::adjust_storage_size(&self.db, knowledge_id, size.saturating_neg()).await?;
        }
        Ok(())
    }

    /// Fails with `QuotaExceeded` when `size` more bytes would go past the
    /// tenant's quota. A tenant without a record is unlimited.
    async fn ensure_storage_headroom(&self, tenant_id: u64, size: i64) -> Result<(), AppError> {
        match Tenant::get(&self.db, tenant_id).await {
            Ok(tenant) if tenant.would_exceed(size) => {
                warn!(
                    tenant_id,
                    used = tenant.storage_used,
                    quota = tenant.storage_quota,
                    size,
                    "FAQ indexing would exceed storage quota"
                );
                Err(AppError::QuotaExceeded(QUOTA_EXCEEDED_MESSAGE.into()))
            }
            Ok(_) | Err(AppError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Builds an unsaved FAQ chunk. Entries are enabled and recommended unless
/// the payload says otherwise; a positive payload id becomes the seq id.
pub(crate) fn new_faq_chunk(
    kb: &KnowledgeBase,
    knowledge_id: &str,
    entry: &FaqEntryPayload,
    meta: FaqChunkMetadata,
    tag: &KnowledgeTag,
) -> Chunk {
    let mut chunk = Chunk::new(
        kb.tenant_id,
        knowledge_id,
        &kb.id,
        ChunkType::Faq,
        content::chunk_content(&meta, kb.faq_config.index_mode),
    );
    chunk.tag_id.clone_from(&tag.id);
    chunk.is_enabled = entry.is_enabled.unwrap_or(true);
    if entry.is_recommended != Some(false) {
        chunk.flags = chunk.flags.set(ChunkFlags::RECOMMENDED);
    }
    chunk.seq_id = entry.id.filter(|id| *id > 0).unwrap_or(0);
    chunk.set_faq_metadata(meta);
    chunk
}

/// Caller-facing view of a FAQ chunk.
pub(crate) fn faq_entry(kb: &KnowledgeBase, chunk: &Chunk, tag: Option<&KnowledgeTag>) -> FaqEntry {
    let meta = chunk.faq_metadata().cloned().unwrap_or_default();
    FaqEntry {
        seq_id: chunk.seq_id,
        chunk_id: chunk.id.clone(),
        knowledge_id: chunk.knowledge_id.clone(),
        knowledge_base_id: chunk.knowledge_base_id.clone(),
        tag_id: tag.map_or(0, |t| t.seq_id),
        tag_name: tag.map(|t| t.name.clone()).unwrap_or_default(),
        is_enabled: chunk.is_enabled,
        is_recommended: chunk.is_recommended(),
        standard_question: meta.standard_question,
        similar_questions: meta.similar_questions,
        negative_questions: meta.negative_questions,
        answers: meta.answers,
        answer_strategy: meta.answer_strategy,
        index_mode: kb.faq_config.index_mode,
        created_at: chunk.created_at,
        updated_at: chunk.updated_at,
    }
}
