use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkFlags, ChunkType},
        faq::{
            FaqChunkMetadata, FaqEntry, FaqEntryPayload, QuestionIndexMode, DISPLAY_STATUS_CLOSE,
            DISPLAY_STATUS_OPEN,
        },
        knowledge::{Knowledge, KnowledgeType},
        knowledge_base::KnowledgeBase,
        progress::{faq_import_progress_key, FaqImportProgress, FaqImportStatus, ProgressEntry},
        tag::KnowledgeTag,
    },
};
use tracing::{info, instrument};

use super::{
    content::{chunk_content, sanitize_entry, separate_index_delta},
    faq_entry, new_faq_chunk,
    report::{export_csv, EXPORT_HEADER},
    validation::check_question_conflicts,
};
use crate::engine::KnowledgeEngine;

const UPDATE_ONLY_FAQ: &str = "仅支持更新 FAQ 条目";

impl KnowledgeEngine {
    /// Creates one entry, indexes it and charges its size to the tenant.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id))]
    pub async fn create_faq_entry(
        &self,
        tenant_id: u64,
        kb_id: &str,
        payload: FaqEntryPayload,
    ) -> Result<FaqEntry, AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let meta = sanitize_entry(&payload)?;
        let tag = self.resolve_entry_tag(&kb, &payload).await?;
        let others = Chunk::list_faq_by_knowledge_base(&self.db, tenant_id, &kb.id).await?;
        check_question_conflicts(&meta, &others, None)?;

        let container = self.ensure_faq_container(&kb).await?;
        let chunk = new_faq_chunk(&kb, &container.id, &payload, meta, &tag);
        let created = Chunk::create_batch(&self.db, vec![chunk])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::InternalError("FAQ chunk was not stored".into()))?;

        let batch = std::slice::from_ref(&created);
        if let Err(err) = self.index_faq_chunks(&kb, &container.id, batch, true).await {
            self.rollback_faq_batch(&kb, batch).await;
            return Err(err);
        }
        Chunk::mark_indexed(&self.db, &[created.id.clone()]).await?;
        info!(seq_id = created.seq_id, "created FAQ entry");
        Ok(faq_entry(&kb, &created, Some(&tag)))
    }

    /// Replaces an entry's content, tag and flags, bumping its version.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, seq_id = seq_id))]
    pub async fn update_faq_entry(
        &self,
        tenant_id: u64,
        kb_id: &str,
        seq_id: i64,
        payload: FaqEntryPayload,
    ) -> Result<FaqEntry, AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let mut chunk = self.load_faq_chunk(&kb, seq_id).await?;
        let old = chunk.faq_metadata().cloned().unwrap_or_default();

        let mut meta = sanitize_entry(&payload)?;
        let others = Chunk::list_faq_by_knowledge_base(&self.db, tenant_id, &kb.id).await?;
        check_question_conflicts(&meta, &others, Some(&chunk.id))?;
        meta.version = old.version.saturating_add(1);

        // Entries without a tag fall back to the untagged tag, as on create.
        let tag = self.resolve_entry_tag(&kb, &payload).await?;
        let before = FaqAttributes::of(&chunk);
        chunk.tag_id.clone_from(&tag.id);
        if let Some(enabled) = payload.is_enabled {
            chunk.is_enabled = enabled;
        }
        if let Some(recommended) = payload.is_recommended {
            chunk.flags = if recommended {
                chunk.flags.set(ChunkFlags::RECOMMENDED)
            } else {
                chunk.flags.clear(ChunkFlags::RECOMMENDED)
            };
        }
        chunk.content = chunk_content(&meta, kb.faq_config.index_mode);
        chunk.set_faq_metadata(meta);
        let chunk = chunk.save(&self.db).await?;

        self.reindex_faq_entry(&kb, &chunk, &old, before != FaqAttributes::of(&chunk))
            .await?;
        Ok(faq_entry(&kb, &chunk, Some(&tag)))
    }

    /// Appends new similar questions; blanks, repeats and copies of the
    /// standard question are ignored.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, seq_id = seq_id))]
    pub async fn add_similar_questions(
        &self,
        tenant_id: u64,
        kb_id: &str,
        seq_id: i64,
        questions: Vec<String>,
    ) -> Result<FaqEntry, AppError> {
        if questions.is_empty() {
            return Err(AppError::BadRequest("相似问列表不能为空".into()));
        }
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let mut chunk = self.load_faq_chunk(&kb, seq_id).await?;
        let old = chunk.faq_metadata().cloned().unwrap_or_default();

        let mut meta = old.clone();
        let mut known: HashSet<String> = meta.similar_questions.iter().cloned().collect();
        known.insert(meta.standard_question.clone());
        let added: Vec<String> = questions
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty() && known.insert(q.clone()))
            .collect();
        let tag = KnowledgeTag::get_by_id(&self.db, tenant_id, &chunk.tag_id).await?;
        if added.is_empty() {
            return Ok(faq_entry(&kb, &chunk, tag.as_ref()));
        }

        meta.similar_questions.extend(added);
        let others = Chunk::list_faq_by_knowledge_base(&self.db, tenant_id, &kb.id).await?;
        check_question_conflicts(&meta, &others, Some(&chunk.id))?;
        meta.version = old.version.saturating_add(1);
        chunk.content = chunk_content(&meta, kb.faq_config.index_mode);
        chunk.set_faq_metadata(meta);
        let chunk = chunk.save(&self.db).await?;

        self.reindex_faq_entry(&kb, &chunk, &old, false).await?;
        Ok(faq_entry(&kb, &chunk, tag.as_ref()))
    }

    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, seq_id = seq_id))]
    pub async fn update_faq_entry_status(
        &self,
        tenant_id: u64,
        kb_id: &str,
        seq_id: i64,
        is_enabled: bool,
    ) -> Result<(), AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let mut chunk = self.load_faq_chunk(&kb, seq_id).await?;
        if chunk.is_enabled == is_enabled {
            return Ok(());
        }
        chunk.is_enabled = is_enabled;
        let chunk = chunk.save(&self.db).await?;
        self.services
            .retrieval
            .batch_update_chunk_enabled_status(&HashMap::from([(chunk.id, is_enabled)]))
            .await
    }

    /// Moves an entry to another tag of the same base, or clears its tag when
    /// `tag_seq_id` is `None`.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, seq_id = seq_id))]
    pub async fn update_faq_entry_tag(
        &self,
        tenant_id: u64,
        kb_id: &str,
        seq_id: i64,
        tag_seq_id: Option<i64>,
    ) -> Result<(), AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        let mut chunk = self.load_faq_chunk(&kb, seq_id).await?;

        let tag_id = match tag_seq_id.filter(|id| *id > 0) {
            Some(tag_seq) => {
                let tag = KnowledgeTag::get_by_seq_id(&self.db, tenant_id, tag_seq)
                    .await?
                    .ok_or_else(|| AppError::NotFound("标签不存在".into()))?;
                if tag.knowledge_base_id != kb.id {
                    return Err(AppError::BadRequest("标签不属于当前知识库".into()));
                }
                tag.id
            }
            None => String::new(),
        };
        if chunk.tag_id == tag_id {
            return Ok(());
        }
        chunk.tag_id.clone_from(&tag_id);
        let chunk = chunk.save(&self.db).await?;
        self.services
            .retrieval
            .batch_update_chunk_tag(&HashMap::from([(chunk.id, tag_id)]))
            .await
    }

    /// Applies field changes to many entries. `by_tag` runs first and covers
    /// every entry carrying the tag except `exclude_ids`; `by_id` then runs
    /// per entry. Tags are resolved before anything is written.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, by_id = request.by_id.len(), by_tag = request.by_tag.len()))]
    pub async fn update_faq_entry_fields_batch(
        &self,
        tenant_id: u64,
        kb_id: &str,
        request: &FaqFieldsBatchUpdate,
    ) -> Result<(), AppError> {
        if request.by_id.is_empty() && request.by_tag.is_empty() {
            return Ok(());
        }
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;

        let mut tag_ids: HashMap<i64, String> = HashMap::new();
        let wanted = request
            .by_tag
            .keys()
            .copied()
            .chain(request.by_tag.values().chain(request.by_id.values()).filter_map(|u| u.tag_seq_id));
        for seq_id in wanted {
            if !tag_ids.contains_key(&seq_id) {
                let tag_id = self.faq_tag_id(&kb, seq_id).await?;
                tag_ids.insert(seq_id, tag_id);
            }
        }

        let excluded: HashSet<i64> = request.exclude_ids.iter().copied().collect();
        let mut sync = IndexSync::default();
        for (tag_seq_id, update) in &request.by_tag {
            let tag_id = tag_ids.get(tag_seq_id).cloned().unwrap_or_default();
            for chunk in Chunk::list_faq_by_tag(&self.db, tenant_id, &kb.id, &tag_id).await? {
                if !excluded.contains(&chunk.seq_id) {
                    self.apply_field_update(chunk, update, &tag_ids, &mut sync).await?;
                }
            }
        }

        let seq_ids: Vec<i64> = request.by_id.keys().copied().collect();
        for chunk in Chunk::list_by_seq_ids(&self.db, tenant_id, &seq_ids).await? {
            if chunk.knowledge_base_id != kb.id || chunk.chunk_type != ChunkType::Faq {
                continue;
            }
            if let Some(update) = request.by_id.get(&chunk.seq_id) {
                self.apply_field_update(chunk, update, &tag_ids, &mut sync).await?;
            }
        }

        info!(
            enabled = sync.enabled.len(),
            tagged = sync.tags.len(),
            "applied FAQ field updates"
        );
        let retrieval = &self.services.retrieval;
        if !sync.enabled.is_empty() {
            retrieval.batch_update_chunk_enabled_status(&sync.enabled).await?;
        }
        if !sync.tags.is_empty() {
            retrieval.batch_update_chunk_tag(&sync.tags).await?;
        }
        Ok(())
    }

    /// Moves entries, keyed by seq id, to the tag with the given seq id;
    /// `None` or 0 clears the tag.
    pub async fn update_faq_entry_tag_batch(
        &self,
        tenant_id: u64,
        kb_id: &str,
        updates: &HashMap<i64, Option<i64>>,
    ) -> Result<(), AppError> {
        let request = FaqFieldsBatchUpdate {
            by_id: updates
                .iter()
                .map(|(&seq_id, tag)| {
                    let update = FaqFieldUpdate {
                        tag_seq_id: Some(tag.unwrap_or(0)),
                        ..FaqFieldUpdate::default()
                    };
                    (seq_id, update)
                })
                .collect(),
            ..FaqFieldsBatchUpdate::default()
        };
        self.update_faq_entry_fields_batch(tenant_id, kb_id, &request)
            .await
    }

    /// Id of the base's tag with `seq_id`; 0 resolves to no tag.
    async fn faq_tag_id(&self, kb: &KnowledgeBase, seq_id: i64) -> Result<String, AppError> {
        if seq_id <= 0 {
            return Ok(String::new());
        }
        let tag = KnowledgeTag::get_by_seq_id(&self.db, kb.tenant_id, seq_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("标签 {seq_id} 不存在")))?;
        if tag.knowledge_base_id != kb.id {
            return Err(AppError::BadRequest(format!("标签 {seq_id} 不属于当前知识库")));
        }
        Ok(tag.id)
    }

    async fn apply_field_update(
        &self,
        mut chunk: Chunk,
        update: &FaqFieldUpdate,
        tag_ids: &HashMap<i64, String>,
        sync: &mut IndexSync,
    ) -> Result<(), AppError> {
        let mut changed = false;
        if let Some(enabled) = update.is_enabled.filter(|e| *e != chunk.is_enabled) {
            chunk.is_enabled = enabled;
            sync.enabled.insert(chunk.id.clone(), enabled);
            changed = true;
        }
        if let Some(recommended) = update
            .is_recommended
            .filter(|r| *r != chunk.is_recommended())
        {
            chunk.flags = if recommended {
                chunk.flags.set(ChunkFlags::RECOMMENDED)
            } else {
                chunk.flags.clear(ChunkFlags::RECOMMENDED)
            };
            changed = true;
        }
        if let Some(seq_id) = update.tag_seq_id {
            let tag_id = tag_ids.get(&seq_id).cloned().unwrap_or_default();
            if tag_id != chunk.tag_id {
                sync.tags.insert(chunk.id.clone(), tag_id.clone());
                chunk.tag_id = tag_id;
                changed = true;
            }
        }
        if changed {
            chunk.save(&self.db).await?;
        }
        Ok(())
    }

    /// Deletes entries by seq id, removing their index projections and
    /// refunding their size. Every id is checked before anything is deleted.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, count = seq_ids.len()))]
    pub async fn delete_faq_entries(
        &self,
        tenant_id: u64,
        kb_id: &str,
        seq_ids: &[i64],
    ) -> Result<(), AppError> {
        if seq_ids.is_empty() {
            return Err(AppError::BadRequest("请选择需要删除的 FAQ 条目".into()));
        }
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;

        let mut seen = HashSet::new();
        let mut by_knowledge: HashMap<String, Vec<Chunk>> = HashMap::new();
        for &seq_id in seq_ids.iter().filter(|id| **id > 0) {
            if !seen.insert(seq_id) {
                continue;
            }
            let chunk = Chunk::get_by_seq_id(&self.db, tenant_id, seq_id)
                .await?
                .ok_or_else(|| AppError::NotFound("FAQ条目不存在".into()))?;
            if chunk.knowledge_base_id != kb.id || chunk.chunk_type != ChunkType::Faq {
                return Err(AppError::BadRequest("包含无效的 FAQ 条目".into()));
            }
            by_knowledge
                .entry(chunk.knowledge_id.clone())
                .or_default()
                .push(chunk);
        }

        for (knowledge_id, chunks) in by_knowledge {
            self.delete_faq_chunk_vectors(&kb, &knowledge_id, &chunks)
                .await?;
            let ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
            Chunk::delete_by_ids(&self.db, &ids).await?;
            info!(%knowledge_id, deleted = ids.len(), "deleted FAQ entries");
        }
        Ok(())
    }

    /// Every entry of the base as CSV. A base without entries yields only
    /// the header row.
    pub async fn export_faq_entries(&self, tenant_id: u64, kb_id: &str) -> Result<Vec<u8>, AppError> {
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;
        if Knowledge::find_faq_container(&self.db, tenant_id, &kb.id)
            .await?
            .is_none()
        {
            return Ok(format!("{EXPORT_HEADER}\n").into_bytes());
        }
        let chunks = Chunk::list_faq_by_knowledge_base(&self.db, tenant_id, &kb.id).await?;
        let tag_names: HashMap<String, String> =
            KnowledgeTag::list_by_knowledge_base(&self.db, tenant_id, &kb.id)
                .await?
                .into_iter()
                .map(|tag| (tag.id, tag.name))
                .collect();
        Ok(export_csv(&chunks, &tag_names).into_bytes())
    }

    /// Progress of a FAQ import. Completed imports are enriched with the
    /// result stored on the FAQ container.
    pub async fn get_faq_import_progress(
        &self,
        tenant_id: u64,
        task_id: &str,
    ) -> Result<FaqImportProgress, AppError> {
        let not_found = || AppError::NotFound("FAQ import task not found".into());
        let mut progress =
            ProgressEntry::get::<FaqImportProgress>(&self.db, &faq_import_progress_key(task_id))
                .await?
                .ok_or_else(not_found)?;
        KnowledgeBase::get_for_tenant(&self.db, tenant_id, &progress.kb_id)
            .await
            .map_err(|_| not_found())?;

        if progress.status == FaqImportStatus::Completed && !progress.knowledge_id.is_empty() {
            let result = Knowledge::get(&self.db, &progress.knowledge_id)
                .await?
                .and_then(|k| k.last_faq_import_result)
                .filter(|r| r.task_id == progress.task_id);
            if let Some(result) = result {
                progress.skipped_count = result.skipped_count;
                progress.import_mode = Some(result.import_mode);
                progress.imported_at = Some(result.imported_at);
                progress.display_status = result.display_status;
                progress.processing_time_ms = result.processing_time_ms;
            }
        }
        Ok(progress)
    }

    /// Shows or hides the last import result banner of a FAQ base.
    pub async fn update_last_faq_import_result_display_status(
        &self,
        tenant_id: u64,
        kb_id: &str,
        display_status: &str,
    ) -> Result<(), AppError> {
        if display_status != DISPLAY_STATUS_OPEN && display_status != DISPLAY_STATUS_CLOSE {
            return Err(AppError::BadRequest(
                "invalid display status, must be 'open' or 'close'".into(),
            ));
        }
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;
        let mut container = Knowledge::find_faq_container(&self.db, tenant_id, &kb.id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound("FAQ knowledge not found in this knowledge base".into())
            })?;
        let result = container
            .last_faq_import_result
            .as_mut()
            .ok_or_else(|| AppError::NotFound("no FAQ import result found".into()))?;
        result.display_status = display_status.to_string();
        container.save(&self.db).await?;
        Ok(())
    }

    async fn load_faq_chunk(&self, kb: &KnowledgeBase, seq_id: i64) -> Result<Chunk, AppError> {
        let chunk = Chunk::get_by_seq_id(&self.db, kb.tenant_id, seq_id)
            .await?
            .ok_or_else(|| AppError::NotFound("FAQ条目不存在".into()))?;
        if chunk.knowledge_base_id != kb.id {
            return Err(AppError::Forbidden("无权操作该 FAQ 条目".into()));
        }
        if chunk.chunk_type != ChunkType::Faq {
            return Err(AppError::BadRequest(UPDATE_ONLY_FAQ.into()));
        }
        Ok(chunk)
    }

    /// Brings the index in line with an edited entry. In separate mode only
    /// the changed projections are rewritten, unless an attribute stored on
    /// every projection changed.
    async fn reindex_faq_entry(
        &self,
        kb: &KnowledgeBase,
        chunk: &Chunk,
        old: &FaqChunkMetadata,
        attributes_changed: bool,
    ) -> Result<(), AppError> {
        let separate = kb.faq_config.question_index_mode == QuestionIndexMode::Separate;
        if !separate {
            return self
                .index_faq_chunks(kb, &chunk.knowledge_id, std::slice::from_ref(chunk), false)
                .await;
        }

        let mut delta = separate_index_delta(kb, chunk, old);
        if attributes_changed {
            delta.upserts = super::index_infos(kb, chunk);
        }
        let model = self.embedding_model(kb).await?;
        let retrieval = &self.services.retrieval;
        if !delta.stale_source_ids.is_empty() {
            retrieval
                .delete_by_source_ids(
                    kb.tenant_id,
                    &delta.stale_source_ids,
                    model.dimensions(),
                    KnowledgeType::Faq,
                )
                .await?;
        }
        if !delta.upserts.is_empty() {
            retrieval
                .batch_index(kb.tenant_id, model.as_ref(), &delta.upserts)
                .await?;
        }
        info!(
            seq_id = chunk.seq_id,
            upserted = delta.upserts.len(),
            removed = delta.stale_source_ids.len(),
            "re-indexed FAQ entry incrementally"
        );
        Knowledge::mark_processed(&self.db, &chunk.knowledge_id).await
    }
}

/// Field changes for one FAQ entry; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FaqFieldUpdate {
    pub is_enabled: Option<bool>,
    pub is_recommended: Option<bool>,
    /// Seq id of the tag to move to; `Some(0)` clears the tag.
    pub tag_seq_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FaqFieldsBatchUpdate {
    /// Keyed by entry seq id.
    pub by_id: HashMap<i64, FaqFieldUpdate>,
    /// Keyed by tag seq id.
    pub by_tag: HashMap<i64, FaqFieldUpdate>,
    /// Entry seq ids the `by_tag` updates skip.
    pub exclude_ids: Vec<i64>,
}

/// Index attributes to push after a batch of chunk edits.
#[derive(Default)]
struct IndexSync {
    enabled: HashMap<String, bool>,
    tags: HashMap<String, String>,
}

/// Chunk attributes copied onto every index projection.
#[derive(Debug, PartialEq)]
struct FaqAttributes {
    tag_id: String,
    is_enabled: bool,
    is_recommended: bool,
}

impl FaqAttributes {
    fn of(chunk: &Chunk) -> Self {
        Self {
            tag_id: chunk.tag_id.clone(),
            is_enabled: chunk.is_enabled,
            is_recommended: chunk.is_recommended(),
        }
    }
}
