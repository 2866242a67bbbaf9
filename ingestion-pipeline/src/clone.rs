//! Knowledge base synchronisation. A clone task brings a target base in line
//! with a source base by diffing them and applying only the difference, so
//! re-running a finished clone is a no-op.
//!
//! Document bases diff whole knowledge items by file hash. FAQ bases keep
//! everything in one container, so they diff individual chunks by content
//! hash instead.

use std::collections::HashMap;

use chrono::Utc;
use common::{
    error::AppError,
    storage::types::{
        background_task::BackgroundTask,
        chunk::{Chunk, ChunkStatus, ChunkType},
        knowledge::{EnableStatus, Knowledge, ParseStatus},
        knowledge_base::KnowledgeBase,
        progress::{
            kb_clone_progress_key, KbCloneProgress, KbCloneStatus, ProgressEntry,
            KB_CLONE_PROGRESS_TTL,
        },
        tag::KnowledgeTag,
        task_payloads::{KbClonePayload, TaskPayload},
        tenant::Tenant,
    },
};
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::KnowledgeEngine;

/// Chunk types carried over when a document knowledge is cloned.
const CLONED_CHUNK_TYPES: [ChunkType; 4] = [
    ChunkType::Text,
    ChunkType::Summary,
    ChunkType::ImageCaption,
    ChunkType::ImageOcr,
];

/// Maps source tag ids to tags of the target base, creating them by name.
struct TagMapper<'a> {
    engine: &'a KnowledgeEngine,
    source_tenant: u64,
    target: &'a KnowledgeBase,
    /// Held across the lookup so parallel clones resolve each tag once.
    mapped: Mutex<HashMap<String, String>>,
}

impl<'a> TagMapper<'a> {
    fn new(engine: &'a KnowledgeEngine, source_tenant: u64, target: &'a KnowledgeBase) -> Self {
        Self {
            engine,
            source_tenant,
            target,
            mapped: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the target tag id for `source_tag_id`, or an empty id when
    /// the source tag no longer exists.
    async fn map(&self, source_tag_id: &str) -> Result<String, AppError> {
        if source_tag_id.is_empty() {
            return Ok(String::new());
        }
        let mut mapped = self.mapped.lock().await;
        if let Some(id) = mapped.get(source_tag_id) {
            return Ok(id.clone());
        }
        let db = &self.engine.db;
        let target_id =
            match KnowledgeTag::get_by_id(db, self.source_tenant, source_tag_id).await? {
                Some(source_tag) => {
                    KnowledgeTag::find_or_create_by_name(
                        db,
                        self.target.tenant_id,
                        &self.target.id,
                        &source_tag.name,
                    )
                    .await?
                    .id
                }
                None => String::new(),
            };
        mapped.insert(source_tag_id.to_string(), target_id.clone());
        Ok(target_id)
    }
}

fn percent(done: usize, total: usize) -> u32 {
    if total == 0 {
        return 100;
    }
    let pct = done.saturating_mul(100).checked_div(total).unwrap_or(100);
    u32::try_from(pct.min(100)).unwrap_or(100)
}

impl KnowledgeEngine {
    /// Queues a clone of `source_id` into `target_id`. Both bases must belong
    /// to the tenant and share a type. Returns the clone task id.
    #[instrument(skip(self))]
    pub async fn enqueue_kb_clone(
        &self,
        tenant_id: u64,
        source_id: &str,
        target_id: &str,
    ) -> Result<String, AppError> {
        if source_id == target_id {
            return Err(AppError::BadRequest("源知识库与目标知识库不能相同".into()));
        }
        let source = KnowledgeBase::get_for_tenant(&self.db, tenant_id, source_id).await?;
        let target = KnowledgeBase::get_for_tenant(&self.db, tenant_id, target_id).await?;
        if source.kb_type != target.kb_type {
            return Err(AppError::BadRequest("源知识库与目标知识库类型不一致".into()));
        }

        let task_id = format!("kb_clone_{}", Uuid::new_v4().simple());
        let now = Utc::now().timestamp();
        self.save_clone_progress(KbCloneProgress {
            task_id: task_id.clone(),
            source_id: source.id.clone(),
            target_id: target.id.clone(),
            status: KbCloneStatus::Pending,
            message: "Task created, waiting to start".into(),
            created_at: now,
            ..KbCloneProgress::default()
        })
        .await?;

        self.enqueue(BackgroundTask::new(TaskPayload::KbClone(KbClonePayload {
            tenant_id,
            task_id: task_id.clone(),
            source_id: source.id,
            target_id: target.id,
        })))
        .await?;
        Ok(task_id)
    }

    pub async fn get_kb_clone_progress(
        &self,
        tenant_id: u64,
        task_id: &str,
    ) -> Result<KbCloneProgress, AppError> {
        let not_found = || AppError::NotFound("KB clone task not found".into());
        let progress =
            ProgressEntry::get::<KbCloneProgress>(&self.db, &kb_clone_progress_key(task_id))
                .await?
                .ok_or_else(not_found)?;
        match KnowledgeBase::get_for_tenant(&self.db, tenant_id, &progress.target_id).await {
            Ok(_) => Ok(progress),
            Err(AppError::NotFound(_)) => Err(not_found()),
            Err(err) => Err(err),
        }
    }

    /// Task handler. Progress is only marked failed on the last attempt or
    /// for errors a retry cannot fix; earlier failures leave it for the retry.
    #[instrument(skip_all, fields(task_id = %payload.task_id, source = %payload.source_id, target = %payload.target_id))]
    pub async fn process_kb_clone(
        &self,
        payload: &KbClonePayload,
        is_last_attempt: bool,
    ) -> Result<(), AppError> {
        let key = kb_clone_progress_key(&payload.task_id);
        let created_at = ProgressEntry::get::<KbCloneProgress>(&self.db, &key)
            .await?
            .map_or_else(|| Utc::now().timestamp(), |p| p.created_at);
        let progress = Mutex::new(KbCloneProgress {
            task_id: payload.task_id.clone(),
            source_id: payload.source_id.clone(),
            target_id: payload.target_id.clone(),
            status: KbCloneStatus::Processing,
            message: "Starting knowledge base clone...".into(),
            created_at,
            ..KbCloneProgress::default()
        });
        self.save_clone_progress(progress.lock().await.clone()).await?;

        let outcome = self.run_kb_clone(payload, &progress).await;
        let mut progress = progress.into_inner();
        match outcome {
            Ok(message) => {
                progress.status = KbCloneStatus::Completed;
                progress.progress = 100;
                progress.processed = progress.total;
                progress.message = message;
                self.save_clone_progress(progress).await?;
                info!("knowledge base clone completed");
                Ok(())
            }
            Err((err, message)) => {
                error!(error = %err, %message, "knowledge base clone failed");
                if is_last_attempt || err.is_permanent() {
                    progress.status = KbCloneStatus::Failed;
                    progress.error = err.to_string();
                    progress.message = message.to_string();
                    if let Err(save_err) = self.save_clone_progress(progress).await {
                        warn!(error = %save_err, "failed to record clone failure");
                    }
                }
                Err(err)
            }
        }
    }

    /// Returns the completion message, or the error with a short description
    /// of the step that failed.
    async fn run_kb_clone(
        &self,
        payload: &KbClonePayload,
        progress: &Mutex<KbCloneProgress>,
    ) -> Result<String, (AppError, &'static str)> {
        let (source, target) = self
            .copy_kb_configuration(payload)
            .await
            .map_err(|err| (err, "Failed to copy knowledge base configuration"))?;
        if source.is_faq() {
            self.clone_faq_kb(&source, &target, progress).await
        } else {
            self.clone_document_kb(&source, &target, progress).await
        }
    }

    async fn copy_kb_configuration(
        &self,
        payload: &KbClonePayload,
    ) -> Result<(KnowledgeBase, KnowledgeBase), AppError> {
        let source = self.clone_endpoint(payload.tenant_id, &payload.source_id).await?;
        let mut target = self.clone_endpoint(payload.tenant_id, &payload.target_id).await?;
        target.copy_configuration(&source);
        let target = target.save(&self.db).await?;
        Ok((source, target))
    }

    /// A base removed after the task was queued cannot come back on retry.
    async fn clone_endpoint(&self, tenant_id: u64, kb_id: &str) -> Result<KnowledgeBase, AppError> {
        match KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await {
            Err(AppError::NotFound(msg)) => Err(AppError::Validation(msg)),
            other => other,
        }
    }

    async fn clone_document_kb(
        &self,
        source: &KnowledgeBase,
        target: &KnowledgeBase,
        progress: &Mutex<KbCloneProgress>,
    ) -> Result<String, (AppError, &'static str)> {
        const DIFF_FAILED: &str = "Failed to calculate knowledge difference";
        let to_add = Knowledge::a_minus_b(
            &self.db,
            (source.tenant_id, &source.id),
            (target.tenant_id, &target.id),
        )
        .await
        .map_err(|err| (err, DIFF_FAILED))?;
        let to_delete = Knowledge::a_minus_b(
            &self.db,
            (target.tenant_id, &target.id),
            (source.tenant_id, &source.id),
        )
        .await
        .map_err(|err| (err, DIFF_FAILED))?;

        let total = to_add.len().saturating_add(to_delete.len());
        {
            let mut p = progress.lock().await;
            p.total = total;
            p.message = format!(
                "Found {} knowledge to add, {} to delete",
                to_add.len(),
                to_delete.len()
            );
            self.save_clone_progress(p.clone()).await.ok();
        }
        info!(add = to_add.len(), delete = to_delete.len(), "document clone diff");

        let tuning = &self.config.tuning;
        let target_tenant = target.tenant_id;
        let delete_groups: Vec<Vec<String>> = to_delete
            .chunks(tuning.clone_delete_group_size.max(1))
            .map(<[String]>::to_vec)
            .collect();
        let _: Vec<()> = stream::iter(delete_groups.into_iter().map(|group| {
            async move { self.delete_knowledge_list(target_tenant, &group).await }.boxed()
        }))
        .buffer_unordered(tuning.clone_concurrency.max(1))
        .try_collect()
        .await
        .map_err(|err| (err, "Failed to delete knowledge"))?;
        {
            let mut p = progress.lock().await;
            p.processed = to_delete.len();
            p.progress = percent(p.processed, total);
            p.message = format!(
                "Deleted {} knowledge, cloning {}...",
                to_delete.len(),
                to_add.len()
            );
            self.save_clone_progress(p.clone()).await.ok();
        }

        let deleted = to_delete.len();
        let added = to_add.len();
        let source_tenant = source.tenant_id;
        let tags = TagMapper::new(self, source_tenant, target);
        let tags = &tags;
        let _: Vec<()> = stream::iter(to_add.iter().cloned().map(|id| {
            async move {
                let knowledge = Knowledge::get_for_tenant(&self.db, source_tenant, &id).await?;
                self.clone_knowledge(&knowledge, target, tags).await?;
                let mut p = progress.lock().await;
                p.processed = p.processed.saturating_add(1);
                p.progress = percent(p.processed, total);
                p.message = format!(
                    "Cloned {}/{} knowledge",
                    p.processed.saturating_sub(deleted),
                    added
                );
                self.save_clone_progress(p.clone()).await.ok();
                Ok::<(), AppError>(())
            }
            .boxed()
        }))
        .buffer_unordered(tuning.clone_concurrency.max(1))
        .try_collect()
        .await
        .map_err(|err| (err, "Failed to clone knowledge"))?;

        Ok("Knowledge base clone completed successfully".into())
    }

    /// Copies one completed knowledge with its chunks and index rows into
    /// `target`. Knowledge that has not finished processing is skipped.
    async fn clone_knowledge(
        &self,
        source: &Knowledge,
        target: &KnowledgeBase,
        tags: &TagMapper<'_>,
    ) -> Result<(), AppError> {
        if source.parse_status != ParseStatus::Completed {
            warn!(knowledge_id = %source.id, status = source.parse_status.as_str(), "skipping unfinished knowledge");
            return Ok(());
        }
        let mut copy = Knowledge::new(
            target.tenant_id,
            &target.id,
            source.knowledge_type,
            source.title.clone(),
            &target.embedding_model_id,
        );
        copy.description.clone_from(&source.description);
        copy.source.clone_from(&source.source);
        copy.file_name.clone_from(&source.file_name);
        copy.file_type.clone_from(&source.file_type);
        copy.file_size = source.file_size;
        copy.file_hash.clone_from(&source.file_hash);
        copy.file_path.clone_from(&source.file_path);
        copy.storage_size = source.storage_size;
        copy.metadata = source.metadata.clone();
        copy.parse_status = ParseStatus::Processing;
        let mut copy = copy.create(&self.db).await?;

        let outcome = async {
            Tenant::adjust_storage_used(&self.db, target.tenant_id, copy.storage_size).await?;
            self.clone_chunks(source, &copy, target, tags).await
        }
        .await;

        match &outcome {
            Ok(()) => {
                copy.parse_status = ParseStatus::Completed;
                copy.enable_status = EnableStatus::Enabled;
                copy.processed_at = Some(Utc::now());
                info!(source = %source.id, knowledge_id = %copy.id, "cloned knowledge");
            }
            Err(err) => {
                copy.parse_status = ParseStatus::Failed;
                copy.error_message = err.to_string();
                error!(source = %source.id, knowledge_id = %copy.id, error = %err, "knowledge clone failed");
            }
        }
        copy.save(&self.db).await?;
        outcome
    }

    async fn clone_chunks(
        &self,
        source: &Knowledge,
        copy: &Knowledge,
        target: &KnowledgeBase,
        tags: &TagMapper<'_>,
    ) -> Result<(), AppError> {
        let source_chunks =
            Chunk::list_by_knowledge_and_types(&self.db, &source.id, &CLONED_CHUNK_TYPES).await?;
        let mut id_map: HashMap<String, String> = HashMap::with_capacity(source_chunks.len());
        let mut copies = Vec::with_capacity(source_chunks.len());
        for chunk in &source_chunks {
            let tag_id = tags.map(&chunk.tag_id).await?;
            let mut new = Chunk {
                id: Uuid::new_v4().to_string(),
                tenant_id: target.tenant_id,
                knowledge_id: copy.id.clone(),
                knowledge_base_id: target.id.clone(),
                tag_id,
                seq_id: 0,
                ..chunk.clone()
            };
            new.created_at = Utc::now();
            new.updated_at = new.created_at;
            id_map.insert(chunk.id.clone(), new.id.clone());
            copies.push(new);
        }
        let remap = |old: &str| id_map.get(old).cloned().unwrap_or_default();
        for chunk in &mut copies {
            chunk.pre_chunk_id = remap(&chunk.pre_chunk_id);
            chunk.next_chunk_id = remap(&chunk.next_chunk_id);
            chunk.parent_chunk_id = remap(&chunk.parent_chunk_id);
        }
        let copies = Chunk::create_batch(&self.db, copies).await?;

        let model = self.embedding_model(target).await?;
        let retrieval = &self.services.retrieval;
        retrieval
            .copy_indices(
                target.tenant_id,
                &source.knowledge_base_id,
                &target.id,
                &HashMap::from([(source.id.clone(), copy.id.clone())]),
                &id_map,
                model.dimensions(),
                copy.knowledge_type,
            )
            .await?;

        let retagged: HashMap<String, String> = source_chunks
            .iter()
            .zip(&copies)
            .filter(|(old, new)| old.tag_id != new.tag_id)
            .map(|(_, new)| (new.id.clone(), new.tag_id.clone()))
            .collect();
        if !retagged.is_empty() {
            retrieval.batch_update_chunk_tag(&retagged).await?;
        }
        Ok(())
    }

    async fn clone_faq_kb(
        &self,
        source: &KnowledgeBase,
        target: &KnowledgeBase,
        progress: &Mutex<KbCloneProgress>,
    ) -> Result<String, (AppError, &'static str)> {
        let (to_add, to_delete) = Chunk::faq_chunk_diff(
            &self.db,
            (source.tenant_id, &source.id),
            (target.tenant_id, &target.id),
        )
        .await
        .map_err(|err| (err, "Failed to calculate FAQ chunk difference"))?;

        let total = to_add.len().saturating_add(to_delete.len());
        {
            let mut p = progress.lock().await;
            p.total = total;
            p.message = format!(
                "Found {} FAQ entries to add, {} to delete",
                to_add.len(),
                to_delete.len()
            );
            self.save_clone_progress(p.clone()).await.ok();
        }
        info!(add = to_add.len(), delete = to_delete.len(), "FAQ clone diff");
        if total == 0 {
            return Ok("FAQ knowledge base is already in sync".into());
        }

        if !to_delete.is_empty() {
            const DELETE_FAILED: &str = "Failed to delete FAQ entries";
            let stale = Chunk::list_by_ids(&self.db, &to_delete)
                .await
                .map_err(|err| (err, DELETE_FAILED))?;
            let mut by_knowledge: HashMap<&str, Vec<Chunk>> = HashMap::new();
            for chunk in &stale {
                by_knowledge
                    .entry(chunk.knowledge_id.as_str())
                    .or_default()
                    .push(chunk.clone());
            }
            for (knowledge_id, chunks) in by_knowledge {
                self.delete_faq_chunk_vectors(target, knowledge_id, &chunks)
                    .await
                    .map_err(|err| (err, DELETE_FAILED))?;
            }
            Chunk::delete_by_ids(&self.db, &to_delete)
                .await
                .map_err(|err| (err, DELETE_FAILED))?;

            let mut p = progress.lock().await;
            p.processed = to_delete.len();
            p.progress = percent(p.processed, total);
            p.message = format!(
                "Deleted {} FAQ entries, adding {}...",
                to_delete.len(),
                to_add.len()
            );
            self.save_clone_progress(p.clone()).await.ok();
        }

        let container = self
            .ensure_faq_container(target)
            .await
            .map_err(|err| (err, "Failed to prepare FAQ knowledge entry"))?;
        let tags = TagMapper::new(self, source.tenant_id, target);
        for batch in to_add.chunks(self.config.tuning.faq_import_batch_size.max(1)) {
            self.clone_faq_batch(batch, target, &container, &tags)
                .await
                .map_err(|err| (err, "Failed to add FAQ entries"))?;

            let mut p = progress.lock().await;
            p.processed = p.processed.saturating_add(batch.len());
            p.progress = percent(p.processed, total);
            p.message = format!(
                "Added {}/{} FAQ entries",
                p.processed.saturating_sub(to_delete.len()),
                to_add.len()
            );
            self.save_clone_progress(p.clone()).await.ok();
        }

        Ok("FAQ knowledge base clone completed successfully".into())
    }

    /// Copies one batch of source FAQ chunks into the target container and
    /// indexes them under the target's index modes. A failed batch is rolled
    /// back so the next diff still sees it as missing.
    async fn clone_faq_batch(
        &self,
        source_ids: &[String],
        target: &KnowledgeBase,
        container: &Knowledge,
        tags: &TagMapper<'_>,
    ) -> Result<(), AppError> {
        let source_chunks = Chunk::list_by_ids(&self.db, source_ids).await?;
        let mut copies = Vec::with_capacity(source_chunks.len());
        for chunk in source_chunks {
            let tag_id = tags.map(&chunk.tag_id).await?;
            let mut new = Chunk::new(
                target.tenant_id,
                &container.id,
                &target.id,
                ChunkType::Faq,
                chunk.content,
            );
            new.tag_id = tag_id;
            new.chunk_index = chunk.chunk_index;
            new.is_enabled = chunk.is_enabled;
            new.flags = chunk.flags;
            new.metadata = chunk.metadata;
            new.content_hash = chunk.content_hash;
            new.image_info = chunk.image_info;
            new.status = ChunkStatus::Stored;
            copies.push(new);
        }

        let created = Chunk::create_batch(&self.db, copies).await?;
        if let Err(err) = self
            .index_faq_chunks(target, &container.id, &created, true)
            .await
        {
            self.rollback_faq_batch(target, &created).await;
            return Err(err);
        }
        let ids: Vec<String> = created.iter().map(|c| c.id.clone()).collect();
        Chunk::mark_indexed(&self.db, &ids).await
    }

    async fn save_clone_progress(&self, mut progress: KbCloneProgress) -> Result<(), AppError> {
        progress.updated_at = Utc::now().timestamp();
        let key = kb_clone_progress_key(&progress.task_id);
        ProgressEntry::set(&self.db, &key, &progress, KB_CLONE_PROGRESS_TTL).await
    }
}
