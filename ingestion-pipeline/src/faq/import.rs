use std::{
    any::Any,
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
};

use bytes::Bytes;
use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        store::DEFAULT_URL_EXPIRY,
        types::{
            background_task::BackgroundTask,
            chunk::Chunk,
            faq::{
                FaqChunkMetadata, FaqEntryPayload, FaqFailedEntry, FaqImportMode, FaqImportResult,
                FaqSuccessEntry, DISPLAY_STATUS_OPEN,
            },
            knowledge::{Knowledge, KnowledgeType},
            knowledge_base::KnowledgeBase,
            progress::{
                faq_import_progress_key, faq_import_running_key, FaqImportProgress,
                FaqImportStatus, ProgressEntry, RunningImportInfo, FAQ_PROGRESS_TTL,
            },
            tag::KnowledgeTag,
            task_payloads::{FaqImportPayload, TaskPayload},
        },
    },
};
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::{
    content::sanitize_entry, new_faq_chunk, report::failed_entries_csv,
    validation::EntryValidator,
};
use crate::engine::KnowledgeEngine;

const CSV_EXPORTED_SUFFIX: &str = " (失败记录已导出为CSV)";

/// A batch of entries to import into a FAQ knowledge base.
#[derive(Debug, Clone, Default)]
pub struct FaqImportRequest {
    pub entries: Vec<FaqEntryPayload>,
    pub mode: FaqImportMode,
    /// Validate only; nothing is written to the base.
    pub dry_run: bool,
    /// Caller-chosen task id; generated when absent.
    pub task_id: Option<String>,
}

/// What the commit phase does with one valid entry.
enum Planned {
    Create {
        index: usize,
        meta: FaqChunkMetadata,
        tag: KnowledgeTag,
    },
    Skip,
}

struct ImportPlan {
    deletions: Vec<Chunk>,
    actions: Vec<Planned>,
}

/// Tag lookups repeated across entries hit the database once.
#[derive(Default)]
struct TagCache {
    by_key: HashMap<(i64, String), KnowledgeTag>,
}

impl TagCache {
    async fn resolve(
        &mut self,
        engine: &KnowledgeEngine,
        kb: &KnowledgeBase,
        entry: &FaqEntryPayload,
    ) -> Result<KnowledgeTag, AppError> {
        let key = (entry.tag_id.max(0), entry.tag_name.trim().to_string());
        if let Some(tag) = self.by_key.get(&key) {
            return Ok(tag.clone());
        }
        let tag = engine.resolve_entry_tag(kb, entry).await?;
        self.by_key.insert(key, tag.clone());
        Ok(tag)
    }
}

fn percent(done: usize, total: usize) -> u32 {
    let pct = done
        .saturating_mul(100)
        .checked_div(total)
        .unwrap_or(100)
        .min(100);
    u32::try_from(pct).unwrap_or(100)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl KnowledgeEngine {
    /// Queues a FAQ import and returns its task id. Only one import per
    /// knowledge base may be pending or running at a time.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, mode = request.mode.as_str(), dry_run = request.dry_run))]
    pub async fn enqueue_faq_import(
        &self,
        tenant_id: u64,
        kb_id: &str,
        request: FaqImportRequest,
    ) -> Result<String, AppError> {
        if request.entries.is_empty() {
            return Err(AppError::BadRequest("FAQ 条目不能为空".into()));
        }
        let kb = self.faq_knowledge_base(tenant_id, kb_id).await?;

        let task_id = request
            .task_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("faq_import_{}", Uuid::new_v4().simple()));
        let enqueued_at = Utc::now().timestamp();
        let running_key = faq_import_running_key(&kb.id);
        let holder = RunningImportInfo {
            task_id: task_id.clone(),
            enqueued_at,
        };
        if !ProgressEntry::set_nx(&self.db, &running_key, &holder, FAQ_PROGRESS_TTL).await? {
            let running = ProgressEntry::get::<RunningImportInfo>(&self.db, &running_key)
                .await?
                .map(|info| info.task_id)
                .unwrap_or_default();
            info!(running_task = %running, "rejecting FAQ import: another import is active");
            return Err(AppError::BadRequest(format!(
                "该知识库已有导入任务正在进行中（任务ID: {running}），请等待完成后再试"
            )));
        }

        if let Err(err) = self
            .schedule_faq_import(&kb, &task_id, enqueued_at, request)
            .await
        {
            self.release_import_lock(&kb.id, &task_id).await;
            return Err(err);
        }
        Ok(task_id)
    }

    async fn schedule_faq_import(
        &self,
        kb: &KnowledgeBase,
        task_id: &str,
        enqueued_at: i64,
        request: FaqImportRequest,
    ) -> Result<(), AppError> {
        let container = self.ensure_faq_container(kb).await?;
        let total = request.entries.len();
        let tuning = &self.config.tuning;

        self.save_import_progress(FaqImportProgress {
            task_id: task_id.to_string(),
            kb_id: kb.id.clone(),
            knowledge_id: container.id.clone(),
            status: FaqImportStatus::Pending,
            total,
            message: "任务已创建，等待处理".into(),
            created_at: enqueued_at,
            dry_run: request.dry_run,
            import_mode: Some(request.mode),
            ..FaqImportProgress::default()
        })
        .await?;

        let mut payload = FaqImportPayload {
            tenant_id: kb.tenant_id,
            task_id: task_id.to_string(),
            kb_id: kb.id.clone(),
            knowledge_id: container.id,
            mode: request.mode,
            dry_run: request.dry_run,
            enqueued_at,
            entries: Vec::new(),
            entries_url: String::new(),
            entry_count: total,
        };
        if total > tuning.faq_inline_entry_limit {
            let body = serde_json::to_vec(&request.entries)?;
            payload.entries_url = self
                .storage
                .save_bytes(
                    kb.tenant_id,
                    &format!("faq_import_entries_{task_id}_{enqueued_at}.json"),
                    Bytes::from(body),
                )
                .await?;
            debug!(location = %payload.entries_url, total, "stored FAQ entries out of line");
        } else {
            payload.entries = request.entries;
        }

        let max_retry = if request.dry_run {
            tuning.faq_dry_run_max_retry
        } else {
            tuning.faq_import_max_retry
        };
        let entries_url = payload.entries_url.clone();
        let task = BackgroundTask::new(TaskPayload::FaqImport(payload))
            .with_max_retry(max_retry)
            .with_dedup_key(format!("{task_id}:{enqueued_at}"));
        if let Err(err) = self.enqueue(task).await {
            self.remove_entries_file(&entries_url).await;
            return Err(err);
        }
        Ok(())
    }

    /// Handles a `FaqImport` task. Validation results and commit progress
    /// are checkpointed, so a retried task resumes instead of starting over.
    /// Progress is marked failed only when no retry will follow.
    #[instrument(skip_all, fields(task_id = %payload.task_id, kb_id = %payload.kb_id, last_attempt = is_last_attempt))]
    pub async fn process_faq_import(
        &self,
        payload: &FaqImportPayload,
        is_last_attempt: bool,
    ) -> Result<(), AppError> {
        let outcome = AssertUnwindSafe(self.run_faq_import(payload))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(AppError::InternalError(format!(
                    "FAQ import panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        if let Err(err) = &outcome {
            error!(error = %err, "FAQ import failed");
            if is_last_attempt || err.is_permanent() {
                self.fail_faq_import(payload, err).await;
            }
        }
        outcome
    }

    async fn run_faq_import(&self, payload: &FaqImportPayload) -> Result<(), AppError> {
        let entries = self.load_import_entries(payload).await?;
        let key = faq_import_progress_key(&payload.task_id);
        let existing = ProgressEntry::get::<FaqImportProgress>(&self.db, &key).await?;
        if existing
            .as_ref()
            .is_some_and(|p| p.status == FaqImportStatus::Completed)
        {
            info!("FAQ import already completed; skipping");
            return Ok(());
        }
        let existing = existing.unwrap_or_default();
        let now = Utc::now().timestamp();

        let mut progress = FaqImportProgress {
            task_id: payload.task_id.clone(),
            kb_id: payload.kb_id.clone(),
            knowledge_id: payload.knowledge_id.clone(),
            status: FaqImportStatus::Processing,
            total: entries.len(),
            message: "正在验证条目...".into(),
            created_at: if existing.created_at > 0 {
                existing.created_at
            } else {
                now
            },
            dry_run: payload.dry_run,
            import_mode: Some(payload.mode),
            ..FaqImportProgress::default()
        };
        self.save_import_progress(progress.clone()).await?;

        let kb = match KnowledgeBase::get(&self.db, &payload.kb_id).await {
            Ok(kb) => kb,
            Err(AppError::NotFound(msg)) => {
                return Err(AppError::Validation(format!("获取知识库失败: {msg}")));
            }
            Err(err) => return Err(AppError::Processing(format!("获取知识库失败: {err}"))),
        };

        let (valid, consumed) = if let Some(indices) = existing.valid_entry_indices.clone() {
            info!(valid = indices.len(), processed = existing.processed, "resuming FAQ import");
            progress.failed_entries = existing.failed_entries;
            progress.failed_count = existing.failed_count;
            progress.success_entries = existing.success_entries;
            progress.success_count = existing.success_count;
            progress.skipped_count = existing.skipped_count;
            progress.processed = existing.processed.max(existing.failed_count);
            progress.valid_entry_indices = Some(indices.clone());
            let consumed = existing.processed.saturating_sub(existing.failed_count);
            (indices, consumed)
        } else {
            let indices = self
                .validate_import_entries(&kb, payload.mode, &entries, &mut progress)
                .await?;
            (indices, 0)
        };

        if payload.dry_run || valid.is_empty() {
            if payload.dry_run {
                progress.success_count = valid.len();
            }
            return self.finalize_faq_import(payload, progress).await;
        }

        progress.message = format!("验证完成，开始导入 {} 条有效数据...", valid.len());
        self.save_import_progress(progress.clone()).await?;

        let Some(knowledge) = Knowledge::get(&self.db, &payload.knowledge_id).await? else {
            return Err(AppError::Validation("FAQ 知识不存在".into()));
        };

        let leftovers = Chunk::delete_unindexed(&self.db, &knowledge.id)
            .await
            .map_err(|err| AppError::Processing(format!("清理未索引数据失败: {err}")))?;
        if !leftovers.is_empty() {
            let model = self.embedding_model(&kb).await?;
            let ids: Vec<String> = leftovers.iter().map(|c| c.id.clone()).collect();
            self.services
                .retrieval
                .delete_by_chunk_ids(kb.tenant_id, &ids, model.dimensions(), KnowledgeType::Faq)
                .await?;
            info!(removed = ids.len(), "removed chunks left by an interrupted attempt");
        }

        // Replace-mode deletions already ran before the first checkpoint.
        let mode = if payload.mode == FaqImportMode::Replace && consumed > 0 {
            FaqImportMode::Append
        } else {
            payload.mode
        };
        let remaining = valid.get(consumed..).unwrap_or_default();
        self.commit_faq_entries(&kb, &knowledge, &entries, remaining, mode, &mut progress)
            .await?;
        self.finalize_faq_import(payload, progress).await
    }

    async fn load_import_entries(
        &self,
        payload: &FaqImportPayload,
    ) -> Result<Vec<FaqEntryPayload>, AppError> {
        if !payload.entries.is_empty() || payload.entries_url.is_empty() {
            return Ok(payload.entries.clone());
        }
        let bytes = self.storage.get_file(&payload.entries_url).await?;
        let entries: Vec<FaqEntryPayload> = serde_json::from_slice(&bytes)?;
        debug!(count = entries.len(), "loaded FAQ entries from side file");
        Ok(entries)
    }

    /// Runs the per-entry checks and records failures on `progress`.
    /// Returns the indices of the entries that passed.
    async fn validate_import_entries(
        &self,
        kb: &KnowledgeBase,
        mode: FaqImportMode,
        entries: &[FaqEntryPayload],
        progress: &mut FaqImportProgress,
    ) -> Result<Vec<usize>, AppError> {
        let existing = if mode == FaqImportMode::Append {
            Chunk::list_faq_by_knowledge_base(&self.db, kb.tenant_id, &kb.id).await?
        } else {
            Vec::new()
        };
        let known_tags: HashSet<i64> =
            KnowledgeTag::list_by_knowledge_base(&self.db, kb.tenant_id, &kb.id)
                .await?
                .into_iter()
                .map(|tag| tag.seq_id)
                .collect();
        let mut validator = EntryValidator::new(mode, &existing, known_tags);
        let report_every = self.config.tuning.faq_validation_report_every.max(1);

        let mut valid = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            match validator.check(index, entry) {
                None => valid.push(index),
                Some(reason) => {
                    progress
                        .failed_entries
                        .push(FaqFailedEntry::from_payload(index, reason, entry));
                    progress.failed_count = progress.failed_count.saturating_add(1);
                }
            }
            let checked = index.saturating_add(1);
            if checked.checked_rem(report_every) == Some(0) && checked < entries.len() {
                progress.message = format!("正在验证条目 {checked}/{}...", entries.len());
                self.save_import_progress(progress.clone()).await?;
            }
        }

        progress.processed = progress.failed_count;
        progress.progress = percent(progress.processed, progress.total);
        progress.valid_entry_indices = Some(valid.clone());
        self.save_import_progress(progress.clone()).await?;
        info!(valid = valid.len(), failed = progress.failed_count, "validated FAQ entries");
        Ok(valid)
    }

    /// Writes the valid entries in batches, checkpointing after each one.
    async fn commit_faq_entries(
        &self,
        kb: &KnowledgeBase,
        knowledge: &Knowledge,
        entries: &[FaqEntryPayload],
        indices: &[usize],
        mode: FaqImportMode,
        progress: &mut FaqImportProgress,
    ) -> Result<(), AppError> {
        let mut tags = TagCache::default();
        let plan = match mode {
            FaqImportMode::Append => self.plan_append(kb, entries, indices, &mut tags).await?,
            FaqImportMode::Replace => self.plan_replace(kb, entries, indices, &mut tags).await?,
        };

        if !plan.deletions.is_empty() {
            self.delete_faq_chunk_vectors(kb, &knowledge.id, &plan.deletions)
                .await?;
            let ids: Vec<String> = plan.deletions.iter().map(|c| c.id.clone()).collect();
            Chunk::delete_by_ids(&self.db, &ids).await?;
            info!(deleted = ids.len(), "removed FAQ entries replaced by the import");
        }

        let batch_size = self.config.tuning.faq_import_batch_size.max(1);
        for batch in plan.actions.chunks(batch_size) {
            let mut chunks = Vec::new();
            let mut origins: HashMap<String, (usize, &KnowledgeTag)> = HashMap::new();
            for action in batch {
                match action {
                    Planned::Skip => {
                        progress.skipped_count = progress.skipped_count.saturating_add(1);
                    }
                    Planned::Create { index, meta, tag } => {
                        let Some(entry) = entries.get(*index) else {
                            continue;
                        };
                        let chunk = new_faq_chunk(kb, &knowledge.id, entry, meta.clone(), tag);
                        origins.insert(chunk.id.clone(), (*index, tag));
                        chunks.push(chunk);
                    }
                }
            }

            let created = Chunk::create_batch(&self.db, chunks).await?;
            if let Err(err) = self
                .index_faq_chunks(kb, &knowledge.id, &created, true)
                .await
            {
                self.rollback_faq_batch(kb, &created).await;
                return Err(err);
            }
            let ids: Vec<String> = created.iter().map(|c| c.id.clone()).collect();
            Chunk::mark_indexed(&self.db, &ids).await?;

            for chunk in &created {
                let Some((index, tag)) = origins.get(&chunk.id) else {
                    continue;
                };
                progress.success_entries.push(FaqSuccessEntry {
                    index: *index,
                    seq_id: chunk.seq_id,
                    tag_id: tag.seq_id,
                    tag_name: tag.name.clone(),
                    standard_question: chunk
                        .faq_metadata()
                        .map(|m| m.standard_question.clone())
                        .unwrap_or_default(),
                });
            }
            progress.success_count = progress.success_count.saturating_add(created.len());
            progress.processed = progress.processed.saturating_add(batch.len());
            progress.progress = percent(progress.processed, progress.total);
            progress.message = format!("正在处理第 {}/{} 条", progress.processed, progress.total);
            self.save_import_progress(progress.clone()).await?;
            debug!(created = created.len(), processed = progress.processed, "committed FAQ batch");
        }
        Ok(())
    }

    /// Append mode skips entries whose questions already exist in the base
    /// or earlier in the batch.
    async fn plan_append(
        &self,
        kb: &KnowledgeBase,
        entries: &[FaqEntryPayload],
        indices: &[usize],
        tags: &mut TagCache,
    ) -> Result<ImportPlan, AppError> {
        let mut taken: HashSet<String> =
            Chunk::list_faq_by_knowledge_base(&self.db, kb.tenant_id, &kb.id)
                .await?
                .iter()
                .filter_map(Chunk::faq_metadata)
                .flat_map(|meta| {
                    std::iter::once(meta.standard_question.clone())
                        .chain(meta.similar_questions.iter().cloned())
                })
                .collect();

        let mut actions = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(entry) = entries.get(index) else {
                actions.push(Planned::Skip);
                continue;
            };
            let Ok(meta) = sanitize_entry(entry) else {
                actions.push(Planned::Skip);
                continue;
            };
            let collides = std::iter::once(&meta.standard_question)
                .chain(&meta.similar_questions)
                .any(|q| taken.contains(q));
            if collides {
                actions.push(Planned::Skip);
                continue;
            }
            taken.insert(meta.standard_question.clone());
            taken.extend(meta.similar_questions.iter().cloned());
            let tag = tags.resolve(self, kb, entry).await?;
            actions.push(Planned::Create { index, meta, tag });
        }
        Ok(ImportPlan {
            deletions: Vec::new(),
            actions,
        })
    }

    /// Replace mode keeps existing chunks whose content hash and tag match an
    /// entry, recreates those whose tag changed and deletes the rest.
    async fn plan_replace(
        &self,
        kb: &KnowledgeBase,
        entries: &[FaqEntryPayload],
        indices: &[usize],
        tags: &mut TagCache,
    ) -> Result<ImportPlan, AppError> {
        let existing = Chunk::list_faq_by_knowledge_base(&self.db, kb.tenant_id, &kb.id).await?;
        let mut existing_by_hash: HashMap<&str, &Chunk> = HashMap::new();
        let mut deletions: Vec<Chunk> = Vec::new();
        for chunk in &existing {
            if chunk.content_hash.is_empty() || existing_by_hash.contains_key(chunk.content_hash.as_str()) {
                deletions.push(chunk.clone());
            } else {
                existing_by_hash.insert(chunk.content_hash.as_str(), chunk);
            }
        }

        let mut batch_hashes = HashSet::new();
        let mut actions = Vec::with_capacity(indices.len());
        for &index in indices {
            let Some(entry) = entries.get(index) else {
                actions.push(Planned::Skip);
                continue;
            };
            let Ok(meta) = sanitize_entry(entry) else {
                actions.push(Planned::Skip);
                continue;
            };
            let hash = meta.content_hash();
            if !batch_hashes.insert(hash.clone()) {
                actions.push(Planned::Skip);
                continue;
            }
            let tag = tags.resolve(self, kb, entry).await?;
            match existing_by_hash.get(hash.as_str()) {
                Some(current) if current.tag_id == tag.id => actions.push(Planned::Skip),
                Some(current) => {
                    deletions.push((*current).clone());
                    actions.push(Planned::Create { index, meta, tag });
                }
                None => actions.push(Planned::Create { index, meta, tag }),
            }
        }

        deletions.extend(
            existing_by_hash
                .iter()
                .filter(|(hash, _)| !batch_hashes.contains(**hash))
                .map(|(_, chunk)| (*chunk).clone()),
        );
        Ok(ImportPlan { deletions, actions })
    }

    /// Drops the rows and any partial index writes of a batch that failed to index.
    pub(crate) async fn rollback_faq_batch(&self, kb: &KnowledgeBase, created: &[Chunk]) {
        let ids: Vec<String> = created.iter().map(|c| c.id.clone()).collect();
        if let Err(err) = Chunk::delete_by_ids(&self.db, &ids).await {
            warn!(error = %err, "failed to roll back FAQ chunk rows");
        }
        let dims = match self.embedding_model(kb).await {
            Ok(model) => model.dimensions(),
            Err(err) => {
                warn!(error = %err, "no embedding model to roll back FAQ index writes");
                return;
            }
        };
        if let Err(err) = self
            .services
            .retrieval
            .delete_by_chunk_ids(kb.tenant_id, &ids, dims, KnowledgeType::Faq)
            .await
        {
            warn!(error = %err, "failed to roll back FAQ index writes");
        }
    }

    async fn finalize_faq_import(
        &self,
        payload: &FaqImportPayload,
        mut progress: FaqImportProgress,
    ) -> Result<(), AppError> {
        self.remove_entries_file(&payload.entries_url).await;

        let mut suffix = "";
        if !progress.failed_entries.is_empty() {
            match self
                .upload_failed_entries(payload, &progress.failed_entries)
                .await
            {
                Ok(url) => {
                    progress.failed_entries_url = url;
                    progress.failed_entries.clear();
                    suffix = CSV_EXPORTED_SUFFIX;
                }
                Err(err) => warn!(error = %err, "failed to export failed FAQ entries; keeping them inline"),
            }
        }

        progress.skipped_count = progress
            .total
            .saturating_sub(progress.success_count)
            .saturating_sub(progress.failed_count);

        if !payload.dry_run {
            let imported_at = Utc::now();
            let processing_time_ms = imported_at
                .timestamp_millis()
                .saturating_sub(progress.created_at.saturating_mul(1000))
                .max(0);
            let result = FaqImportResult {
                task_id: payload.task_id.clone(),
                total_entries: progress.total,
                success_count: progress.success_count,
                failed_count: progress.failed_count,
                skipped_count: progress.skipped_count,
                import_mode: payload.mode,
                imported_at,
                processing_time_ms,
                display_status: DISPLAY_STATUS_OPEN.to_string(),
                failed_entries_url: progress.failed_entries_url.clone(),
            };
            if let Some(mut container) = Knowledge::get(&self.db, &payload.knowledge_id).await? {
                container.last_faq_import_result = Some(result);
                container.save(&self.db).await?;
            }
            progress.imported_at = Some(imported_at);
            progress.display_status = DISPLAY_STATUS_OPEN.to_string();
            progress.processing_time_ms = processing_time_ms;

            if payload.mode == FaqImportMode::Replace {
                match KnowledgeTag::delete_unused(&self.db, payload.tenant_id, &payload.kb_id).await {
                    Ok(removed) if removed > 0 => info!(removed, "deleted tags left unused by replace import"),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "failed to delete unused tags"),
                }
            }
        }

        progress.message = if payload.dry_run {
            format!(
                "验证完成：有效 {} 条，失败 {} 条{suffix}",
                progress.success_count, progress.failed_count
            )
        } else {
            format!(
                "导入完成：成功 {} 条，失败 {} 条，跳过 {} 条{suffix}",
                progress.success_count, progress.failed_count, progress.skipped_count
            )
        };
        progress.status = FaqImportStatus::Completed;
        progress.progress = 100;
        progress.processed = progress.total;
        progress.error = String::new();
        self.save_import_progress(progress).await?;
        self.release_import_lock(&payload.kb_id, &payload.task_id)
            .await;
        info!("FAQ import completed");
        Ok(())
    }

    async fn upload_failed_entries(
        &self,
        payload: &FaqImportPayload,
        failed: &[FaqFailedEntry],
    ) -> Result<String, AppError> {
        let csv = failed_entries_csv(failed);
        let location = self
            .storage
            .save_bytes(
                payload.tenant_id,
                &format!("faq_dryrun_failed_{}.csv", payload.task_id),
                Bytes::from(csv),
            )
            .await?;
        Ok(self.storage.file_url(&location, DEFAULT_URL_EXPIRY))
    }

    /// Terminal failure: records the error, drops the side file and frees the
    /// base for the next import. Bookkeeping errors are only logged.
    async fn fail_faq_import(&self, payload: &FaqImportPayload, err: &AppError) {
        let key = faq_import_progress_key(&payload.task_id);
        let mut progress = match ProgressEntry::get::<FaqImportProgress>(&self.db, &key).await {
            Ok(Some(progress)) => progress,
            Ok(None) => FaqImportProgress {
                task_id: payload.task_id.clone(),
                kb_id: payload.kb_id.clone(),
                knowledge_id: payload.knowledge_id.clone(),
                dry_run: payload.dry_run,
                import_mode: Some(payload.mode),
                created_at: payload.enqueued_at,
                ..FaqImportProgress::default()
            },
            Err(read_err) => {
                warn!(error = %read_err, "failed to read FAQ import progress");
                FaqImportProgress::default()
            }
        };
        progress.task_id.clone_from(&payload.task_id);
        progress.status = FaqImportStatus::Failed;
        progress.message = "导入失败".into();
        progress.error = err.to_string();
        if let Err(save_err) = self.save_import_progress(progress).await {
            warn!(error = %save_err, "failed to record FAQ import failure");
        }
        self.remove_entries_file(&payload.entries_url).await;
        self.release_import_lock(&payload.kb_id, &payload.task_id)
            .await;
    }

    pub(crate) async fn save_import_progress(
        &self,
        mut progress: FaqImportProgress,
    ) -> Result<(), AppError> {
        progress.updated_at = Utc::now().timestamp();
        let key = faq_import_progress_key(&progress.task_id);
        ProgressEntry::set(&self.db, &key, &progress, FAQ_PROGRESS_TTL).await
    }

    async fn remove_entries_file(&self, location: &str) {
        if location.is_empty() {
            return;
        }
        if let Err(err) = self.storage.delete_file(location).await {
            warn!(%location, error = %err, "failed to delete FAQ entries side file");
        }
    }

    /// Frees the per-base import slot if `task_id` still holds it.
    async fn release_import_lock(&self, kb_id: &str, task_id: &str) {
        let key = faq_import_running_key(kb_id);
        match ProgressEntry::get::<RunningImportInfo>(&self.db, &key).await {
            Ok(Some(holder)) if holder.task_id == task_id => {
                if let Err(err) = ProgressEntry::delete(&self.db, &key).await {
                    warn!(error = %err, "failed to release FAQ import lock");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "failed to read FAQ import lock"),
        }
    }
}
