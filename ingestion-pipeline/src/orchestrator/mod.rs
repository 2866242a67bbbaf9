//! Ingestion orchestrator: turns files, URLs, passages and manual notes into
//! `pending` knowledge records and schedules their processing.
//!
//! Every create operation validates its input before touching storage,
//! fingerprints the source and returns an existing record flagged as a
//! duplicate instead of creating a second one.

mod document;
mod lifecycle;
mod metadata;
pub mod validation;

#[cfg(test)]
mod tests;

use bytes::Bytes;
use chrono::Utc;
use common::{
    error::AppError,
    storage::types::{
        background_task::BackgroundTask,
        knowledge::{Knowledge, KnowledgeType, ManualMetadata, ManualStatus, ParseStatus},
        knowledge_base::KnowledgeBase,
        task_payloads::{DocumentProcessPayload, TaskPayload},
        tenant::Tenant,
    },
    utils::hashing::md5_hex,
};
use tracing::{info, instrument, warn};

use self::validation::{
    clean_markdown, ensure_manual_file_name, file_type_of, is_allowed_file_type,
    is_file_url, is_file_url_type, is_image_type, parse_public_url, sanitize_input,
    sanitize_passage, url_base_name,
};
use crate::{
    engine::KnowledgeEngine,
    pipeline::{ChunkOutcome, ProcessChunksOptions, QUOTA_EXCEEDED_MESSAGE},
    services::Segment,
};

/// Result of a create call. `duplicate` is set when an identical source
/// already existed; `knowledge` is then that existing record.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateOutcome {
    pub knowledge: Knowledge,
    pub duplicate: bool,
}

impl CreateOutcome {
    fn created(knowledge: Knowledge) -> Self {
        Self {
            knowledge,
            duplicate: false,
        }
    }

    fn duplicate(knowledge: Knowledge) -> Self {
        Self {
            knowledge,
            duplicate: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileUpload {
    pub file_name: String,
    pub bytes: Bytes,
    pub tag_id: String,
    /// Overrides the knowledge base default when set.
    pub enable_multimodal: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct UrlSource {
    pub url: String,
    pub title: String,
    pub tag_id: String,
    /// Hints that force the file-download route.
    pub file_name: String,
    pub file_type: String,
    pub enable_multimodal: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct ManualInput {
    pub title: String,
    pub content: String,
    /// `draft` (default) or `publish`.
    pub status: String,
    pub tag_id: String,
}

/// Checked manual input shared by create and update.
struct ManualDraft {
    title: String,
    content: String,
    status: ManualStatus,
}

impl KnowledgeEngine {
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, file_name = %upload.file_name))]
    pub async fn create_knowledge_from_file(
        &self,
        tenant_id: u64,
        kb_id: &str,
        upload: FileUpload,
    ) -> Result<CreateOutcome, AppError> {
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;
        let file_type = file_type_of(&upload.file_name);

        if is_image_type(&file_type) {
            if !kb.has_storage_bucket() {
                return Err(AppError::BadRequest(
                    "上传图片文件需要完整的对象存储配置信息, 请前往系统设置页面进行补全".into(),
                ));
            }
            if !kb.has_vlm() {
                return Err(AppError::BadRequest("上传图片文件需要设置VLM模型".into()));
            }
        }
        if !is_allowed_file_type(&file_type) {
            return Err(AppError::BadRequest(format!("不支持的文件类型: {file_type}")));
        }

        let file_hash = md5_hex(&upload.bytes);
        let file_size = i64::try_from(upload.bytes.len()).unwrap_or(i64::MAX);
        if let Some(existing) = Knowledge::find_duplicate_file(
            &self.db,
            tenant_id,
            kb_id,
            &upload.file_name,
            file_size,
            &file_hash,
        )
        .await?
        {
            return self.refresh_duplicate(existing).await;
        }

        self.ensure_quota(tenant_id).await?;

        let safe_name = sanitize_input(&upload.file_name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::Validation("文件名包含非法字符".into()))?;

        let mut knowledge = Knowledge::new(
            tenant_id,
            kb_id,
            KnowledgeType::File,
            safe_name.clone(),
            &kb.embedding_model_id,
        );
        knowledge.file_name = safe_name;
        knowledge.file_type = file_type;
        knowledge.file_size = file_size;
        knowledge.file_hash = file_hash;
        knowledge.tag_id = upload.tag_id;
        let knowledge = knowledge.create(&self.db).await?;

        let location = match self
            .storage
            .save_file(tenant_id, &knowledge.id, &knowledge.file_name, upload.bytes)
            .await
        {
            Ok(location) => location,
            Err(err) => {
                warn!(knowledge_id = %knowledge.id, error = %err, "failed to store uploaded file");
                Knowledge::delete_by_ids(&self.db, std::slice::from_ref(&knowledge.id)).await?;
                return Err(err.into());
            }
        };

        let mut knowledge = knowledge;
        knowledge.file_path = location;
        let knowledge = knowledge.save(&self.db).await?;

        let enable_multimodal = upload
            .enable_multimodal
            .unwrap_or_else(|| kb.is_multimodal_enabled());
        let payload = DocumentProcessPayload {
            file_path: knowledge.file_path.clone(),
            file_name: knowledge.file_name.clone(),
            file_type: knowledge.file_type.clone(),
            ..document_payload(&kb, &knowledge, enable_multimodal)
        };
        self.schedule_document(payload).await;

        info!(knowledge_id = %knowledge.id, size = file_size, "knowledge created from file");
        Ok(CreateOutcome::created(knowledge))
    }

    /// Creates a knowledge from a web page, or from a remote file when the URL
    /// (or a name/type hint) points at a downloadable document.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, url = %source.url))]
    pub async fn create_knowledge_from_url(
        &self,
        tenant_id: u64,
        kb_id: &str,
        source: UrlSource,
    ) -> Result<CreateOutcome, AppError> {
        if is_file_url(&source.url, &source.file_name, &source.file_type) {
            return self
                .create_knowledge_from_file_url(tenant_id, kb_id, source)
                .await;
        }

        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;
        let url = parse_public_url(&source.url)?;
        let url = url.to_string();

        let file_hash = md5_hex(url.as_bytes());
        if let Some(existing) =
            Knowledge::find_duplicate_hash(&self.db, tenant_id, kb_id, KnowledgeType::Url, &file_hash)
                .await?
        {
            return self.refresh_duplicate(existing).await;
        }

        self.ensure_quota(tenant_id).await?;

        let title = non_empty_or(&source.title, &url);
        let mut knowledge = Knowledge::new(
            tenant_id,
            kb_id,
            KnowledgeType::Url,
            title,
            &kb.embedding_model_id,
        );
        knowledge.source.clone_from(&url);
        knowledge.file_hash = file_hash;
        knowledge.tag_id = source.tag_id;
        let knowledge = knowledge.create(&self.db).await?;

        let enable_multimodal = source
            .enable_multimodal
            .unwrap_or_else(|| kb.is_multimodal_enabled());
        let payload = DocumentProcessPayload {
            url,
            ..document_payload(&kb, &knowledge, enable_multimodal)
        };
        self.schedule_document(payload).await;

        info!(knowledge_id = %knowledge.id, "knowledge created from url");
        Ok(CreateOutcome::created(knowledge))
    }

    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, url = %source.url))]
    pub async fn create_knowledge_from_file_url(
        &self,
        tenant_id: u64,
        kb_id: &str,
        source: UrlSource,
    ) -> Result<CreateOutcome, AppError> {
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;
        let parsed = parse_public_url(&source.url)?;
        let url = parsed.to_string();
        let base_name = url_base_name(&parsed).unwrap_or_default();

        let file_name = non_empty_or(&source.file_name, &base_name);
        let file_type = if source.file_type.trim().is_empty() {
            file_type_of(&file_name)
        } else {
            source.file_type.trim().to_ascii_lowercase()
        };
        if !file_type.is_empty() && !is_file_url_type(&file_type) {
            return Err(AppError::BadRequest(format!(
                "不支持的文件类型: {file_type}，仅支持 txt, md, pdf, docx, doc"
            )));
        }

        let display_name = [
            file_name.as_str(),
            source.title.trim(),
            base_name.as_str(),
            url.as_str(),
        ]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .unwrap_or_default()
        .to_string();

        let file_hash = md5_hex(url.as_bytes());
        if let Some(existing) = Knowledge::find_duplicate_hash(
            &self.db,
            tenant_id,
            kb_id,
            KnowledgeType::FileUrl,
            &file_hash,
        )
        .await?
        {
            return self.refresh_duplicate(existing).await;
        }

        self.ensure_quota(tenant_id).await?;

        let title = non_empty_or(&source.title, &display_name);
        let mut knowledge = Knowledge::new(
            tenant_id,
            kb_id,
            KnowledgeType::FileUrl,
            title,
            &kb.embedding_model_id,
        );
        knowledge.file_name = display_name;
        knowledge.file_type.clone_from(&file_type);
        knowledge.source.clone_from(&url);
        knowledge.file_hash = file_hash;
        knowledge.tag_id = source.tag_id;
        let knowledge = knowledge.create(&self.db).await?;

        let enable_multimodal = source
            .enable_multimodal
            .unwrap_or_else(|| kb.is_multimodal_enabled());
        let payload = DocumentProcessPayload {
            file_url: url,
            file_name,
            file_type,
            ..document_payload(&kb, &knowledge, enable_multimodal)
        };
        self.schedule_document(payload).await;

        info!(knowledge_id = %knowledge.id, "knowledge created from file url");
        Ok(CreateOutcome::created(knowledge))
    }

    /// Creates a passage knowledge and queues its processing.
    pub async fn create_knowledge_from_passage(
        &self,
        tenant_id: u64,
        kb_id: &str,
        passages: Vec<String>,
    ) -> Result<CreateOutcome, AppError> {
        let (kb, knowledge, passages) = self
            .create_passage_knowledge(tenant_id, kb_id, passages)
            .await?;

        let payload = DocumentProcessPayload {
            passages,
            ..document_payload(&kb, &knowledge, false)
        };
        self.schedule_document(payload).await;
        Ok(CreateOutcome::created(knowledge))
    }

    /// Like [`Self::create_knowledge_from_passage`] but processes the chunks
    /// before returning. The returned record reflects the final status.
    pub async fn create_knowledge_from_passage_sync(
        &self,
        tenant_id: u64,
        kb_id: &str,
        passages: Vec<String>,
    ) -> Result<CreateOutcome, AppError> {
        let (kb, knowledge, passages) = self
            .create_passage_knowledge(tenant_id, kb_id, passages)
            .await?;

        let Some(processing) =
            Knowledge::update_parse_status(&self.db, &knowledge.id, ParseStatus::Processing, "")
                .await?
        else {
            return Ok(CreateOutcome::created(knowledge));
        };

        let outcome = self
            .process_chunks(
                &kb,
                &processing,
                passages_to_segments(&passages),
                ProcessChunksOptions::default(),
            )
            .await?;
        if let ChunkOutcome::Failed(message) = &outcome {
            warn!(knowledge_id = %knowledge.id, %message, "passage processing failed");
        }

        let current = Knowledge::get(&self.db, &knowledge.id)
            .await?
            .unwrap_or(processing);
        Ok(CreateOutcome::created(current))
    }

    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id, passages = passages.len()))]
    async fn create_passage_knowledge(
        &self,
        tenant_id: u64,
        kb_id: &str,
        passages: Vec<String>,
    ) -> Result<(KnowledgeBase, Knowledge, Vec<String>), AppError> {
        let mut safe = Vec::with_capacity(passages.len());
        for (index, passage) in passages.iter().enumerate() {
            let cleaned = sanitize_passage(passage).ok_or_else(|| {
                AppError::Validation(format!("段落 {} 包含非法内容", index.saturating_add(1)))
            })?;
            safe.push(cleaned);
        }

        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;
        let knowledge = Knowledge::new(
            tenant_id,
            kb_id,
            KnowledgeType::Passage,
            String::new(),
            &kb.embedding_model_id,
        )
        .create(&self.db)
        .await?;

        info!(knowledge_id = %knowledge.id, "knowledge created from passages");
        Ok((kb, knowledge, safe))
    }

    /// Saves a hand-written Markdown note. Drafts are stored only; published
    /// notes are parsed and indexed like an uploaded Markdown file.
    #[instrument(skip_all, fields(tenant_id = tenant_id, kb_id = %kb_id))]
    pub async fn create_knowledge_from_manual(
        &self,
        tenant_id: u64,
        kb_id: &str,
        input: ManualInput,
    ) -> Result<CreateOutcome, AppError> {
        let draft = self.check_manual_input(&input)?;
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, kb_id).await?;

        let title = if draft.title.is_empty() {
            format!("Knowledge-{}", Utc::now().format("%Y%m%d-%H%M%S"))
        } else {
            draft.title
        };

        let mut knowledge = Knowledge::new(
            tenant_id,
            kb_id,
            KnowledgeType::Manual,
            title,
            &kb.embedding_model_id,
        );
        knowledge.file_name = ensure_manual_file_name(&knowledge.title);
        knowledge.file_type = KnowledgeType::Manual.as_str().to_string();
        knowledge.source = KnowledgeType::Manual.as_str().to_string();
        knowledge.tag_id = input.tag_id;
        knowledge.parse_status = match draft.status {
            ManualStatus::Draft => ParseStatus::Draft,
            ManualStatus::Publish => ParseStatus::Pending,
        };
        knowledge.metadata.manual = Some(ManualMetadata {
            content: draft.content,
            status: draft.status,
            version: 1,
            updated_at: Utc::now(),
        });
        let knowledge = knowledge.create(&self.db).await?;

        if draft.status == ManualStatus::Publish {
            info!(knowledge_id = %knowledge.id, "manual knowledge published; scheduling indexing");
            self.schedule_document(manual_payload(&kb, &knowledge)).await;
        }
        Ok(CreateOutcome::created(knowledge))
    }

    fn check_manual_input(&self, input: &ManualInput) -> Result<ManualDraft, AppError> {
        let content = clean_markdown(&input.content);
        if content.trim().is_empty() {
            return Err(AppError::Validation("内容不能为空".into()));
        }
        let max_chars = self.config.tuning.manual_content_max_chars;
        if content.chars().count() > max_chars {
            return Err(AppError::Validation(format!(
                "内容长度超出限制（最多{max_chars}个字符）"
            )));
        }
        let title = sanitize_input(&input.title)
            .ok_or_else(|| AppError::Validation("标题包含非法字符或超出长度限制".into()))?;
        let status = ManualStatus::parse(&input.status.to_lowercase())
            .ok_or_else(|| AppError::Validation("状态仅支持 draft 或 publish".into()))?;

        Ok(ManualDraft {
            title,
            content,
            status,
        })
    }

    async fn refresh_duplicate(&self, existing: Knowledge) -> Result<CreateOutcome, AppError> {
        info!(knowledge_id = %existing.id, "duplicate source; returning existing knowledge");
        let refreshed = Knowledge::touch(&self.db, &existing.id)
            .await?
            .unwrap_or(existing);
        Ok(CreateOutcome::duplicate(refreshed))
    }

    /// Rejects new sources once the tenant has used up its quota. A tenant
    /// without a record is treated as unlimited.
    async fn ensure_quota(&self, tenant_id: u64) -> Result<(), AppError> {
        match Tenant::get(&self.db, tenant_id).await {
            Ok(tenant) if tenant.is_quota_exhausted() => {
                info!(
                    tenant_id,
                    used = tenant.storage_used,
                    quota = tenant.storage_quota,
                    "rejecting ingestion: storage quota exhausted"
                );
                Err(AppError::QuotaExceeded(QUOTA_EXCEEDED_MESSAGE.into()))
            }
            Ok(_) | Err(AppError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Enqueues document processing. The knowledge is already stored, so a
    /// failure here is logged and left for a manual reparse.
    async fn schedule_document(&self, payload: DocumentProcessPayload) {
        let knowledge_id = payload.knowledge_id.clone();
        let task = BackgroundTask::new(TaskPayload::DocumentProcess(payload));
        if let Err(err) = self.enqueue(task).await {
            warn!(%knowledge_id, error = %err, "failed to enqueue document processing");
        }
    }
}

/// Payload skeleton carrying the knowledge ids and the base's enrichment settings.
fn document_payload(
    kb: &KnowledgeBase,
    knowledge: &Knowledge,
    enable_multimodal: bool,
) -> DocumentProcessPayload {
    let generation = &kb.question_generation_config;
    DocumentProcessPayload {
        tenant_id: knowledge.tenant_id,
        knowledge_id: knowledge.id.clone(),
        knowledge_base_id: knowledge.knowledge_base_id.clone(),
        enable_multimodal,
        enable_question_generation: generation.enabled,
        question_count: if generation.question_count > 0 {
            generation.question_count
        } else {
            3
        },
        ..DocumentProcessPayload::default()
    }
}

/// Manual notes are parsed as Markdown without question generation.
fn manual_payload(kb: &KnowledgeBase, knowledge: &Knowledge) -> DocumentProcessPayload {
    DocumentProcessPayload {
        file_name: ensure_manual_file_name(&knowledge.title),
        file_type: "md".to_string(),
        enable_question_generation: false,
        ..document_payload(kb, knowledge, kb.is_multimodal_enabled())
    }
}

/// One segment per non-empty passage, with character offsets running across
/// the whole passage list.
pub(crate) fn passages_to_segments(passages: &[String]) -> Vec<Segment> {
    let mut segments = Vec::with_capacity(passages.len());
    let mut start: i64 = 0;
    for (seq, passage) in passages.iter().enumerate() {
        if passage.is_empty() {
            continue;
        }
        let length = i64::try_from(passage.chars().count()).unwrap_or(i64::MAX);
        let end = start.saturating_add(length);
        segments.push(Segment {
            content: passage.clone(),
            seq: i64::try_from(seq).unwrap_or(i64::MAX),
            start,
            end,
            images: Vec::new(),
        });
        start = end;
    }
    segments
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}
