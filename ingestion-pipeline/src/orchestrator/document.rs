use std::time::Duration;

use bytes::{Bytes, BytesMut};
use common::{
    error::AppError,
    storage::types::{
        knowledge::{Knowledge, KnowledgeType, ParseStatus},
        knowledge_base::KnowledgeBase,
        task_payloads::DocumentProcessPayload,
    },
};
use reqwest::{header::CONTENT_DISPOSITION, StatusCode};
use tracing::{error, info, instrument, warn};

use super::{
    ensure_manual_file_name, file_type_of, is_file_url_type, is_image_type, parse_public_url,
    passages_to_segments, url_base_name,
};
use crate::{
    engine::KnowledgeEngine,
    pipeline::{ChunkOutcome, ProcessChunksOptions},
    services::{ReadConfig, Segment},
};

pub const IMAGE_WITHOUT_MULTIMODAL: &str = "image not parse without enable multimodel";

/// A remote file fetched for a `file_url` knowledge.
struct Download {
    bytes: Bytes,
    file_name: String,
    file_type: String,
}

impl KnowledgeEngine {
    /// Handles a `DocumentProcess` task: reads the source, then hands the
    /// segments to chunk processing.
    ///
    /// Transient failures return an error so the queue retries; the knowledge
    /// is only marked `failed` for them on the last attempt. Problems that a
    /// retry cannot fix mark it `failed` at once.
    #[instrument(skip_all, fields(knowledge_id = %payload.knowledge_id, last_attempt = is_last_attempt))]
    pub async fn process_document(
        &self,
        payload: &DocumentProcessPayload,
        is_last_attempt: bool,
    ) -> Result<(), AppError> {
        let Some(knowledge) = Knowledge::get(&self.db, &payload.knowledge_id).await? else {
            info!("knowledge no longer exists; skipping");
            return Ok(());
        };
        if knowledge.tenant_id != payload.tenant_id {
            warn!(tenant_id = payload.tenant_id, "knowledge belongs to another tenant; skipping");
            return Ok(());
        }
        match knowledge.parse_status {
            ParseStatus::Deleting => {
                info!("knowledge is being deleted; aborting processing");
                return Ok(());
            }
            ParseStatus::Completed => {
                info!("document already completed; skipping");
                return Ok(());
            }
            ParseStatus::Failed => warn!(
                error = %knowledge.error_message,
                "document processing previously failed; retrying"
            ),
            _ => {}
        }

        let kb = match KnowledgeBase::get(&self.db, &payload.knowledge_base_id).await {
            Ok(kb) => kb,
            Err(err) => {
                error!(error = %err, "failed to load knowledge base");
                self.fail_document(&knowledge.id, &format!("failed to get knowledge base: {err}"))
                    .await?;
                return Ok(());
            }
        };

        let Some(knowledge) =
            Knowledge::update_parse_status(&self.db, &knowledge.id, ParseStatus::Processing, "")
                .await?
        else {
            info!("knowledge entered deleting before processing started");
            return Ok(());
        };

        if !payload.file_path.is_empty()
            && !payload.enable_multimodal
            && is_image_type(&payload.file_type)
        {
            error!("image upload without multimodal support");
            self.fail_document(&knowledge.id, IMAGE_WITHOUT_MULTIMODAL).await?;
            return Err(AppError::Validation(IMAGE_WITHOUT_MULTIMODAL.into()));
        }

        let segments = match self.read_segments(payload, &kb, &knowledge).await {
            Ok(segments) => segments,
            Err(err) if err.is_permanent() => {
                error!(error = %err, "document source rejected");
                self.fail_document(&knowledge.id, &err.to_string()).await?;
                return Err(err);
            }
            Err(err) => {
                error!(error = %err, "failed to read document source");
                if is_last_attempt {
                    self.fail_document(&knowledge.id, &err.to_string()).await?;
                }
                return Err(err);
            }
        };

        let knowledge = Knowledge::get(&self.db, &knowledge.id)
            .await?
            .unwrap_or(knowledge);
        let options = ProcessChunksOptions {
            enable_question_generation: payload.enable_question_generation,
            question_count: payload.question_count,
        };
        match self.process_chunks(&kb, &knowledge, segments, options).await? {
            ChunkOutcome::Completed { chunk_count, .. } => {
                info!(chunk_count, "document processed");
            }
            ChunkOutcome::Aborted => info!("document processing aborted by deletion"),
            ChunkOutcome::Failed(message) => warn!(%message, "document processing failed"),
        }
        Ok(())
    }

    async fn read_segments(
        &self,
        payload: &DocumentProcessPayload,
        kb: &KnowledgeBase,
        knowledge: &Knowledge,
    ) -> Result<Vec<Segment>, AppError> {
        let config = ReadConfig::for_knowledge_base(kb, payload.enable_multimodal);
        let reader = &self.services.reader;

        if !payload.file_url.is_empty() {
            // Checked again here: DNS may have changed since the knowledge was created.
            parse_public_url(&payload.file_url)?;
            let download = self
                .download_file(&payload.file_url, &payload.file_name, &payload.file_type)
                .await?;
            if !download.file_type.is_empty() && !is_file_url_type(&download.file_type) {
                return Err(AppError::Validation(format!(
                    "unsupported file type: {}",
                    download.file_type
                )));
            }
            self.record_resolved_file(knowledge, &download).await?;
            return reader
                .read_from_file(download.bytes, &download.file_name, &download.file_type, &config)
                .await;
        }

        if !payload.url.is_empty() {
            parse_public_url(&payload.url)?;
            return reader
                .read_from_url(&payload.url, &knowledge.title, &config)
                .await;
        }

        if !payload.passages.is_empty() {
            return Ok(passages_to_segments(&payload.passages));
        }

        if knowledge.knowledge_type == KnowledgeType::Manual {
            let content = knowledge
                .manual()
                .map(|meta| meta.content.trim().to_string())
                .filter(|content| !content.is_empty())
                .ok_or_else(|| AppError::Validation("无法获取手工知识内容".into()))?;
            let file_name = ensure_manual_file_name(&knowledge.title);
            return reader
                .read_from_file(Bytes::from(content), &file_name, "md", &config)
                .await;
        }

        if payload.file_path.is_empty() {
            return Err(AppError::Validation(
                "document task carries no source to read".into(),
            ));
        }
        let bytes = self.storage.get_file(&payload.file_path).await?;
        reader
            .read_from_file(bytes, &payload.file_name, &payload.file_type, &config)
            .await
    }

    /// Streams a remote file into memory, refusing anything above the
    /// configured size cap.
    async fn download_file(
        &self,
        url: &str,
        file_name_hint: &str,
        file_type_hint: &str,
    ) -> Result<Download, AppError> {
        let tuning = &self.config.tuning;
        let max_bytes = tuning.file_url_max_bytes;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(tuning.file_url_timeout_secs))
            .build()?;

        let mut response = client.get(url).send().await?;
        if response.status() != StatusCode::OK {
            return Err(AppError::Processing(format!(
                "remote server returned status {}",
                response.status().as_u16()
            )));
        }
        if let Some(length) = response.content_length() {
            if usize::try_from(length).map_or(true, |length| length > max_bytes) {
                return Err(AppError::Validation(format!(
                    "file size {length} bytes exceeds limit of {max_bytes} bytes"
                )));
            }
        }

        let mut file_name = file_name_hint.trim().to_string();
        if file_name.is_empty() {
            file_name = response
                .headers()
                .get(CONTENT_DISPOSITION)
                .and_then(|value| value.to_str().ok())
                .and_then(file_name_from_content_disposition)
                .unwrap_or_default();
        }
        if file_name.is_empty() {
            file_name = reqwest::Url::parse(url)
                .ok()
                .and_then(|parsed| url_base_name(&parsed))
                .unwrap_or_default();
        }
        let file_type = if file_type_hint.trim().is_empty() {
            file_type_of(&file_name)
        } else {
            file_type_hint.trim().to_ascii_lowercase()
        };

        let mut buffer = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            if buffer.len().saturating_add(chunk.len()) > max_bytes {
                return Err(AppError::Validation(format!(
                    "file size exceeds limit of {max_bytes} bytes"
                )));
            }
            buffer.extend_from_slice(&chunk);
        }

        info!(%url, size = buffer.len(), %file_name, "downloaded remote file");
        Ok(Download {
            bytes: buffer.freeze(),
            file_name,
            file_type,
        })
    }

    /// Fills in file name and type learned from the download when the record
    /// had none.
    async fn record_resolved_file(
        &self,
        knowledge: &Knowledge,
        download: &Download,
    ) -> Result<(), AppError> {
        let fill_name = knowledge.file_name.is_empty() && !download.file_name.is_empty();
        let fill_type = knowledge.file_type.is_empty() && !download.file_type.is_empty();
        if !fill_name && !fill_type {
            return Ok(());
        }
        let mut updated = knowledge.clone();
        if fill_name {
            updated.file_name.clone_from(&download.file_name);
        }
        if fill_type {
            updated.file_type.clone_from(&download.file_type);
        }
        updated.save(&self.db).await?;
        Ok(())
    }

    async fn fail_document(&self, knowledge_id: &str, message: &str) -> Result<(), AppError> {
        Knowledge::update_parse_status(&self.db, knowledge_id, ParseStatus::Failed, message)
            .await?;
        Ok(())
    }
}

/// Extracts the file name from a `Content-Disposition` header, preferring the
/// RFC 5987 `filename*` form.
pub(crate) fn file_name_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for part in header.split(';').map(str::trim) {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = value.rsplit("''").next().unwrap_or(value);
                let decoded = url::form_urlencoded::parse(format!("n={encoded}").as_bytes())
                    .next()
                    .map(|(_, decoded)| decoded.into_owned())
                    .unwrap_or_default();
                if !decoded.is_empty() {
                    return Some(decoded);
                }
            }
            "filename" if !value.is_empty() => plain = Some(value.to_string()),
            _ => {}
        }
    }
    plain
}
