//! Edits to processed knowledge that do not require reprocessing: tag
//! assignment and corrections to extracted image details.

use std::collections::HashMap;

use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkType, ImageInfo},
        knowledge::Knowledge,
        knowledge_base::KnowledgeBase,
        tag::KnowledgeTag,
    },
    utils::hashing::md5_of_parts,
};
use tracing::{info, instrument};

use crate::{engine::KnowledgeEngine, services::IndexInfo};

impl KnowledgeEngine {
    /// Sets or clears the tag of one knowledge item. Its chunks keep their
    /// own tags.
    pub async fn update_knowledge_tag(
        &self,
        tenant_id: u64,
        knowledge_id: &str,
        tag_id: Option<&str>,
    ) -> Result<Knowledge, AppError> {
        let mut knowledge = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id).await?;
        knowledge.tag_id = self.knowledge_tag_id(&knowledge, tag_id).await?;
        knowledge.save(&self.db).await
    }

    /// Batch form of [`Self::update_knowledge_tag`]. Every tag is checked
    /// before any item is written.
    #[instrument(skip_all, fields(tenant_id = tenant_id, count = updates.len()))]
    pub async fn update_knowledge_tag_batch(
        &self,
        tenant_id: u64,
        updates: &HashMap<String, Option<String>>,
    ) -> Result<(), AppError> {
        let mut resolved = Vec::with_capacity(updates.len());
        for (knowledge_id, tag_id) in updates {
            let knowledge = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id).await?;
            let tag_id = self.knowledge_tag_id(&knowledge, tag_id.as_deref()).await?;
            resolved.push((knowledge, tag_id));
        }

        let mut changed = 0usize;
        for (mut knowledge, tag_id) in resolved {
            if knowledge.tag_id != tag_id {
                knowledge.tag_id = tag_id;
                knowledge.save(&self.db).await?;
                changed += 1;
            }
        }
        info!(changed, "updated knowledge tags");
        Ok(())
    }

    /// Replaces the image details of a chunk. Caption and OCR sub-chunks of
    /// the same image follow the new text, missing ones are created, and the
    /// touched sub-chunks are re-indexed.
    #[instrument(skip_all, fields(tenant_id = tenant_id, knowledge_id = %knowledge_id, chunk_id = %chunk_id))]
    pub async fn update_image_info(
        &self,
        tenant_id: u64,
        knowledge_id: &str,
        chunk_id: &str,
        image: ImageInfo,
    ) -> Result<(), AppError> {
        let mut knowledge = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id).await?;
        let mut chunk = self
            .db
            .get_item::<Chunk>(chunk_id)
            .await?
            .filter(|c| c.tenant_id == tenant_id && c.knowledge_id == knowledge.id)
            .ok_or_else(|| AppError::NotFound("分块不存在".into()))?;
        chunk.image_info = vec![image.clone()];

        let mut touched = Vec::new();
        let (mut has_caption, mut has_ocr) = (false, false);
        for mut child in Chunk::list_by_parent(&self.db, tenant_id, &chunk.id).await? {
            let same_image = child
                .image_info
                .first()
                .is_some_and(|info| info.original_url == image.original_url);
            if !same_image {
                continue;
            }
            let text = match child.chunk_type {
                ChunkType::ImageCaption => {
                    has_caption = true;
                    &image.caption
                }
                ChunkType::ImageOcr => {
                    has_ocr = true;
                    &image.ocr_text
                }
                _ => continue,
            };
            if !text.is_empty() && child.content != *text {
                child.content.clone_from(text);
                child.image_info = vec![image.clone()];
                touched.push(child.save(&self.db).await?);
            }
        }

        let mut created = Vec::new();
        if !has_caption && !image.caption.is_empty() {
            created.push(image_sub_chunk(&chunk, ChunkType::ImageCaption, &image));
        }
        if !has_ocr && !image.ocr_text.is_empty() {
            created.push(image_sub_chunk(&chunk, ChunkType::ImageOcr, &image));
        }
        touched.extend(Chunk::create_batch(&self.db, created).await?);
        chunk.save(&self.db).await?;

        if !touched.is_empty() {
            let kb =
                KnowledgeBase::get_for_tenant(&self.db, tenant_id, &knowledge.knowledge_base_id).await?;
            let model = self.embedding_model(&kb).await?;
            let infos: Vec<IndexInfo> = touched
                .iter()
                .map(|c| IndexInfo::for_chunk(c, knowledge.knowledge_type))
                .collect();
            self.services
                .retrieval
                .batch_index(tenant_id, model.as_ref(), &infos)
                .await?;
        }

        let image_json = serde_json::to_string(&image)?;
        knowledge.file_hash = md5_of_parts(&[
            knowledge.id.as_str(),
            knowledge.file_hash.as_str(),
            image_json.as_str(),
        ]);
        knowledge.save(&self.db).await?;
        info!(reindexed = touched.len(), "updated image info");
        Ok(())
    }

    /// Id of a tag in the knowledge's base; `None` or empty clears it.
    async fn knowledge_tag_id(
        &self,
        knowledge: &Knowledge,
        tag_id: Option<&str>,
    ) -> Result<String, AppError> {
        let Some(tag_id) = tag_id.filter(|id| !id.is_empty()) else {
            return Ok(String::new());
        };
        let tag = KnowledgeTag::get_by_id(&self.db, knowledge.tenant_id, tag_id)
            .await?
            .ok_or_else(|| AppError::BadRequest("标签不存在".into()))?;
        if tag.knowledge_base_id != knowledge.knowledge_base_id {
            return Err(AppError::BadRequest("标签不属于当前知识库".into()));
        }
        Ok(tag.id)
    }
}

fn image_sub_chunk(parent: &Chunk, chunk_type: ChunkType, image: &ImageInfo) -> Chunk {
    let content = match chunk_type {
        ChunkType::ImageCaption => image.caption.clone(),
        _ => image.ocr_text.clone(),
    };
    let mut chunk = Chunk::new(
        parent.tenant_id,
        &parent.knowledge_id,
        &parent.knowledge_base_id,
        chunk_type,
        content,
    );
    chunk.parent_chunk_id = parent.id.clone();
    chunk.chunk_index = parent.chunk_index;
    chunk.start_at = parent.start_at;
    chunk.end_at = parent.end_at;
    chunk.tag_id = parent.tag_id.clone();
    chunk.image_info = vec![image.clone()];
    chunk
}
