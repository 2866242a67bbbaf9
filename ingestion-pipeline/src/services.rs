//! Contracts of the collaborators the engine drives: the vector index, the
//! model providers, the document reader and the knowledge graph.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::types::{
        chunk::Chunk,
        knowledge::KnowledgeType,
        knowledge_base::{ChunkingConfig, KnowledgeBase},
    },
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Text projection of a chunk handed to the retrieval engine. A chunk can
/// produce several of these; extra ones use `"{chunk_id}-{suffix}"` as
/// `source_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub content: String,
    pub source_id: String,
    pub chunk_id: String,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    pub knowledge_type: KnowledgeType,
    pub tag_id: String,
    pub is_enabled: bool,
    pub is_recommended: bool,
}

impl IndexInfo {
    pub fn for_chunk(chunk: &Chunk, knowledge_type: KnowledgeType) -> Self {
        Self {
            content: chunk.content.clone(),
            source_id: chunk.id.clone(),
            chunk_id: chunk.id.clone(),
            knowledge_id: chunk.knowledge_id.clone(),
            knowledge_base_id: chunk.knowledge_base_id.clone(),
            knowledge_type,
            tag_id: chunk.tag_id.clone(),
            is_enabled: chunk.is_enabled,
            is_recommended: chunk.is_recommended(),
        }
    }

    /// Same chunk, different indexed text under a derived source id.
    #[must_use]
    pub fn derived(&self, suffix: &str, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source_id: format!("{}-{suffix}", self.chunk_id),
            ..self.clone()
        }
    }
}

/// A similarity query against one knowledge base.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchParams {
    pub knowledge_base_id: String,
    pub query: String,
    pub vector_threshold: f64,
    pub match_count: usize,
    /// Empty searches every tag.
    pub tag_ids: Vec<String>,
}

/// Best-scoring indexed text of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f64,
    pub matched_content: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReadConfig {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub separators: Vec<String>,
    pub enable_multimodal: bool,
}

impl ReadConfig {
    pub fn for_knowledge_base(kb: &KnowledgeBase, enable_multimodal: bool) -> Self {
        let ChunkingConfig {
            chunk_size,
            chunk_overlap,
            separators,
        } = kb.chunking_config.clone();
        Self {
            chunk_size,
            chunk_overlap,
            separators,
            enable_multimodal,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageSegment {
    pub url: String,
    #[serde(default)]
    pub original_url: String,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub ocr_text: String,
}

/// One parsed unit returned by the document reader.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Segment {
    pub content: String,
    pub seq: i64,
    #[serde(default)]
    pub start: i64,
    #[serde(default)]
    pub end: i64,
    #[serde(default)]
    pub images: Vec<ImageSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNamespace {
    pub knowledge_base_id: String,
    pub knowledge_id: String,
}

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn id(&self) -> &str;

    fn dimensions(&self) -> u32;

    async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, AppError>;
}

#[async_trait]
pub trait ChatModel: Send + Sync {
    fn id(&self) -> &str;

    async fn chat(
        &self,
        system: Option<&str>,
        user: &str,
        options: ChatOptions,
    ) -> Result<String, AppError>;
}

/// Resolves the model a knowledge base names.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn embedding_model(&self, id: &str) -> Result<Arc<dyn EmbeddingModel>, AppError>;

    async fn chat_model(&self, id: &str) -> Result<Arc<dyn ChatModel>, AppError>;
}

#[async_trait]
pub trait DocumentReader: Send + Sync {
    async fn read_from_file(
        &self,
        bytes: Bytes,
        file_name: &str,
        file_type: &str,
        config: &ReadConfig,
    ) -> Result<Vec<Segment>, AppError>;

    async fn read_from_url(
        &self,
        url: &str,
        title: &str,
        config: &ReadConfig,
    ) -> Result<Vec<Segment>, AppError>;
}

/// Vector index facade. Rows are scoped by tenant, embedding width and the
/// type of the owning knowledge.
#[async_trait]
pub trait RetrievalEngine: Send + Sync {
    async fn batch_index(
        &self,
        tenant_id: u64,
        model: &dyn EmbeddingModel,
        infos: &[IndexInfo],
    ) -> Result<(), AppError>;

    async fn delete_by_knowledge_ids(
        &self,
        tenant_id: u64,
        knowledge_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError>;

    async fn delete_by_chunk_ids(
        &self,
        tenant_id: u64,
        chunk_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError>;

    async fn delete_by_source_ids(
        &self,
        tenant_id: u64,
        source_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError>;

    /// Chunks whose indexed text is closest to `params.query`, at most one
    /// hit per chunk, best first.
    async fn search(
        &self,
        tenant_id: u64,
        model: &dyn EmbeddingModel,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, AppError>;

    /// Bytes the given entries would occupy once indexed.
    fn estimate_storage_size(&self, model: &dyn EmbeddingModel, infos: &[IndexInfo]) -> i64;

    /// Copies the index rows of `source_kb` into `target_kb` for `target_tenant`,
    /// rewriting knowledge and chunk ids through the maps. Rows whose ids are
    /// absent from the maps are skipped.
    #[allow(clippy::too_many_arguments)]
    async fn copy_indices(
        &self,
        target_tenant: u64,
        source_kb: &str,
        target_kb: &str,
        knowledge_map: &HashMap<String, String>,
        chunk_map: &HashMap<String, String>,
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError>;

    async fn batch_update_chunk_enabled_status(
        &self,
        updates: &HashMap<String, bool>,
    ) -> Result<(), AppError>;

    async fn batch_update_chunk_tag(&self, updates: &HashMap<String, String>)
        -> Result<(), AppError>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn delete_namespaces(&self, namespaces: &[GraphNamespace]) -> Result<(), AppError>;
}

/// Graph store for deployments without graph extraction.
pub struct NoopGraphStore;

#[async_trait]
impl GraphStore for NoopGraphStore {
    async fn delete_namespaces(&self, namespaces: &[GraphNamespace]) -> Result<(), AppError> {
        debug!(count = namespaces.len(), "graph store disabled; nothing to delete");
        Ok(())
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub retrieval: Arc<dyn RetrievalEngine>,
    pub reader: Arc<dyn DocumentReader>,
    pub models: Arc<dyn ModelProvider>,
    pub graph: Arc<dyn GraphStore>,
}
