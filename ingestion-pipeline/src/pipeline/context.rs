use std::sync::Arc;

use common::{
    error::AppError,
    storage::types::{chunk::Chunk, knowledge::Knowledge, knowledge_base::KnowledgeBase},
};
use tracing::{error, info, warn};

use super::ProcessChunksOptions;
use crate::{
    engine::KnowledgeEngine,
    services::{EmbeddingModel, IndexInfo, Segment},
};

/// Why a processing run stopped before completion.
#[derive(Debug)]
pub enum ChunkHalt {
    /// The knowledge entered `deleting`; exit quietly.
    Deleted,
    /// Terminal failure recorded on the knowledge with this message.
    Failed(String),
}

impl From<AppError> for ChunkHalt {
    fn from(err: AppError) -> Self {
        ChunkHalt::Failed(err.to_string())
    }
}

pub struct ChunkContext<'a> {
    pub engine: &'a KnowledgeEngine,
    pub kb: &'a KnowledgeBase,
    pub knowledge: &'a Knowledge,
    pub options: ProcessChunksOptions,
    pub segments: Vec<Segment>,
    pub chunks: Vec<Chunk>,
    pub index_infos: Vec<IndexInfo>,
    pub text_chunk_count: usize,
    pub model: Option<Arc<dyn EmbeddingModel>>,
    pub storage_size: i64,
    pub chunks_persisted: bool,
    pub index_attempted: bool,
}

impl<'a> ChunkContext<'a> {
    pub fn new(
        engine: &'a KnowledgeEngine,
        kb: &'a KnowledgeBase,
        knowledge: &'a Knowledge,
        segments: Vec<Segment>,
        options: ProcessChunksOptions,
    ) -> Self {
        Self {
            engine,
            kb,
            knowledge,
            options,
            segments,
            chunks: Vec::new(),
            index_infos: Vec::new(),
            text_chunk_count: 0,
            model: None,
            storage_size: 0,
            chunks_persisted: false,
            index_attempted: false,
        }
    }

    pub fn knowledge_id(&self) -> &str {
        &self.knowledge.id
    }

    pub fn model(&self) -> Result<&Arc<dyn EmbeddingModel>, ChunkHalt> {
        self.model.as_ref().ok_or_else(|| {
            ChunkHalt::Failed("embedding model expected to be resolved before indexing".into())
        })
    }

    pub async fn ensure_not_deleting(&self) -> Result<(), ChunkHalt> {
        if Knowledge::is_deleting(self.engine.db(), self.knowledge_id()).await {
            return Err(ChunkHalt::Deleted);
        }
        Ok(())
    }

    /// Removes whatever this run already wrote. Failures are logged only.
    pub async fn rollback(&self) {
        let knowledge_ids = [self.knowledge.id.clone()];
        if self.chunks_persisted {
            if let Err(err) = Chunk::delete_by_knowledge_ids(self.engine.db(), &knowledge_ids).await
            {
                warn!(knowledge_id = %self.knowledge.id, error = %err, "failed to roll back chunks");
            }
        }
        if self.index_attempted {
            if let Some(model) = self.model.as_ref() {
                if let Err(err) = self
                    .engine
                    .services
                    .retrieval
                    .delete_by_knowledge_ids(
                        self.knowledge.tenant_id,
                        &knowledge_ids,
                        model.dimensions(),
                        self.knowledge.knowledge_type,
                    )
                    .await
                {
                    warn!(knowledge_id = %self.knowledge.id, error = %err, "failed to roll back index entries");
                }
            }
        }
    }

    pub fn abort(&self, halt: &ChunkHalt) {
        match halt {
            ChunkHalt::Deleted => info!(
                knowledge_id = %self.knowledge.id,
                "knowledge is being deleted; chunk processing aborted"
            ),
            ChunkHalt::Failed(message) => error!(
                knowledge_id = %self.knowledge.id,
                error = %message,
                "chunk processing aborted"
            ),
        }
    }
}
