//! Chunk processing: turns parsed segments into stored, indexed chunks for one
//! knowledge and owns its terminal status transition.
//!
//! Every run starts by removing what a previous run stored, so a retried or
//! duplicated task converges on the same chunk set. The knowledge is re-read
//! before persisting, after persisting and before completion; a `deleting`
//! status at any of those points discards the work and ends the run quietly.

mod context;
mod stages;
mod state;


pub use stages::QUOTA_EXCEEDED_MESSAGE;

use std::time::{Duration, Instant};

use common::{
    error::AppError,
    storage::types::{
        knowledge::{Knowledge, ParseStatus},
        knowledge_base::KnowledgeBase,
    },
};
use tracing::info;

use self::{
    context::{ChunkContext, ChunkHalt},
    stages::{budget, build, clean, complete, index, persist},
    state::ready,
};
use crate::{engine::KnowledgeEngine, services::Segment};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessChunksOptions {
    pub enable_question_generation: bool,
    pub question_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Completed { chunk_count: usize, storage_size: i64 },
    /// The knowledge was deleted mid-run; nothing was left behind.
    Aborted,
    /// The knowledge was marked `failed` with this message.
    Failed(String),
}

impl KnowledgeEngine {
    #[tracing::instrument(
        skip_all,
        fields(knowledge_id = %knowledge.id, kb_id = %kb.id, segments = segments.len())
    )]
    pub async fn process_chunks(
        &self,
        kb: &KnowledgeBase,
        knowledge: &Knowledge,
        segments: Vec<Segment>,
        options: ProcessChunksOptions,
    ) -> Result<ChunkOutcome, AppError> {
        let mut ctx = ChunkContext::new(self, kb, knowledge, segments, options);

        match Self::drive_chunks(&mut ctx).await {
            Ok(()) => Ok(ChunkOutcome::Completed {
                chunk_count: ctx.chunks.len(),
                storage_size: ctx.storage_size,
            }),
            Err(halt) => {
                ctx.abort(&halt);
                ctx.rollback().await;
                match halt {
                    ChunkHalt::Deleted => Ok(ChunkOutcome::Aborted),
                    ChunkHalt::Failed(message) => {
                        Knowledge::update_parse_status(
                            &self.db,
                            &knowledge.id,
                            ParseStatus::Failed,
                            &message,
                        )
                        .await?;
                        Ok(ChunkOutcome::Failed(message))
                    }
                }
            }
        }
    }

    async fn drive_chunks(ctx: &mut ChunkContext<'_>) -> Result<(), ChunkHalt> {
        let machine = ready();
        let started = Instant::now();

        let stage_start = Instant::now();
        let machine = clean(machine, ctx).await?;
        let clean_ms = duration_millis(stage_start.elapsed());

        let machine = build(machine, ctx).await?;
        let machine = budget(machine, ctx).await?;

        let stage_start = Instant::now();
        let machine = persist(machine, ctx).await?;
        let persist_ms = duration_millis(stage_start.elapsed());

        let stage_start = Instant::now();
        let machine = index(machine, ctx).await?;
        let index_ms = duration_millis(stage_start.elapsed());

        let _machine = complete(machine, ctx).await?;

        info!(
            knowledge_id = %ctx.knowledge.id,
            chunks = ctx.chunks.len(),
            text_chunks = ctx.text_chunk_count,
            storage_size = ctx.storage_size,
            total_ms = duration_millis(started.elapsed()),
            clean_ms,
            persist_ms,
            index_ms,
            "chunk processing finished"
        );
        Ok(())
    }
}

pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
