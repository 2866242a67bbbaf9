use common::{
    error::AppError,
    storage::types::{
        background_task::BackgroundTask,
        chunk::{Chunk, ChunkType, ImageInfo},
        knowledge::{Knowledge, ParseStatus, SummaryStatus},
        task_payloads::{
            QuestionGenerationPayload, SummaryGenerationPayload, TaskPayload, TaskQueue,
        },
        tenant::Tenant,
    },
};
use state_machines::core::GuardError;
use tracing::{debug, info, instrument, warn};

use super::{
    context::{ChunkContext, ChunkHalt},
    state::{Budgeted, Built, ChunkMachine, Cleaned, Completed, Indexed, Persisted, Ready},
};
use crate::services::{GraphNamespace, ImageSegment, IndexInfo, Segment};

pub const QUOTA_EXCEEDED_MESSAGE: &str = "存储空间不足";

/// Offset between the image sub-chunk slots of consecutive images.
const IMAGE_INDEX_STRIDE: i64 = 100;

/// Drops everything a previous run left behind so a rerun starts clean.
#[instrument(level = "trace", skip_all, fields(knowledge_id = %ctx.knowledge.id))]
pub async fn clean(
    machine: ChunkMachine<(), Ready>,
    ctx: &mut ChunkContext<'_>,
) -> Result<ChunkMachine<(), Cleaned>, ChunkHalt> {
    let Some(current) = Knowledge::get(ctx.engine.db(), ctx.knowledge_id()).await? else {
        return Err(ChunkHalt::Deleted);
    };
    if current.parse_status == ParseStatus::Deleting {
        return Err(ChunkHalt::Deleted);
    }

    let model = ctx.engine.embedding_model(ctx.kb).await?;
    let knowledge_ids = [current.id.clone()];
    let db = ctx.engine.db();
    let services = &ctx.engine.services;

    if let Err(err) = Chunk::delete_by_knowledge_ids(db, &knowledge_ids).await {
        warn!(knowledge_id = %current.id, error = %err, "failed to delete previous chunks");
    }
    if let Err(err) = services
        .retrieval
        .delete_by_knowledge_ids(
            current.tenant_id,
            &knowledge_ids,
            model.dimensions(),
            current.knowledge_type,
        )
        .await
    {
        warn!(knowledge_id = %current.id, error = %err, "failed to delete previous index entries");
    }
    if let Err(err) = services
        .graph
        .delete_namespaces(&[GraphNamespace {
            knowledge_base_id: current.knowledge_base_id.clone(),
            knowledge_id: current.id.clone(),
        }])
        .await
    {
        warn!(knowledge_id = %current.id, error = %err, "failed to delete previous graph data");
    }

    if current.storage_size > 0 {
        let refund = current.storage_size.saturating_neg();
        if let Err(err) = Tenant::adjust_storage_used(db, current.tenant_id, refund).await {
            warn!(knowledge_id = %current.id, error = %err, "failed to refund previous storage");
        }
        if let Err(err) = Knowledge::adjust_storage_size(db, &current.id, refund).await {
            warn!(knowledge_id = %current.id, error = %err, "failed to reset knowledge storage size");
        }
    }

    ctx.model = Some(model);

    machine
        .clean()
        .map_err(|(_, guard)| map_guard_error("clean", &guard))
}

#[instrument(level = "trace", skip_all, fields(knowledge_id = %ctx.knowledge.id))]
pub async fn build(
    machine: ChunkMachine<(), Cleaned>,
    ctx: &mut ChunkContext<'_>,
) -> Result<ChunkMachine<(), Built>, ChunkHalt> {
    let segments = std::mem::take(&mut ctx.segments);
    let mut chunks = build_chunks(ctx.knowledge, &segments);
    chunks.sort_by_key(|chunk| chunk.chunk_index);
    link_text_chunks(&mut chunks);

    ctx.text_chunk_count = chunks
        .iter()
        .filter(|chunk| chunk.chunk_type == ChunkType::Text)
        .count();
    ctx.index_infos = chunks
        .iter()
        .map(|chunk| IndexInfo::for_chunk(chunk, ctx.knowledge.knowledge_type))
        .collect();
    ctx.chunks = chunks;

    debug!(
        knowledge_id = %ctx.knowledge.id,
        segments = segments.len(),
        chunks = ctx.chunks.len(),
        text_chunks = ctx.text_chunk_count,
        "built chunks from segments"
    );

    machine
        .build()
        .map_err(|(_, guard)| map_guard_error("build", &guard))
}

#[instrument(level = "trace", skip_all, fields(knowledge_id = %ctx.knowledge.id))]
pub async fn budget(
    machine: ChunkMachine<(), Built>,
    ctx: &mut ChunkContext<'_>,
) -> Result<ChunkMachine<(), Budgeted>, ChunkHalt> {
    let model = ctx.model()?;
    let size = ctx
        .engine
        .services
        .retrieval
        .estimate_storage_size(model.as_ref(), &ctx.index_infos);

    match Tenant::get(ctx.engine.db(), ctx.knowledge.tenant_id).await {
        Ok(tenant) if tenant.would_exceed(size) => {
            info!(
                knowledge_id = %ctx.knowledge.id,
                tenant_id = ctx.knowledge.tenant_id,
                size,
                used = tenant.storage_used,
                quota = tenant.storage_quota,
                "storage quota would be exceeded"
            );
            return Err(ChunkHalt::Failed(QUOTA_EXCEEDED_MESSAGE.to_string()));
        }
        Ok(_) | Err(AppError::NotFound(_)) => {}
        Err(err) => return Err(err.into()),
    }

    ctx.storage_size = size;

    machine
        .budget()
        .map_err(|(_, guard)| map_guard_error("budget", &guard))
}

#[instrument(level = "trace", skip_all, fields(knowledge_id = %ctx.knowledge.id))]
pub async fn persist(
    machine: ChunkMachine<(), Budgeted>,
    ctx: &mut ChunkContext<'_>,
) -> Result<ChunkMachine<(), Persisted>, ChunkHalt> {
    ctx.ensure_not_deleting().await?;

    let chunks = std::mem::take(&mut ctx.chunks);
    ctx.chunks_persisted = true;
    ctx.chunks = Chunk::create_batch(ctx.engine.db(), chunks).await?;

    ctx.ensure_not_deleting().await?;

    machine
        .persist()
        .map_err(|(_, guard)| map_guard_error("persist", &guard))
}

#[instrument(level = "trace", skip_all, fields(knowledge_id = %ctx.knowledge.id))]
pub async fn index(
    machine: ChunkMachine<(), Persisted>,
    ctx: &mut ChunkContext<'_>,
) -> Result<ChunkMachine<(), Indexed>, ChunkHalt> {
    let model = ctx.model()?.clone();
    ctx.index_attempted = true;
    ctx.engine
        .services
        .retrieval
        .batch_index(ctx.knowledge.tenant_id, model.as_ref(), &ctx.index_infos)
        .await?;

    let ids: Vec<String> = ctx.chunks.iter().map(|chunk| chunk.id.clone()).collect();
    Chunk::mark_indexed(ctx.engine.db(), &ids).await?;

    machine
        .index()
        .map_err(|(_, guard)| map_guard_error("index", &guard))
}

#[instrument(level = "trace", skip_all, fields(knowledge_id = %ctx.knowledge.id))]
pub async fn complete(
    machine: ChunkMachine<(), Indexed>,
    ctx: &mut ChunkContext<'_>,
) -> Result<ChunkMachine<(), Completed>, ChunkHalt> {
    ctx.ensure_not_deleting().await?;

    let has_text = ctx.text_chunk_count > 0;
    let summary_status = if has_text {
        SummaryStatus::Pending
    } else {
        SummaryStatus::None
    };
    let applied = Knowledge::mark_completed(
        ctx.engine.db(),
        ctx.knowledge_id(),
        ctx.storage_size,
        summary_status,
    )
    .await?;
    if !applied {
        return Err(ChunkHalt::Deleted);
    }

    if has_text {
        enqueue_enrichment(ctx).await;
    }

    if let Err(err) =
        Tenant::adjust_storage_used(ctx.engine.db(), ctx.knowledge.tenant_id, ctx.storage_size)
            .await
    {
        warn!(
            knowledge_id = %ctx.knowledge.id,
            size = ctx.storage_size,
            error = %err,
            "failed to charge tenant storage"
        );
    }

    machine
        .complete()
        .map_err(|(_, guard)| map_guard_error("complete", &guard))
}

async fn enqueue_enrichment(ctx: &ChunkContext<'_>) {
    let tuning = &ctx.engine.config().tuning;
    let knowledge = ctx.knowledge;

    if ctx.options.enable_question_generation {
        let task = BackgroundTask::new(TaskPayload::QuestionGeneration(QuestionGenerationPayload {
            tenant_id: knowledge.tenant_id,
            knowledge_base_id: knowledge.knowledge_base_id.clone(),
            knowledge_id: knowledge.id.clone(),
            question_count: tuning.clamp_question_count(ctx.options.question_count),
        }))
        .with_queue(TaskQueue::Low)
        .with_max_retry(tuning.enrichment_max_retry);
        if let Err(err) = ctx.engine.enqueue(task).await {
            warn!(knowledge_id = %knowledge.id, error = %err, "failed to enqueue question generation");
        }
    }

    let task = BackgroundTask::new(TaskPayload::SummaryGeneration(SummaryGenerationPayload {
        tenant_id: knowledge.tenant_id,
        knowledge_base_id: knowledge.knowledge_base_id.clone(),
        knowledge_id: knowledge.id.clone(),
    }))
    .with_queue(TaskQueue::Low)
    .with_max_retry(tuning.enrichment_max_retry);
    if let Err(err) = ctx.engine.enqueue(task).await {
        warn!(knowledge_id = %knowledge.id, error = %err, "failed to enqueue summary generation");
    }
}

/// One text chunk per non-empty segment, plus OCR and caption sub-chunks per
/// image. Sub-chunks sit above the largest segment seq so they never collide
/// with text chunk indices.
pub(crate) fn build_chunks(knowledge: &Knowledge, segments: &[Segment]) -> Vec<Chunk> {
    let max_seq = segments.iter().map(|s| s.seq).max().unwrap_or(0);
    let mut chunks = Vec::new();

    for segment in segments.iter().filter(|s| !s.content.is_empty()) {
        let mut text = new_chunk(knowledge, ChunkType::Text, &segment.content);
        text.chunk_index = segment.seq;
        text.start_at = segment.start;
        text.end_at = segment.end;
        text.image_info = segment.images.iter().map(image_info).collect();

        let mut slot: i64 = 0;
        for image in &segment.images {
            let base = max_seq.saturating_add(slot.saturating_mul(IMAGE_INDEX_STRIDE));
            slot = slot.saturating_add(1);

            if !image.ocr_text.is_empty() {
                let mut ocr = new_chunk(knowledge, ChunkType::ImageOcr, &image.ocr_text);
                ocr.chunk_index = base.saturating_add(1);
                ocr.parent_chunk_id = text.id.clone();
                ocr.start_at = segment.start;
                ocr.end_at = segment.end;
                ocr.image_info = vec![image_info(image)];
                chunks.push(ocr);
            }
            if !image.caption.is_empty() {
                let mut caption = new_chunk(knowledge, ChunkType::ImageCaption, &image.caption);
                caption.chunk_index = base.saturating_add(2);
                caption.parent_chunk_id = text.id.clone();
                caption.start_at = segment.start;
                caption.end_at = segment.end;
                caption.image_info = vec![image_info(image)];
                chunks.push(caption);
            }
        }
        chunks.push(text);
    }

    chunks
}

fn new_chunk(knowledge: &Knowledge, chunk_type: ChunkType, content: &str) -> Chunk {
    let mut chunk = Chunk::new(
        knowledge.tenant_id,
        &knowledge.id,
        &knowledge.knowledge_base_id,
        chunk_type,
        content,
    );
    chunk.tag_id = knowledge.tag_id.clone();
    chunk
}

fn image_info(image: &ImageSegment) -> ImageInfo {
    ImageInfo {
        url: image.url.clone(),
        original_url: image.original_url.clone(),
        start_pos: image.start,
        end_pos: image.end,
        caption: image.caption.clone(),
        ocr_text: image.ocr_text.clone(),
    }
}

/// Links text chunks in their current order; other chunk types stay unlinked.
pub(crate) fn link_text_chunks(chunks: &mut [Chunk]) {
    let text_positions: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, chunk)| chunk.chunk_type == ChunkType::Text)
        .map(|(pos, _)| pos)
        .collect();

    for pair in text_positions.windows(2) {
        let (Some(&prev), Some(&next)) = (pair.first(), pair.get(1)) else {
            continue;
        };
        let prev_id = chunks.get(prev).map(|c| c.id.clone()).unwrap_or_default();
        let next_id = chunks.get(next).map(|c| c.id.clone()).unwrap_or_default();
        if let Some(chunk) = chunks.get_mut(prev) {
            chunk.next_chunk_id = next_id;
        }
        if let Some(chunk) = chunks.get_mut(next) {
            chunk.pre_chunk_id = prev_id;
        }
    }
}

fn map_guard_error(event: &str, guard: &GuardError) -> ChunkHalt {
    ChunkHalt::Failed(format!(
        "invalid chunk pipeline transition during {event}: {guard:?}"
    ))
}
