//! Low-priority enrichment of processed documents: a summary that becomes the
//! knowledge description, and generated questions indexed per chunk.

use std::{fmt::Write as _, sync::LazyLock};

use common::{
    error::AppError,
    storage::types::{
        chunk::{Chunk, ChunkType, GeneratedQuestion},
        knowledge::{Knowledge, ParseStatus, SummaryStatus},
        knowledge_base::KnowledgeBase,
        task_payloads::{QuestionGenerationPayload, SummaryGenerationPayload},
    },
};
use regex::Regex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    engine::KnowledgeEngine,
    services::{ChatModel, ChatOptions, IndexInfo},
};

static MARKDOWN_IMAGE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]+\)").ok());

const SUMMARY_OPTIONS: ChatOptions = ChatOptions {
    temperature: 0.3,
    max_tokens: 1024,
};

const QUESTION_OPTIONS: ChatOptions = ChatOptions {
    temperature: 0.7,
    max_tokens: 512,
};

impl KnowledgeEngine {
    /// Summarises a completed knowledge, stores the summary as its
    /// description and indexes it as a `summary` chunk.
    ///
    /// A retried run replaces the summary chunk of the previous run.
    #[instrument(skip_all, fields(knowledge_id = %payload.knowledge_id))]
    pub async fn process_summary_generation(
        &self,
        payload: &SummaryGenerationPayload,
    ) -> Result<(), AppError> {
        let Some((kb, knowledge)) = self
            .load_enrichment_target(payload.tenant_id, &payload.knowledge_base_id, &payload.knowledge_id)
            .await
        else {
            return Ok(());
        };

        if let Err(err) =
            Knowledge::update_summary_status(&self.db, &knowledge.id, SummaryStatus::Processing).await
        {
            warn!(error = %err, "failed to mark summary as processing");
        }

        let chunks = match Chunk::list_by_knowledge(&self.db, &knowledge.id).await {
            Ok(chunks) => chunks,
            Err(err) => {
                error!(error = %err, "failed to load chunks for summary");
                self.mark_summary_failed(&knowledge.id).await;
                return Ok(());
            }
        };
        let mut text_chunks: Vec<&Chunk> = chunks
            .iter()
            .filter(|chunk| chunk.chunk_type == ChunkType::Text)
            .collect();
        let Some(first) = text_chunks.first().map(|chunk| (*chunk).clone()) else {
            info!("no text chunks to summarise");
            Knowledge::update_summary_status(&self.db, &knowledge.id, SummaryStatus::Completed)
                .await?;
            return Ok(());
        };
        text_chunks.sort_by_key(|chunk| chunk.start_at);

        let chat = match self.chat_model(&kb).await {
            Ok(chat) => chat,
            Err(err) => {
                error!(error = %err, "failed to resolve summary model");
                self.mark_summary_failed(&knowledge.id).await;
                return Err(err);
            }
        };

        let summary = match self.summarise(chat.as_ref(), &knowledge, &text_chunks).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "summary generation failed; falling back to leading content");
                first
                    .content
                    .chars()
                    .take(self.config.tuning.summary_fallback_chars)
                    .collect()
            }
        };

        let Some(knowledge) = Knowledge::complete_summary(&self.db, &knowledge.id, &summary).await?
        else {
            info!("knowledge deleted while summarising");
            return Ok(());
        };

        if summary.trim().is_empty() {
            return Ok(());
        }
        self.replace_summary_chunk(&kb, &knowledge, &chunks, &first, &summary)
            .await?;
        info!(summary_chars = summary.chars().count(), "summary generated");
        Ok(())
    }

    async fn summarise(
        &self,
        chat: &dyn ChatModel,
        knowledge: &Knowledge,
        text_chunks: &[&Chunk],
    ) -> Result<String, AppError> {
        let content = summary_input(text_chunks, self.config.tuning.summary_input_max_offset);
        if content.chars().count() < self.config.tuning.summary_direct_max_chars {
            debug!("content short enough to serve as its own summary");
            return Ok(content);
        }

        let mut user = format!(
            "文档类型: {}\n文件名称: {}\n知识类型: {}\n",
            knowledge.file_type,
            knowledge.file_name,
            knowledge.knowledge_type.as_str()
        );
        user.push_str("\n内容:\n");
        user.push_str(&content);

        let summary = chat
            .chat(Some(&self.config.summary_prompt), &user, SUMMARY_OPTIONS)
            .await?;
        debug!(summary = %summary, "summary model replied");
        Ok(summary)
    }

    async fn replace_summary_chunk(
        &self,
        kb: &KnowledgeBase,
        knowledge: &Knowledge,
        chunks: &[Chunk],
        parent: &Chunk,
        summary: &str,
    ) -> Result<(), AppError> {
        let model = self.embedding_model(kb).await?;
        let previous: Vec<String> = chunks
            .iter()
            .filter(|chunk| chunk.chunk_type == ChunkType::Summary)
            .map(|chunk| chunk.id.clone())
            .collect();
        if !previous.is_empty() {
            self.services
                .retrieval
                .delete_by_chunk_ids(
                    knowledge.tenant_id,
                    &previous,
                    model.dimensions(),
                    knowledge.knowledge_type,
                )
                .await?;
            Chunk::delete_by_ids(&self.db, &previous).await?;
        }

        let max_index = chunks
            .iter()
            .filter(|chunk| chunk.chunk_type != ChunkType::Summary)
            .map(|chunk| chunk.chunk_index)
            .max()
            .unwrap_or(0);
        let mut chunk = Chunk::new(
            knowledge.tenant_id,
            &knowledge.id,
            &knowledge.knowledge_base_id,
            ChunkType::Summary,
            format!("# 文档名称\n{}\n\n# 摘要\n{summary}", knowledge.file_name),
        );
        chunk.chunk_index = max_index.saturating_add(1);
        chunk.parent_chunk_id.clone_from(&parent.id);
        let created = Chunk::create_batch(&self.db, vec![chunk]).await?;

        let infos: Vec<IndexInfo> = created
            .iter()
            .map(|chunk| IndexInfo::for_chunk(chunk, knowledge.knowledge_type))
            .collect();
        self.services
            .retrieval
            .batch_index(knowledge.tenant_id, model.as_ref(), &infos)
            .await?;
        let ids: Vec<String> = created.into_iter().map(|chunk| chunk.id).collect();
        Chunk::mark_indexed(&self.db, &ids).await
    }

    async fn mark_summary_failed(&self, knowledge_id: &str) {
        if let Err(err) =
            Knowledge::update_summary_status(&self.db, knowledge_id, SummaryStatus::Failed).await
        {
            warn!(%knowledge_id, error = %err, "failed to mark summary as failed");
        }
    }

    /// Generates likely user questions for every text chunk and indexes each
    /// one under `"{chunk_id}-{question_id}"`.
    #[instrument(skip_all, fields(knowledge_id = %payload.knowledge_id))]
    pub async fn process_question_generation(
        &self,
        payload: &QuestionGenerationPayload,
    ) -> Result<(), AppError> {
        let Some((kb, knowledge)) = self
            .load_enrichment_target(payload.tenant_id, &payload.knowledge_base_id, &payload.knowledge_id)
            .await
        else {
            return Ok(());
        };

        let mut text_chunks =
            match Chunk::list_by_knowledge_and_types(&self.db, &knowledge.id, &[ChunkType::Text])
                .await
            {
                Ok(chunks) => chunks,
                Err(err) => {
                    error!(error = %err, "failed to load chunks for question generation");
                    return Ok(());
                }
            };
        if text_chunks.is_empty() {
            info!("no text chunks to generate questions for");
            return Ok(());
        }
        text_chunks.sort_by_key(|chunk| chunk.start_at);

        let chat = self.chat_model(&kb).await?;
        let model = self.embedding_model(&kb).await?;
        let tuning = &self.config.tuning;
        let question_count = tuning.clamp_question_count(payload.question_count);
        let context_chars = tuning.question_context_chars;

        let mut stale_sources = Vec::new();
        let mut infos = Vec::new();
        let mut updated_chunks = Vec::new();
        for (position, chunk) in text_chunks.iter().enumerate() {
            let previous = position
                .checked_sub(1)
                .and_then(|i| text_chunks.get(i))
                .map(|prev| tail_chars(&prev.content, context_chars))
                .unwrap_or_default();
            let next = text_chunks
                .get(position.saturating_add(1))
                .map(|next| next.content.chars().take(context_chars).collect::<String>())
                .unwrap_or_default();

            let prompt = render_question_prompt(
                &self.config.question_prompt,
                &chunk.content,
                &previous,
                &next,
                &knowledge.title,
                question_count,
            );
            let questions = match chat.chat(None, &prompt, QUESTION_OPTIONS).await {
                Ok(reply) => parse_questions(&reply, question_count),
                Err(err) => {
                    warn!(chunk_id = %chunk.id, error = %err, "question generation failed for chunk");
                    continue;
                }
            };
            if questions.is_empty() {
                continue;
            }

            stale_sources.extend(
                chunk
                    .metadata
                    .generated_questions
                    .iter()
                    .map(|q| format!("{}-{}", chunk.id, q.id)),
            );
            let generated: Vec<GeneratedQuestion> = questions
                .into_iter()
                .enumerate()
                .map(|(i, question)| GeneratedQuestion {
                    id: format!("q{}", i.saturating_add(1)),
                    question,
                })
                .collect();
            let base = IndexInfo::for_chunk(chunk, knowledge.knowledge_type);
            infos.extend(
                generated
                    .iter()
                    .map(|q| base.derived(&q.id, q.question.clone())),
            );
            debug!(chunk_id = %chunk.id, count = generated.len(), "generated questions");

            let mut updated = chunk.clone();
            updated.metadata.generated_questions = generated;
            updated_chunks.push(updated);
        }

        if Knowledge::is_deleting(&self.db, &knowledge.id).await {
            info!("knowledge deleted while generating questions");
            return Ok(());
        }

        for chunk in updated_chunks {
            let chunk_id = chunk.id.clone();
            if let Err(err) = chunk.save(&self.db).await {
                warn!(%chunk_id, error = %err, "failed to store generated questions");
            }
        }
        if !stale_sources.is_empty() {
            if let Err(err) = self
                .services
                .retrieval
                .delete_by_source_ids(
                    knowledge.tenant_id,
                    &stale_sources,
                    model.dimensions(),
                    knowledge.knowledge_type,
                )
                .await
            {
                warn!(error = %err, "failed to delete previously generated questions");
            }
        }
        if !infos.is_empty() {
            self.services
                .retrieval
                .batch_index(knowledge.tenant_id, model.as_ref(), &infos)
                .await
                .inspect_err(|err| error!(error = %err, "failed to index generated questions"))?;
            info!(count = infos.len(), "indexed generated questions");
        }
        Ok(())
    }

    /// Loads the knowledge base and knowledge an enrichment task refers to.
    /// Missing or deleting records end the task quietly.
    async fn load_enrichment_target(
        &self,
        tenant_id: u64,
        kb_id: &str,
        knowledge_id: &str,
    ) -> Option<(KnowledgeBase, Knowledge)> {
        let kb = KnowledgeBase::get(&self.db, kb_id)
            .await
            .inspect_err(|err| error!(error = %err, "failed to load knowledge base"))
            .ok()?;
        let knowledge = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id)
            .await
            .inspect_err(|err| error!(error = %err, "failed to load knowledge"))
            .ok()?;
        if knowledge.parse_status == ParseStatus::Deleting {
            info!("knowledge is being deleted; skipping enrichment");
            return None;
        }
        Some((kb, knowledge))
    }
}

/// Rebuilds the leading part of the document from its text chunks (ordered by
/// start offset), drops Markdown images and appends image captions and OCR.
pub(crate) fn summary_input(text_chunks: &[&Chunk], max_offset: i64) -> String {
    let mut content = String::new();
    let mut annotations = String::new();
    for chunk in text_chunks {
        if chunk.end_at > max_offset {
            break;
        }
        let start = usize::try_from(chunk.start_at).unwrap_or(0);
        if let Some((byte_offset, _)) = content.char_indices().nth(start) {
            content.truncate(byte_offset);
        }
        content.push_str(&chunk.content);

        for image in &chunk.image_info {
            if !image.caption.is_empty() {
                let _ = write!(annotations, "\n[图片描述: {}]", image.caption);
            }
            if !image.ocr_text.is_empty() {
                let _ = write!(annotations, "\n[图片文字: {}]", image.ocr_text);
            }
        }
    }

    if let Some(re) = MARKDOWN_IMAGE.as_ref() {
        content = re.replace_all(&content, "").into_owned();
    }
    content.push_str(&annotations);
    content
}

fn tail_chars(text: &str, count: usize) -> String {
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}

fn render_question_prompt(
    template: &str,
    content: &str,
    previous: &str,
    next: &str,
    doc_name: &str,
    question_count: u32,
) -> String {
    let mut context = String::new();
    if !previous.is_empty() || !next.is_empty() {
        context.push_str("## 上下文信息（仅供参考，帮助理解主要内容）\n");
        if !previous.is_empty() {
            let _ = writeln!(context, "【前文】{previous}");
        }
        if !next.is_empty() {
            let _ = writeln!(context, "【后文】{next}");
        }
        context.push('\n');
    }
    template
        .replace("{{question_count}}", &question_count.to_string())
        .replace("{{content}}", content)
        .replace("{{context}}", &context)
        .replace("{{doc_name}}", doc_name)
}

/// One question per line; list markers are stripped and fragments of five
/// bytes or fewer dropped.
pub(crate) fn parse_questions(reply: &str, limit: u32) -> Vec<String> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    reply
        .lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '.' | '-' | '*' | ')' | ' '))
                .trim()
        })
        .filter(|line| line.len() > 5)
        .take(limit)
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use common::storage::types::{chunk::ImageInfo, knowledge_base::KnowledgeBase};

    use super::*;
    use crate::{
        orchestrator::passages_to_segments,
        pipeline::{ChunkOutcome, ProcessChunksOptions},
        test_support::{harness, TestHarness, TENANT},
    };

    async fn processed(h: &TestHarness, kb: &KnowledgeBase, passages: &[&str]) -> Knowledge {
        let knowledge = h.file_knowledge(kb, "guide.md").await;
        let passages: Vec<String> = passages.iter().map(|p| (*p).to_string()).collect();
        let outcome = h
            .engine
            .process_chunks(
                kb,
                &knowledge,
                passages_to_segments(&passages),
                ProcessChunksOptions::default(),
            )
            .await
            .expect("process");
        assert!(matches!(outcome, ChunkOutcome::Completed { .. }));
        h.knowledge(&knowledge.id).await
    }

    fn summary_payload(kb: &KnowledgeBase, knowledge: &Knowledge) -> SummaryGenerationPayload {
        SummaryGenerationPayload {
            tenant_id: TENANT,
            knowledge_base_id: kb.id.clone(),
            knowledge_id: knowledge.id.clone(),
        }
    }

    #[tokio::test]
    async fn short_documents_summarise_themselves() {
        let h = harness().await;
        let kb = h.document_kb().await;
        let knowledge = processed(&h, &kb, &["Rust ", "ownership notes"]).await;

        h.engine
            .process_summary_generation(&summary_payload(&kb, &knowledge))
            .await
            .expect("summary");
        h.engine
            .process_summary_generation(&summary_payload(&kb, &knowledge))
            .await
            .expect("rerun");

        let stored = h.knowledge(&knowledge.id).await;
        assert_eq!(stored.summary_status, SummaryStatus::Completed);
        assert_eq!(stored.description, "Rust ownership notes");
        assert!(h.chat.calls.lock().await.is_empty());

        let summaries =
            Chunk::list_by_knowledge_and_types(&h.db, &knowledge.id, &[ChunkType::Summary])
                .await
                .expect("chunks");
        assert_eq!(summaries.len(), 1);
        assert_eq!(
            summaries[0].content,
            "# 文档名称\nguide.md\n\n# 摘要\nRust ownership notes"
        );
        assert_eq!(summaries[0].chunk_index, 2);
        assert!(h
            .retrieval
            .indexed_source_ids()
            .await
            .contains(&summaries[0].id));
    }

    #[tokio::test]
    async fn long_documents_are_summarised_by_the_model() {
        let h = harness().await;
        let kb = h.document_kb().await;
        let long = "a".repeat(400);
        let knowledge = processed(&h, &kb, &[&long]).await;
        h.chat.set_reply(Ok("concise summary")).await;

        h.engine
            .process_summary_generation(&summary_payload(&kb, &knowledge))
            .await
            .expect("summary");

        assert_eq!(h.knowledge(&knowledge.id).await.description, "concise summary");
        let calls = h.chat.calls.lock().await;
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].options, SUMMARY_OPTIONS);
        assert!(calls[0].system.is_some());
        assert!(calls[0].user.contains("文件名称: guide.md"));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_leading_content() {
        let h = harness().await;
        let kb = h.document_kb().await;
        let long = "b".repeat(800);
        let knowledge = processed(&h, &kb, &[&long]).await;
        h.chat.set_reply(Err("model offline")).await;

        h.engine
            .process_summary_generation(&summary_payload(&kb, &knowledge))
            .await
            .expect("summary");

        let stored = h.knowledge(&knowledge.id).await;
        assert_eq!(stored.description, "b".repeat(500));
        assert_eq!(stored.summary_status, SummaryStatus::Completed);
    }

    #[tokio::test]
    async fn questions_are_stored_and_indexed_per_chunk() {
        let h = harness().await;
        let kb = h.document_kb().await;
        let knowledge = processed(&h, &kb, &["first chunk", "second chunk"]).await;
        h.chat
            .set_reply(Ok("1. What does the first chunk say?\n- ok\n2) Which chunk comes second?\n3. Extra question here?"))
            .await;

        let payload = QuestionGenerationPayload {
            tenant_id: TENANT,
            knowledge_base_id: kb.id.clone(),
            knowledge_id: knowledge.id.clone(),
            question_count: 2,
        };
        h.engine
            .process_question_generation(&payload)
            .await
            .expect("questions");

        let chunks = Chunk::list_by_knowledge_and_types(&h.db, &knowledge.id, &[ChunkType::Text])
            .await
            .expect("chunks");
        for chunk in &chunks {
            let questions: Vec<&str> = chunk
                .metadata
                .generated_questions
                .iter()
                .map(|q| q.id.as_str())
                .collect();
            assert_eq!(questions, vec!["q1", "q2"]);
        }
        let indexed = h.retrieval.indexed_source_ids().await;
        assert!(indexed.contains(&format!("{}-q1", chunks[0].id)));
        assert!(indexed.contains(&format!("{}-q2", chunks[1].id)));

        let calls = h.chat.calls.lock().await;
        assert_eq!(calls.len(), 2);
        assert!(calls[0].user.contains("【后文】second chunk"));
        assert!(calls[1].user.contains("【前文】first chunk"));
        assert!(calls[0].user.contains("生成的问题数量为 2 个"));
    }

    #[tokio::test]
    async fn deleted_knowledge_is_not_enriched() {
        let h = harness().await;
        let kb = h.document_kb().await;
        let knowledge = processed(&h, &kb, &["content"]).await;
        Knowledge::mark_deleting(&h.db, std::slice::from_ref(&knowledge.id))
            .await
            .expect("mark");

        h.engine
            .process_summary_generation(&summary_payload(&kb, &knowledge))
            .await
            .expect("summary");
        assert!(Chunk::list_by_knowledge_and_types(&h.db, &knowledge.id, &[ChunkType::Summary])
            .await
            .expect("chunks")
            .is_empty());
    }

    #[test]
    fn summary_input_strips_images_and_appends_annotations() {
        let mut first = Chunk::new(TENANT, "k", "kb", ChunkType::Text, "Intro ![logo](a.png)text");
        first.end_at = 24;
        let mut second = Chunk::new(TENANT, "k", "kb", ChunkType::Text, "more");
        second.start_at = 24;
        second.end_at = 28;
        second.image_info = vec![ImageInfo {
            caption: "a chart".into(),
            ocr_text: "Q3".into(),
            ..ImageInfo::default()
        }];
        let mut far = Chunk::new(TENANT, "k", "kb", ChunkType::Text, "ignored");
        far.start_at = 5000;
        far.end_at = 5007;

        let input = summary_input(&[&first, &second, &far], 4096);
        assert_eq!(input, "Intro textmore\n[图片描述: a chart]\n[图片文字: Q3]");
    }

    #[test]
    fn question_lines_are_cleaned() {
        let parsed = parse_questions("1. 什么是所有权？\n\n* ok\n- How does borrowing work?\n", 5);
        assert_eq!(parsed, vec!["什么是所有权？", "How does borrowing work?"]);
    }
}
