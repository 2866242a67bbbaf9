//! Pure FAQ helpers: payload sanitizing, the stored chunk text and the
//! index projections for both question index modes.

use std::fmt::Write as _;

use common::{
    error::AppError,
    storage::types::{
        chunk::Chunk,
        faq::{
            AnswerStrategy, FaqChunkMetadata, FaqEntryPayload, FaqIndexMode, QuestionIndexMode,
            FAQ_METADATA_SOURCE,
        },
        knowledge::KnowledgeType,
        knowledge_base::KnowledgeBase,
    },
};

use crate::services::IndexInfo;

pub const INVALID_ANSWER_STRATEGY: &str = "answer_strategy 必须是 'all' 或 'random'";

pub(crate) fn parse_answer_strategy(value: Option<&str>) -> Result<AnswerStrategy, AppError> {
    match value.map(str::trim) {
        None | Some("" | "all") => Ok(AnswerStrategy::All),
        Some("random") => Ok(AnswerStrategy::Random),
        Some(_) => Err(AppError::BadRequest(INVALID_ANSWER_STRATEGY.into())),
    }
}

/// Turns a caller payload into normalized chunk metadata.
pub(crate) fn sanitize_entry(payload: &FaqEntryPayload) -> Result<FaqChunkMetadata, AppError> {
    let mut meta = FaqChunkMetadata {
        standard_question: payload.standard_question.clone(),
        similar_questions: payload.similar_questions.clone(),
        negative_questions: payload.negative_questions.clone(),
        answers: payload.answers.clone(),
        answer_strategy: parse_answer_strategy(payload.answer_strategy.as_deref())?,
        version: 1,
        source: FAQ_METADATA_SOURCE.to_string(),
    };
    meta.normalize();
    if meta.standard_question.is_empty() {
        return Err(AppError::BadRequest("标准问不能为空".into()));
    }
    if meta.answers.is_empty() {
        return Err(AppError::BadRequest("至少提供一个答案".into()));
    }
    Ok(meta)
}

/// Text stored on the chunk row.
pub(crate) fn chunk_content(meta: &FaqChunkMetadata, mode: FaqIndexMode) -> String {
    let mut out = format!("Q: {}\n", meta.standard_question);
    if !meta.similar_questions.is_empty() {
        out.push_str("Similar Questions:\n");
        for question in &meta.similar_questions {
            let _ = writeln!(out, "- {question}");
        }
    }
    if mode == FaqIndexMode::QuestionAnswer && !meta.answers.is_empty() {
        out.push_str("Answers:\n");
        for answer in &meta.answers {
            let _ = writeln!(out, "- {answer}");
        }
    }
    out
}

fn with_answers(question: &str, meta: &FaqChunkMetadata, mode: FaqIndexMode) -> String {
    if mode == FaqIndexMode::QuestionOnly || meta.answers.is_empty() {
        return question.to_string();
    }
    format!("{question}\n{}", meta.answers.join("\n"))
}

fn combined_content(meta: &FaqChunkMetadata, mode: FaqIndexMode) -> String {
    let joined = std::iter::once(&meta.standard_question)
        .chain(&meta.similar_questions)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n");
    with_answers(&joined, meta, mode)
}

/// Source id of the `index`-th similar question in separate mode.
pub(crate) fn similar_source_id(chunk_id: &str, index: usize) -> String {
    format!("{chunk_id}-{index}")
}

/// Index projections of one FAQ chunk under the base's current modes.
pub(crate) fn index_infos(kb: &KnowledgeBase, chunk: &Chunk) -> Vec<IndexInfo> {
    let Some(meta) = chunk.faq_metadata() else {
        return Vec::new();
    };
    let mode = kb.faq_config.index_mode;
    let base = IndexInfo::for_chunk(chunk, KnowledgeType::Faq);
    match kb.faq_config.question_index_mode {
        QuestionIndexMode::Combined => vec![IndexInfo {
            content: combined_content(meta, mode),
            ..base
        }],
        QuestionIndexMode::Separate => {
            let standard = IndexInfo {
                content: with_answers(&meta.standard_question, meta, mode),
                ..base.clone()
            };
            std::iter::once(standard)
                .chain(meta.similar_questions.iter().enumerate().map(|(i, question)| {
                    base.derived(&i.to_string(), with_answers(question, meta, mode))
                }))
                .collect()
        }
    }
}

/// What an edit has to rewrite in the index.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct IndexDelta {
    pub upserts: Vec<IndexInfo>,
    pub stale_source_ids: Vec<String>,
}

/// Per-question diff for separate mode: only projections whose text changed
/// are rewritten and trailing similar questions that disappeared are removed.
pub(crate) fn separate_index_delta(
    kb: &KnowledgeBase,
    chunk: &Chunk,
    old: &FaqChunkMetadata,
) -> IndexDelta {
    let Some(new) = chunk.faq_metadata() else {
        return IndexDelta::default();
    };
    let mode = kb.faq_config.index_mode;
    let base = IndexInfo::for_chunk(chunk, KnowledgeType::Faq);
    let answers_changed = mode == FaqIndexMode::QuestionAnswer && old.answers != new.answers;

    let mut delta = IndexDelta::default();
    let old_standard = with_answers(&old.standard_question, old, mode);
    let new_standard = with_answers(&new.standard_question, new, mode);
    if old_standard != new_standard {
        delta.upserts.push(IndexInfo {
            content: new_standard,
            ..base.clone()
        });
    }
    for (i, question) in new.similar_questions.iter().enumerate() {
        let changed = old
            .similar_questions
            .get(i)
            .map_or(true, |previous| previous != question);
        if changed || answers_changed {
            delta
                .upserts
                .push(base.derived(&i.to_string(), with_answers(question, new, mode)));
        }
    }
    for i in new.similar_questions.len()..old.similar_questions.len() {
        delta.stale_source_ids.push(similar_source_id(&chunk.id, i));
    }
    delta
}
