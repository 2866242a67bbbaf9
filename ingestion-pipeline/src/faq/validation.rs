use std::collections::{HashMap, HashSet};

use common::{
    error::AppError,
    storage::types::{
        chunk::Chunk,
        faq::{FaqChunkMetadata, FaqEntryPayload, FaqImportMode},
    },
};

use super::content::{parse_answer_strategy, INVALID_ANSWER_STRATEGY};

/// Where a question was first seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Existing,
    Batch(usize),
}

/// Checks import entries one at a time. Every accepted entry's questions are
/// remembered, so later entries that repeat them are rejected.
pub(crate) struct EntryValidator {
    seen: HashMap<String, Origin>,
    known_tags: HashSet<i64>,
}

impl EntryValidator {
    /// In append mode `existing` holds every question already in the base;
    /// replace mode only checks the batch against itself.
    pub fn new(mode: FaqImportMode, existing: &[Chunk], known_tags: HashSet<i64>) -> Self {
        let mut seen = HashMap::new();
        if mode == FaqImportMode::Append {
            for meta in existing.iter().filter_map(Chunk::faq_metadata) {
                for question in questions_of(meta) {
                    seen.insert(question.to_string(), Origin::Existing);
                }
            }
        }
        Self { seen, known_tags }
    }

    /// Returns the failure reason for the entry at `index`, or `None` when it
    /// is accepted.
    pub fn check(&mut self, index: usize, entry: &FaqEntryPayload) -> Option<String> {
        if let Some(reason) = basic_problem(entry) {
            return Some(reason);
        }
        if entry.tag_id > 0 && !self.known_tags.contains(&entry.tag_id) {
            return Some(format!("标签 {} 不存在", entry.tag_id));
        }

        let standard = entry.standard_question.trim();
        match self.seen.get(standard) {
            Some(Origin::Existing) => return Some("标准问与知识库中已有问题重复".into()),
            Some(Origin::Batch(first)) => {
                return Some(format!("标准问与批次内第 {} 条重复", first.saturating_add(1)));
            }
            None => {}
        }

        let mut own: HashSet<&str> = HashSet::from([standard]);
        let mut similar = Vec::new();
        for question in entry.similar_questions.iter().map(|q| q.trim()) {
            if question.is_empty() || !own.insert(question) {
                continue;
            }
            match self.seen.get(question) {
                Some(Origin::Existing) => {
                    return Some(format!("相似问 \"{question}\" 与知识库中已有问题重复"));
                }
                Some(Origin::Batch(first)) => {
                    return Some(format!(
                        "相似问 \"{question}\" 与批次内第 {} 条重复",
                        first.saturating_add(1)
                    ));
                }
                None => similar.push(question),
            }
        }

        self.seen.insert(standard.to_string(), Origin::Batch(index));
        for question in similar {
            self.seen.insert(question.to_string(), Origin::Batch(index));
        }
        None
    }
}

fn basic_problem(entry: &FaqEntryPayload) -> Option<String> {
    if entry.standard_question.trim().is_empty() {
        return Some("标准问不能为空".into());
    }
    if entry.answers.is_empty() {
        return Some("答案不能为空".into());
    }
    if entry.answers.iter().all(|a| a.trim().is_empty()) {
        return Some("答案不能全为空".into());
    }
    if parse_answer_strategy(entry.answer_strategy.as_deref()).is_err() {
        return Some(INVALID_ANSWER_STRATEGY.into());
    }
    None
}

fn questions_of(meta: &FaqChunkMetadata) -> impl Iterator<Item = &str> {
    std::iter::once(meta.standard_question.as_str())
        .chain(meta.similar_questions.iter().map(String::as_str))
        .map(str::trim)
        .filter(|q| !q.is_empty())
}

/// Rejects an edited entry whose questions collide with each other or with
/// any other FAQ chunk of the base. `exclude_chunk_id` is the entry itself.
pub(crate) fn check_question_conflicts(
    meta: &FaqChunkMetadata,
    others: &[Chunk],
    exclude_chunk_id: Option<&str>,
) -> Result<(), AppError> {
    let mut own = HashSet::new();
    for question in &meta.similar_questions {
        if *question == meta.standard_question {
            return Err(AppError::BadRequest(format!("相似问「{question}」不能与标准问相同")));
        }
        if !own.insert(question.as_str()) {
            return Err(AppError::BadRequest(format!("相似问「{question}」重复")));
        }
    }

    for other in others
        .iter()
        .filter(|c| Some(c.id.as_str()) != exclude_chunk_id)
    {
        let Some(existing) = other.faq_metadata() else {
            continue;
        };
        if existing.standard_question == meta.standard_question {
            return Err(AppError::BadRequest(format!(
                "标准问「{}」已存在",
                meta.standard_question
            )));
        }
        if existing.similar_questions.contains(&meta.standard_question) {
            return Err(AppError::BadRequest(format!(
                "标准问「{}」与已有相似问重复",
                meta.standard_question
            )));
        }
        for question in &meta.similar_questions {
            if *question == existing.standard_question {
                return Err(AppError::BadRequest(format!("相似问「{question}」与已有标准问重复")));
            }
            if existing.similar_questions.contains(question) {
                return Err(AppError::BadRequest(format!("相似问「{question}」已存在")));
            }
        }
    }
    Ok(())
}
