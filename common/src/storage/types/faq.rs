//! FAQ entry shapes: the metadata embedded on `faq` chunks, the request
//! payloads used by imports and edits, and the per-import reporting records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::hashing::md5_of_parts;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStrategy {
    #[default]
    All,
    Random,
}

impl AnswerStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnswerStrategy::All => "all",
            AnswerStrategy::Random => "random",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaqImportMode {
    #[default]
    Append,
    Replace,
}

impl FaqImportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaqImportMode::Append => "append",
            FaqImportMode::Replace => "replace",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "append" => Some(FaqImportMode::Append),
            "replace" => Some(FaqImportMode::Replace),
            _ => None,
        }
    }
}

/// Whether answers are part of the indexed text.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaqIndexMode {
    QuestionOnly,
    #[default]
    QuestionAnswer,
}

/// Whether similar questions share one index entry with the standard question.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuestionIndexMode {
    #[default]
    Combined,
    Separate,
}

pub const FAQ_METADATA_SOURCE: &str = "faq";

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqChunkMetadata {
    pub standard_question: String,
    #[serde(default)]
    pub similar_questions: Vec<String>,
    #[serde(default)]
    pub negative_questions: Vec<String>,
    #[serde(default)]
    pub answers: Vec<String>,
    #[serde(default)]
    pub answer_strategy: AnswerStrategy,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub source: String,
}

impl FaqChunkMetadata {
    /// Trims every field, drops blanks and repeated values, and removes similar
    /// questions that just repeat the standard question.
    pub fn normalize(&mut self) {
        self.standard_question = self.standard_question.trim().to_string();
        self.similar_questions = dedup_trimmed(&self.similar_questions);
        let standard = self.standard_question.clone();
        self.similar_questions.retain(|q| *q != standard);
        self.negative_questions = dedup_trimmed(&self.negative_questions);
        self.answers = dedup_trimmed(&self.answers);
        if self.version == 0 {
            self.version = 1;
        }
    }

    /// Fingerprint of the entry's user-visible content. Field boundaries are
    /// delimited so moving a value between lists changes the hash.
    pub fn content_hash(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(
            8 + self.similar_questions.len() + self.negative_questions.len() + self.answers.len(),
        );
        parts.push("q:");
        parts.push(&self.standard_question);
        for (marker, list) in [
            ("\u{1e}s:", &self.similar_questions),
            ("\u{1e}n:", &self.negative_questions),
            ("\u{1e}a:", &self.answers),
        ] {
            parts.push(marker);
            for item in list {
                parts.push(item);
                parts.push("\u{1f}");
            }
        }
        parts.push("\u{1e}m:");
        parts.push(self.answer_strategy.as_str());
        md5_of_parts(&parts)
    }
}

fn dedup_trimmed(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let trimmed = value.trim();
        if trimmed.is_empty() || out.iter().any(|v| v == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

/// An entry as submitted by a caller, before sanitizing.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaqEntryPayload {
    /// Optional externally chosen seq id.
    pub id: Option<i64>,
    pub standard_question: String,
    pub similar_questions: Vec<String>,
    pub negative_questions: Vec<String>,
    pub answers: Vec<String>,
    pub answer_strategy: Option<String>,
    /// Seq id of an existing tag; 0 means unset.
    pub tag_id: i64,
    pub tag_name: String,
    pub is_enabled: Option<bool>,
    pub is_recommended: Option<bool>,
}

/// Caller facing view of one FAQ chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqEntry {
    pub seq_id: i64,
    pub chunk_id: String,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    pub tag_id: i64,
    pub tag_name: String,
    pub is_enabled: bool,
    pub is_recommended: bool,
    pub standard_question: String,
    pub similar_questions: Vec<String>,
    pub negative_questions: Vec<String>,
    pub answers: Vec<String>,
    pub answer_strategy: AnswerStrategy,
    pub index_mode: FaqIndexMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqFailedEntry {
    pub index: usize,
    pub reason: String,
    pub tag_name: String,
    pub standard_question: String,
    pub similar_questions: Vec<String>,
    pub negative_questions: Vec<String>,
    pub answers: Vec<String>,
    pub answer_all: bool,
    pub is_disabled: bool,
}

impl FaqFailedEntry {
    pub fn from_payload(index: usize, reason: impl Into<String>, entry: &FaqEntryPayload) -> Self {
        Self {
            index,
            reason: reason.into(),
            tag_name: entry.tag_name.clone(),
            standard_question: entry.standard_question.trim().to_string(),
            similar_questions: entry.similar_questions.clone(),
            negative_questions: entry.negative_questions.clone(),
            answers: entry.answers.clone(),
            answer_all: entry.answer_strategy.as_deref() == Some(AnswerStrategy::All.as_str()),
            is_disabled: entry.is_enabled == Some(false),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqSuccessEntry {
    pub index: usize,
    pub seq_id: i64,
    pub tag_id: i64,
    pub tag_name: String,
    pub standard_question: String,
}

/// Summary of the most recent committed import, kept on the FAQ container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqImportResult {
    pub task_id: String,
    pub total_entries: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub import_mode: FaqImportMode,
    pub imported_at: DateTime<Utc>,
    pub processing_time_ms: i64,
    pub display_status: String,
    #[serde(default)]
    pub failed_entries_url: String,
}

pub const DISPLAY_STATUS_OPEN: &str = "open";
pub const DISPLAY_STATUS_CLOSE: &str = "close";

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> FaqChunkMetadata {
        FaqChunkMetadata {
            standard_question: "  How do I reset?  ".into(),
            similar_questions: vec![
                "reset password".into(),
                " ".into(),
                "How do I reset?".into(),
                "reset password".into(),
            ],
            negative_questions: vec![],
            answers: vec!["Use the link".into(), "".into()],
            answer_strategy: AnswerStrategy::All,
            version: 0,
            source: FAQ_METADATA_SOURCE.into(),
        }
    }

    #[test]
    fn normalize_trims_and_dedups() {
        let mut meta = metadata();
        meta.normalize();
        assert_eq!(meta.standard_question, "How do I reset?");
        assert_eq!(meta.similar_questions, vec!["reset password".to_string()]);
        assert_eq!(meta.answers, vec!["Use the link".to_string()]);
        assert_eq!(meta.version, 1);
    }

    #[test]
    fn content_hash_depends_on_field_placement() {
        let mut meta = metadata();
        meta.normalize();
        let base = meta.content_hash();
        assert_eq!(base, meta.clone().content_hash());

        let mut moved = meta.clone();
        moved.negative_questions = moved.similar_questions.clone();
        moved.similar_questions.clear();
        assert_ne!(base, moved.content_hash());

        let mut version_bump = meta.clone();
        version_bump.version = 7;
        assert_eq!(base, version_bump.content_hash());
    }

    #[test]
    fn import_mode_parses_known_values() {
        assert_eq!(FaqImportMode::parse(""), Some(FaqImportMode::Append));
        assert_eq!(FaqImportMode::parse("replace"), Some(FaqImportMode::Replace));
        assert_eq!(FaqImportMode::parse("merge"), None);
    }

    #[test]
    fn failed_entry_copies_flags() {
        let payload = FaqEntryPayload {
            standard_question: " Q ".into(),
            answer_strategy: Some("all".into()),
            is_enabled: Some(false),
            ..Default::default()
        };
        let failed = FaqFailedEntry::from_payload(3, "bad", &payload);
        assert_eq!(failed.standard_question, "Q");
        assert!(failed.answer_all);
        assert!(failed.is_disabled);
    }
}
