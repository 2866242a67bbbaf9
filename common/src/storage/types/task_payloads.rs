use serde::{Deserialize, Serialize};

use super::faq::{FaqEntryPayload, FaqImportMode};

/// Logical queue a task is published on. `Low` is drained after `Default`.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskQueue {
    #[default]
    Default,
    Low,
}

impl TaskQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskQueue::Default => "default",
            TaskQueue::Low => "low",
        }
    }

    /// Claim priority; higher values are claimed first.
    pub fn priority(&self) -> i32 {
        match self {
            TaskQueue::Default => 10,
            TaskQueue::Low => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    DocumentProcess,
    FaqImport,
    QuestionGeneration,
    SummaryGeneration,
    KbClone,
    KnowledgeListDelete,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::DocumentProcess => "document_process",
            TaskType::FaqImport => "faq_import",
            TaskType::QuestionGeneration => "question_generation",
            TaskType::SummaryGeneration => "summary_generation",
            TaskType::KbClone => "kb_clone",
            TaskType::KnowledgeListDelete => "knowledge_list_delete",
        }
    }

    pub fn default_queue(&self) -> TaskQueue {
        match self {
            TaskType::QuestionGeneration | TaskType::SummaryGeneration => TaskQueue::Low,
            _ => TaskQueue::Default,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentProcessPayload {
    pub tenant_id: u64,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub file_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub passages: Vec<String>,
    #[serde(default)]
    pub enable_multimodal: bool,
    #[serde(default)]
    pub enable_question_generation: bool,
    #[serde(default)]
    pub question_count: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqImportPayload {
    pub tenant_id: u64,
    pub task_id: String,
    pub kb_id: String,
    pub knowledge_id: String,
    pub mode: FaqImportMode,
    #[serde(default)]
    pub dry_run: bool,
    pub enqueued_at: i64,
    /// Inline entries; empty when `entries_url` is set.
    #[serde(default)]
    pub entries: Vec<FaqEntryPayload>,
    #[serde(default)]
    pub entries_url: String,
    #[serde(default)]
    pub entry_count: usize,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionGenerationPayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub knowledge_id: String,
    pub question_count: u32,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct SummaryGenerationPayload {
    pub tenant_id: u64,
    pub knowledge_base_id: String,
    pub knowledge_id: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct KbClonePayload {
    pub tenant_id: u64,
    pub task_id: String,
    pub source_id: String,
    pub target_id: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeListDeletePayload {
    pub tenant_id: u64,
    pub knowledge_ids: Vec<String>,
}

/// Self-contained task body; a worker needs nothing else besides durable state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskPayload {
    DocumentProcess(DocumentProcessPayload),
    FaqImport(FaqImportPayload),
    QuestionGeneration(QuestionGenerationPayload),
    SummaryGeneration(SummaryGenerationPayload),
    KbClone(KbClonePayload),
    KnowledgeListDelete(KnowledgeListDeletePayload),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::DocumentProcess(_) => TaskType::DocumentProcess,
            TaskPayload::FaqImport(_) => TaskType::FaqImport,
            TaskPayload::QuestionGeneration(_) => TaskType::QuestionGeneration,
            TaskPayload::SummaryGeneration(_) => TaskType::SummaryGeneration,
            TaskPayload::KbClone(_) => TaskType::KbClone,
            TaskPayload::KnowledgeListDelete(_) => TaskType::KnowledgeListDelete,
        }
    }

    pub fn tenant_id(&self) -> u64 {
        match self {
            TaskPayload::DocumentProcess(p) => p.tenant_id,
            TaskPayload::FaqImport(p) => p.tenant_id,
            TaskPayload::QuestionGeneration(p) => p.tenant_id,
            TaskPayload::SummaryGeneration(p) => p.tenant_id,
            TaskPayload::KbClone(p) => p.tenant_id,
            TaskPayload::KnowledgeListDelete(p) => p.tenant_id,
        }
    }

    /// The single knowledge item the task works on, if any.
    pub fn knowledge_id(&self) -> Option<&str> {
        match self {
            TaskPayload::DocumentProcess(p) => Some(&p.knowledge_id),
            TaskPayload::QuestionGeneration(p) => Some(&p.knowledge_id),
            TaskPayload::SummaryGeneration(p) => Some(&p.knowledge_id),
            TaskPayload::FaqImport(_) | TaskPayload::KbClone(_) | TaskPayload::KnowledgeListDelete(_) => None,
        }
    }
}
