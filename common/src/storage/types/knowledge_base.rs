use serde::{Deserialize, Serialize};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::faq::{FaqIndexMode, QuestionIndexMode};

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeBaseType {
    #[default]
    Document,
    Faq,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkingConfig {
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub separators: Vec<String>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            separators: vec!["\n\n".into(), "\n".into(), "。".into()],
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    pub provider: String,
    pub bucket_name: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct VlmConfig {
    pub enabled: bool,
    pub model_id: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct FaqConfig {
    #[serde(default)]
    pub index_mode: FaqIndexMode,
    #[serde(default)]
    pub question_index_mode: QuestionIndexMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionGenerationConfig {
    pub enabled: bool,
    pub question_count: u32,
}

impl Default for QuestionGenerationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            question_count: 3,
        }
    }
}

stored_object!(KnowledgeBase, "knowledge_base", {
    tenant_id: u64,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    kb_type: KnowledgeBaseType,
    embedding_model_id: String,
    #[serde(default)]
    summary_model_id: String,
    #[serde(default)]
    chunking_config: ChunkingConfig,
    #[serde(default)]
    storage_config: StorageConfig,
    #[serde(default)]
    vlm_config: VlmConfig,
    #[serde(default)]
    faq_config: FaqConfig,
    #[serde(default)]
    question_generation_config: QuestionGenerationConfig
});

impl KnowledgeBase {
    pub fn new(tenant_id: u64, name: impl Into<String>, embedding_model_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            name: name.into(),
            description: String::new(),
            kb_type: KnowledgeBaseType::Document,
            embedding_model_id: embedding_model_id.into(),
            summary_model_id: String::new(),
            chunking_config: ChunkingConfig::default(),
            storage_config: StorageConfig::default(),
            vlm_config: VlmConfig::default(),
            faq_config: FaqConfig::default(),
            question_generation_config: QuestionGenerationConfig::default(),
        }
    }

    pub fn is_faq(&self) -> bool {
        self.kb_type == KnowledgeBaseType::Faq
    }

    pub fn has_storage_bucket(&self) -> bool {
        !self.storage_config.bucket_name.trim().is_empty()
    }

    pub fn has_vlm(&self) -> bool {
        self.vlm_config.enabled && !self.vlm_config.model_id.trim().is_empty()
    }

    pub fn is_multimodal_enabled(&self) -> bool {
        self.has_vlm() && self.has_storage_bucket()
    }

    /// Copies every setting from `source` while keeping this base's identity.
    pub fn copy_configuration(&mut self, source: &KnowledgeBase) {
        self.description.clone_from(&source.description);
        self.kb_type = source.kb_type;
        self.embedding_model_id.clone_from(&source.embedding_model_id);
        self.summary_model_id.clone_from(&source.summary_model_id);
        self.chunking_config = source.chunking_config.clone();
        self.storage_config = source.storage_config.clone();
        self.vlm_config = source.vlm_config.clone();
        self.faq_config = source.faq_config.clone();
        self.question_generation_config = source.question_generation_config.clone();
        self.updated_at = chrono::Utc::now();
    }

    /// Loads a knowledge base owned by `tenant_id`.
    pub async fn get_for_tenant(
        db: &SurrealDbClient,
        tenant_id: u64,
        id: &str,
    ) -> Result<KnowledgeBase, AppError> {
        if id.trim().is_empty() {
            return Err(AppError::BadRequest("知识库 ID 不能为空".into()));
        }
        match db.get_item::<KnowledgeBase>(id).await? {
            Some(kb) if kb.tenant_id == tenant_id => Ok(kb),
            _ => Err(AppError::NotFound(format!("knowledge base {id} not found"))),
        }
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<KnowledgeBase, AppError> {
        db.get_item::<KnowledgeBase>(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("knowledge base {id} not found")))
    }

    pub async fn save(self, db: &SurrealDbClient) -> Result<KnowledgeBase, AppError> {
        let stored = db.upsert_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("knowledge base was not stored".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn multimodal_requires_bucket_and_model() {
        let mut kb = KnowledgeBase::new(1, "kb", "embed");
        assert!(!kb.is_multimodal_enabled());

        kb.vlm_config = VlmConfig {
            enabled: true,
            model_id: "vlm".into(),
        };
        assert!(!kb.is_multimodal_enabled());

        kb.storage_config.bucket_name = "bucket".into();
        assert!(kb.is_multimodal_enabled());
    }

    #[test]
    fn copy_configuration_keeps_identity() {
        let mut source = KnowledgeBase::new(1, "source", "embed-a");
        source.kb_type = KnowledgeBaseType::Faq;
        source.faq_config.question_index_mode = QuestionIndexMode::Separate;

        let mut target = KnowledgeBase::new(2, "target", "embed-b");
        let target_id = target.id.clone();
        target.copy_configuration(&source);

        assert_eq!(target.id, target_id);
        assert_eq!(target.tenant_id, 2);
        assert_eq!(target.name, "target");
        assert_eq!(target.embedding_model_id, "embed-a");
        assert!(target.is_faq());
        assert_eq!(
            target.faq_config.question_index_mode,
            QuestionIndexMode::Separate
        );
    }

    #[tokio::test]
    async fn tenant_scoping_hides_foreign_bases() {
        let db = SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("db");
        let kb = KnowledgeBase::new(1, "kb", "embed")
            .save(&db)
            .await
            .expect("save");

        assert!(KnowledgeBase::get_for_tenant(&db, 1, &kb.id).await.is_ok());
        assert!(matches!(
            KnowledgeBase::get_for_tenant(&db, 2, &kb.id).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            KnowledgeBase::get_for_tenant(&db, 1, "").await,
            Err(AppError::BadRequest(_))
        ));
    }
}
