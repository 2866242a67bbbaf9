use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{background_task::BackgroundTask, knowledge_base::KnowledgeBase},
    },
    utils::config::AppConfig,
};
use tracing::info;

use crate::{
    config::IngestionConfig,
    models::OpenAiModelProvider,
    reader::HttpDocumentReader,
    retrieval::SurrealRetrievalEngine,
    services::{ChatModel, Collaborators, EmbeddingModel, NoopGraphStore},
};

/// Entry point for every ingestion operation and task handler. The
/// operations live in the `orchestrator`, `pipeline`, `enrichment`, `faq`
/// and `clone` modules as further `impl` blocks.
pub struct KnowledgeEngine {
    pub(crate) db: Arc<SurrealDbClient>,
    pub(crate) storage: StorageManager,
    pub(crate) services: Collaborators,
    pub(crate) config: IngestionConfig,
}

impl KnowledgeEngine {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        openai_client: Arc<Client<OpenAIConfig>>,
        app_config: &AppConfig,
    ) -> Result<Self, AppError> {
        let config = IngestionConfig::from_app_config(app_config);
        let services = Collaborators {
            retrieval: Arc::new(SurrealRetrievalEngine::new(
                Arc::clone(&db),
                config.tuning.embed_batch_size,
            )),
            reader: Arc::new(HttpDocumentReader::new(app_config.docreader_url.clone())?),
            models: Arc::new(OpenAiModelProvider::new(openai_client, app_config)),
            graph: Arc::new(NoopGraphStore),
        };
        Ok(Self::with_collaborators(db, storage, services, config))
    }

    pub fn with_collaborators(
        db: Arc<SurrealDbClient>,
        storage: StorageManager,
        services: Collaborators,
        config: IngestionConfig,
    ) -> Self {
        Self {
            db,
            storage,
            services,
            config,
        }
    }

    pub fn db(&self) -> &SurrealDbClient {
        &self.db
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn config(&self) -> &IngestionConfig {
        &self.config
    }

    pub(crate) async fn enqueue(&self, task: BackgroundTask) -> Result<BackgroundTask, AppError> {
        let task_type = task.task_type;
        let stored = task.enqueue(&self.db).await?;
        info!(
            task_id = %stored.id,
            task_type = task_type.as_str(),
            queue = stored.queue.as_str(),
            "enqueued background task"
        );
        Ok(stored)
    }

    pub(crate) async fn embedding_model(
        &self,
        kb: &KnowledgeBase,
    ) -> Result<Arc<dyn EmbeddingModel>, AppError> {
        self.services
            .models
            .embedding_model(&kb.embedding_model_id)
            .await
    }

    pub(crate) async fn chat_model(&self, kb: &KnowledgeBase) -> Result<Arc<dyn ChatModel>, AppError> {
        self.services.models.chat_model(&kb.summary_model_id).await
    }
}
