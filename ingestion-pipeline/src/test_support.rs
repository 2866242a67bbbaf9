//! Shared fixtures for the engine tests: an in-memory database, the real
//! SurrealDB index with hashed embeddings, and recording collaborator mocks.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        store::StorageManager,
        types::{
            knowledge::{Knowledge, KnowledgeType},
            knowledge_base::{KnowledgeBase, KnowledgeBaseType},
            tenant::Tenant,
        },
    },
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    config::IngestionConfig,
    engine::KnowledgeEngine,
    models::HashedEmbeddingModel,
    retrieval::SurrealRetrievalEngine,
    services::{
        ChatModel, ChatOptions, Collaborators, DocumentReader, EmbeddingModel, GraphNamespace,
        GraphStore, IndexInfo, ModelProvider, ReadConfig, RetrievalEngine, SearchHit, SearchParams,
        Segment,
    },
};

pub const TENANT: u64 = 7;
pub const EMBED_DIMS: u32 = 8;

pub async fn memory_db() -> Arc<SurrealDbClient> {
    Arc::new(
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb"),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatCall {
    pub system: Option<String>,
    pub user: String,
    pub options: ChatOptions,
}

pub struct MockChat {
    reply: Mutex<Result<String, String>>,
    pub calls: Mutex<Vec<ChatCall>>,
}

impl MockChat {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Mutex::new(Ok(reply.to_string())),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_reply(&self, reply: Result<&str, &str>) {
        *self.reply.lock().await = reply.map(str::to_string).map_err(str::to_string);
    }
}

#[async_trait]
impl ChatModel for MockChat {
    fn id(&self) -> &str {
        "mock-chat"
    }

    async fn chat(
        &self,
        system: Option<&str>,
        user: &str,
        options: ChatOptions,
    ) -> Result<String, AppError> {
        self.calls.lock().await.push(ChatCall {
            system: system.map(str::to_string),
            user: user.to_string(),
            options,
        });
        self.reply.lock().await.clone().map_err(AppError::Processing)
    }
}

pub struct StaticModels {
    pub embedding: Arc<HashedEmbeddingModel>,
    pub chat: Arc<MockChat>,
}

#[async_trait]
impl ModelProvider for StaticModels {
    async fn embedding_model(&self, _id: &str) -> Result<Arc<dyn EmbeddingModel>, AppError> {
        Ok(Arc::clone(&self.embedding) as Arc<dyn EmbeddingModel>)
    }

    async fn chat_model(&self, _id: &str) -> Result<Arc<dyn ChatModel>, AppError> {
        Ok(Arc::clone(&self.chat) as Arc<dyn ChatModel>)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReadCall {
    File { file_name: String, size: usize },
    Url { url: String },
}

pub struct MockReader {
    segments: Mutex<Result<Vec<Segment>, String>>,
    pub calls: Mutex<Vec<ReadCall>>,
}

impl MockReader {
    pub fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments: Mutex::new(Ok(segments)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_segments(&self, segments: Result<Vec<Segment>, &str>) {
        *self.segments.lock().await = segments.map_err(str::to_string);
    }
}

#[async_trait]
impl DocumentReader for MockReader {
    async fn read_from_file(
        &self,
        bytes: Bytes,
        file_name: &str,
        _file_type: &str,
        _config: &ReadConfig,
    ) -> Result<Vec<Segment>, AppError> {
        self.calls.lock().await.push(ReadCall::File {
            file_name: file_name.to_string(),
            size: bytes.len(),
        });
        self.segments.lock().await.clone().map_err(AppError::Processing)
    }

    async fn read_from_url(
        &self,
        url: &str,
        _title: &str,
        _config: &ReadConfig,
    ) -> Result<Vec<Segment>, AppError> {
        self.calls.lock().await.push(ReadCall::Url {
            url: url.to_string(),
        });
        self.segments.lock().await.clone().map_err(AppError::Processing)
    }
}

/// Wraps the real SurrealDB index, recording calls and optionally failing or
/// marking a knowledge `deleting` while indexing.
pub struct RecordingRetrieval {
    inner: SurrealRetrievalEngine,
    db: Arc<SurrealDbClient>,
    fail_index: AtomicBool,
    delete_during_index: Mutex<Option<String>>,
    index_delay: Mutex<Duration>,
    pub calls: Mutex<Vec<String>>,
}

impl RecordingRetrieval {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self {
            inner: SurrealRetrievalEngine::new(Arc::clone(&db), 16),
            db,
            fail_index: AtomicBool::new(false),
            delete_during_index: Mutex::new(None),
            index_delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_indexing(&self, fail: bool) {
        self.fail_index.store(fail, Ordering::SeqCst);
    }

    /// Makes every `batch_index` call take at least `delay`.
    pub async fn set_index_delay(&self, delay: Duration) {
        *self.index_delay.lock().await = delay;
    }

    pub async fn mark_deleting_on_index(&self, knowledge_id: &str) {
        *self.delete_during_index.lock().await = Some(knowledge_id.to_string());
    }

    async fn record(&self, call: String) {
        self.calls.lock().await.push(call);
    }

    pub async fn indexed_source_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter_map(|call| call.strip_prefix("index:"))
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl RetrievalEngine for RecordingRetrieval {
    async fn batch_index(
        &self,
        tenant_id: u64,
        model: &dyn EmbeddingModel,
        infos: &[IndexInfo],
    ) -> Result<(), AppError> {
        for info in infos {
            self.record(format!("index:{}", info.source_id)).await;
        }
        let delay = *self.index_delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(knowledge_id) = self.delete_during_index.lock().await.take() {
            Knowledge::mark_deleting(&self.db, &[knowledge_id]).await?;
        }
        if self.fail_index.load(Ordering::SeqCst) {
            // Leave a partial write behind, like a backend failing mid-batch.
            if let Some(first) = infos.first() {
                self.inner
                    .batch_index(tenant_id, model, std::slice::from_ref(first))
                    .await?;
            }
            return Err(AppError::Processing("index backend unavailable".into()));
        }
        self.inner.batch_index(tenant_id, model, infos).await
    }

    async fn delete_by_knowledge_ids(
        &self,
        tenant_id: u64,
        knowledge_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        self.record(format!("delete_knowledge:{}", knowledge_ids.join(",")))
            .await;
        self.inner
            .delete_by_knowledge_ids(tenant_id, knowledge_ids, dimensions, knowledge_type)
            .await
    }

    async fn delete_by_chunk_ids(
        &self,
        tenant_id: u64,
        chunk_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        self.record(format!("delete_chunks:{}", chunk_ids.len())).await;
        self.inner
            .delete_by_chunk_ids(tenant_id, chunk_ids, dimensions, knowledge_type)
            .await
    }

    async fn delete_by_source_ids(
        &self,
        tenant_id: u64,
        source_ids: &[String],
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        for source_id in source_ids {
            self.record(format!("delete_source:{source_id}")).await;
        }
        self.inner
            .delete_by_source_ids(tenant_id, source_ids, dimensions, knowledge_type)
            .await
    }

    async fn search(
        &self,
        tenant_id: u64,
        model: &dyn EmbeddingModel,
        params: &SearchParams,
    ) -> Result<Vec<SearchHit>, AppError> {
        self.record(format!("search:{}", params.query)).await;
        self.inner.search(tenant_id, model, params).await
    }

    fn estimate_storage_size(&self, model: &dyn EmbeddingModel, infos: &[IndexInfo]) -> i64 {
        self.inner.estimate_storage_size(model, infos)
    }

    async fn copy_indices(
        &self,
        target_tenant: u64,
        source_kb: &str,
        target_kb: &str,
        knowledge_map: &HashMap<String, String>,
        chunk_map: &HashMap<String, String>,
        dimensions: u32,
        knowledge_type: KnowledgeType,
    ) -> Result<(), AppError> {
        self.record(format!("copy:{source_kb}->{target_kb}")).await;
        self.inner
            .copy_indices(
                target_tenant,
                source_kb,
                target_kb,
                knowledge_map,
                chunk_map,
                dimensions,
                knowledge_type,
            )
            .await
    }

    async fn batch_update_chunk_enabled_status(
        &self,
        updates: &HashMap<String, bool>,
    ) -> Result<(), AppError> {
        self.record(format!("enabled:{}", updates.len())).await;
        self.inner.batch_update_chunk_enabled_status(updates).await
    }

    async fn batch_update_chunk_tag(
        &self,
        updates: &HashMap<String, String>,
    ) -> Result<(), AppError> {
        self.record(format!("tag:{}", updates.len())).await;
        self.inner.batch_update_chunk_tag(updates).await
    }
}

#[derive(Default)]
pub struct RecordingGraph {
    pub deleted: Mutex<Vec<GraphNamespace>>,
}

#[async_trait]
impl GraphStore for RecordingGraph {
    async fn delete_namespaces(&self, namespaces: &[GraphNamespace]) -> Result<(), AppError> {
        self.deleted.lock().await.extend_from_slice(namespaces);
        Ok(())
    }
}

pub struct TestHarness {
    pub db: Arc<SurrealDbClient>,
    pub engine: KnowledgeEngine,
    pub retrieval: Arc<RecordingRetrieval>,
    pub reader: Arc<MockReader>,
    pub chat: Arc<MockChat>,
    pub graph: Arc<RecordingGraph>,
}

pub async fn harness() -> TestHarness {
    harness_with_config(IngestionConfig::default()).await
}

pub async fn harness_with_config(config: IngestionConfig) -> TestHarness {
    let db = memory_db().await;
    let retrieval = Arc::new(RecordingRetrieval::new(Arc::clone(&db)));
    let reader = Arc::new(MockReader::new(vec![text_segment(0, "hello world")]));
    let chat = Arc::new(MockChat::replying("generated"));
    let graph = Arc::new(RecordingGraph::default());
    let services = Collaborators {
        retrieval: Arc::clone(&retrieval) as Arc<dyn RetrievalEngine>,
        reader: Arc::clone(&reader) as Arc<dyn DocumentReader>,
        models: Arc::new(StaticModels {
            embedding: Arc::new(HashedEmbeddingModel::new("hashed", EMBED_DIMS)),
            chat: Arc::clone(&chat),
        }),
        graph: Arc::clone(&graph) as Arc<dyn GraphStore>,
    };
    let engine = KnowledgeEngine::with_collaborators(
        Arc::clone(&db),
        StorageManager::in_memory(),
        services,
        config,
    );

    TestHarness {
        db,
        engine,
        retrieval,
        reader,
        chat,
        graph,
    }
}

impl TestHarness {
    pub async fn tenant(&self, quota: i64) -> Tenant {
        self.db
            .store_item(Tenant::new(TENANT, "acme", quota))
            .await
            .expect("store tenant")
            .expect("tenant row")
    }

    pub async fn document_kb(&self) -> KnowledgeBase {
        KnowledgeBase::new(TENANT, "docs", "hashed")
            .save(&self.db)
            .await
            .expect("store kb")
    }

    pub async fn faq_kb(&self) -> KnowledgeBase {
        let mut kb = KnowledgeBase::new(TENANT, "faq", "hashed");
        kb.kb_type = KnowledgeBaseType::Faq;
        kb.save(&self.db).await.expect("store kb")
    }

    pub async fn file_knowledge(&self, kb: &KnowledgeBase, file_name: &str) -> Knowledge {
        let mut knowledge =
            Knowledge::new(TENANT, &kb.id, KnowledgeType::File, file_name, "hashed");
        knowledge.file_name = file_name.to_string();
        knowledge.file_type = file_name.rsplit('.').next().unwrap_or_default().to_string();
        knowledge.create(&self.db).await.expect("store knowledge")
    }

    pub async fn knowledge(&self, id: &str) -> Knowledge {
        Knowledge::get(&self.db, id)
            .await
            .expect("load knowledge")
            .expect("knowledge row")
    }
}

pub fn text_segment(seq: i64, content: &str) -> Segment {
    let end = i64::try_from(content.chars().count()).unwrap_or(i64::MAX);
    Segment {
        content: content.to_string(),
        seq,
        start: 0,
        end,
        images: Vec::new(),
    }
}
