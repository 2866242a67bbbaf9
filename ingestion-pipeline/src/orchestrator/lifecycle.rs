use std::collections::HashMap;

use chrono::Utc;
use common::{
    error::AppError,
    storage::types::{
        background_task::BackgroundTask,
        chunk::Chunk,
        knowledge::{EnableStatus, Knowledge, KnowledgeType, ManualMetadata, ManualStatus, ParseStatus},
        knowledge_base::KnowledgeBase,
        task_payloads::{DocumentProcessPayload, KnowledgeListDeletePayload, TaskPayload},
        tenant::Tenant,
    },
};
use tracing::{error, info, instrument, warn};

use super::{document_payload, ensure_manual_file_name, manual_payload, ManualInput};
use crate::{engine::KnowledgeEngine, services::GraphNamespace};

impl KnowledgeEngine {
    /// Replaces the content of a manual note. The previous index, chunks and
    /// storage charge are dropped; a published note is reprocessed.
    #[instrument(skip_all, fields(tenant_id = tenant_id, knowledge_id = %knowledge_id))]
    pub async fn update_manual_knowledge(
        &self,
        tenant_id: u64,
        knowledge_id: &str,
        input: ManualInput,
    ) -> Result<Knowledge, AppError> {
        let draft = self.check_manual_input(&input)?;
        let mut existing = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id).await?;
        if existing.knowledge_type != KnowledgeType::Manual {
            return Err(AppError::BadRequest("仅支持手工知识的在线编辑".into()));
        }
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, &existing.knowledge_base_id).await?;

        let version = existing
            .manual()
            .map_or(1, |meta| meta.version.saturating_add(1));
        existing.metadata.manual = Some(ManualMetadata {
            content: draft.content,
            status: draft.status,
            version,
            updated_at: Utc::now(),
        });
        if !draft.title.is_empty() {
            existing.title = draft.title;
        } else if existing.title.is_empty() {
            existing.title = format!("手工知识-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        }
        existing.file_name = ensure_manual_file_name(&existing.title);
        existing.file_type = KnowledgeType::Manual.as_str().to_string();
        existing.source = KnowledgeType::Manual.as_str().to_string();
        existing.enable_status = EnableStatus::Disabled;

        self.cleanup_knowledge_resources(&mut existing).await?;

        existing.embedding_model_id.clone_from(&kb.embedding_model_id);
        existing.description.clear();
        existing.processed_at = None;
        existing.parse_status = match draft.status {
            ManualStatus::Draft => ParseStatus::Draft,
            ManualStatus::Publish => ParseStatus::Pending,
        };
        let saved = existing.save(&self.db).await?;

        if draft.status == ManualStatus::Publish {
            info!(knowledge_id = %saved.id, version, "manual knowledge updated; scheduling indexing");
            self.schedule_document(manual_payload(&kb, &saved)).await;
        }
        Ok(saved)
    }

    /// Drops everything derived from a knowledge and parses its source again.
    #[instrument(skip_all, fields(tenant_id = tenant_id, knowledge_id = %knowledge_id))]
    pub async fn reparse_knowledge(
        &self,
        tenant_id: u64,
        knowledge_id: &str,
    ) -> Result<Knowledge, AppError> {
        let mut existing = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id).await?;
        let kb = KnowledgeBase::get_for_tenant(&self.db, tenant_id, &existing.knowledge_base_id).await?;

        let payload = reparse_payload(&kb, &existing).ok_or_else(|| {
            AppError::BadRequest(format!(
                "知识类型 {} 不支持重新解析",
                existing.knowledge_type.as_str()
            ))
        })?;

        self.cleanup_knowledge_resources(&mut existing).await?;

        existing.parse_status = ParseStatus::Pending;
        existing.enable_status = EnableStatus::Disabled;
        existing.error_message.clear();
        existing.description.clear();
        existing.processed_at = None;
        existing.embedding_model_id.clone_from(&kb.embedding_model_id);
        let saved = existing.save(&self.db).await?;

        info!(knowledge_id = %saved.id, kind = saved.knowledge_type.as_str(), "scheduling reparse");
        self.schedule_document(payload).await;
        Ok(saved)
    }

    /// Removes index entries, chunks, graph data and the storage charge of a
    /// knowledge that is about to be reprocessed. Every step runs; the first
    /// failure is returned.
    async fn cleanup_knowledge_resources(&self, knowledge: &mut Knowledge) -> Result<(), AppError> {
        if knowledge.parse_status == ParseStatus::Draft && knowledge.storage_size == 0 {
            return Ok(());
        }
        info!(knowledge_id = %knowledge.id, "cleaning knowledge resources");

        let ids = [knowledge.id.clone()];
        let mut first_error: Option<AppError> = None;

        if !knowledge.embedding_model_id.is_empty() {
            let result = async {
                let model = self
                    .services
                    .models
                    .embedding_model(&knowledge.embedding_model_id)
                    .await?;
                self.services
                    .retrieval
                    .delete_by_knowledge_ids(
                        knowledge.tenant_id,
                        &ids,
                        model.dimensions(),
                        knowledge.knowledge_type,
                    )
                    .await
            }
            .await;
            if let Err(err) = result {
                error!(knowledge_id = %knowledge.id, error = %err, "failed to delete index entries");
                first_error.get_or_insert(err);
            }
        }

        if let Err(err) = Chunk::delete_by_knowledge_ids(&self.db, &ids).await {
            error!(knowledge_id = %knowledge.id, error = %err, "failed to delete chunks");
            first_error.get_or_insert(err);
        }

        if let Err(err) = self
            .services
            .graph
            .delete_namespaces(&[namespace_of(knowledge)])
            .await
        {
            error!(knowledge_id = %knowledge.id, error = %err, "failed to delete graph data");
            first_error.get_or_insert(err);
        }

        if knowledge.storage_size > 0 {
            let refund = knowledge.storage_size.saturating_neg();
            match Tenant::adjust_storage_used(&self.db, knowledge.tenant_id, refund).await {
                Ok(()) => knowledge.storage_size = 0,
                Err(err) => {
                    error!(knowledge_id = %knowledge.id, error = %err, "failed to refund storage");
                    first_error.get_or_insert(err);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    pub async fn delete_knowledge(&self, tenant_id: u64, knowledge_id: &str) -> Result<(), AppError> {
        let knowledge = Knowledge::get_for_tenant(&self.db, tenant_id, knowledge_id).await?;
        self.delete_knowledge_records(tenant_id, vec![knowledge]).await
    }

    /// Deletes every listed knowledge owned by the tenant. Unknown ids are ignored.
    pub async fn delete_knowledge_list(
        &self,
        tenant_id: u64,
        knowledge_ids: &[String],
    ) -> Result<(), AppError> {
        if knowledge_ids.is_empty() {
            return Ok(());
        }
        let knowledge = Knowledge::list_by_ids(&self.db, tenant_id, knowledge_ids).await?;
        self.delete_knowledge_records(tenant_id, knowledge).await
    }

    /// Queues a bulk delete for the worker.
    pub async fn enqueue_knowledge_list_delete(
        &self,
        tenant_id: u64,
        knowledge_ids: Vec<String>,
    ) -> Result<BackgroundTask, AppError> {
        let task = BackgroundTask::new(TaskPayload::KnowledgeListDelete(
            KnowledgeListDeletePayload {
                tenant_id,
                knowledge_ids,
            },
        ));
        self.enqueue(task).await
    }

    #[instrument(skip_all, fields(tenant_id = payload.tenant_id, count = payload.knowledge_ids.len()))]
    pub async fn process_knowledge_list_delete(
        &self,
        payload: &KnowledgeListDeletePayload,
    ) -> Result<(), AppError> {
        self.delete_knowledge_list(payload.tenant_id, &payload.knowledge_ids)
            .await?;
        info!(count = payload.knowledge_ids.len(), "knowledge list deleted");
        Ok(())
    }

    /// Marks the records `deleting` so in-flight processing backs off, removes
    /// their derived data in parallel and finally deletes the rows.
    #[instrument(skip_all, fields(tenant_id = tenant_id, count = knowledge.len()))]
    async fn delete_knowledge_records(
        &self,
        tenant_id: u64,
        knowledge: Vec<Knowledge>,
    ) -> Result<(), AppError> {
        if knowledge.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = knowledge.iter().map(|k| k.id.clone()).collect();

        if let Err(err) = Knowledge::mark_deleting(&self.db, &ids).await {
            error!(error = %err, "failed to mark knowledge as deleting; continuing with deletion");
        } else {
            info!(count = ids.len(), "marked knowledge as deleting");
        }

        match BackgroundTask::cancel_queued_for_knowledge(&self.db, tenant_id, &ids).await {
            Ok(0) => {}
            Ok(cancelled) => info!(cancelled, "cancelled queued processing of deleted knowledge"),
            Err(err) => warn!(error = %err, "failed to cancel queued knowledge tasks"),
        }

        let index = async {
            let mut groups: HashMap<(&str, KnowledgeType), Vec<String>> = HashMap::new();
            for k in &knowledge {
                groups
                    .entry((k.embedding_model_id.as_str(), k.knowledge_type))
                    .or_default()
                    .push(k.id.clone());
            }
            for ((model_id, knowledge_type), group_ids) in groups {
                let model = self.services.models.embedding_model(model_id).await?;
                self.services
                    .retrieval
                    .delete_by_knowledge_ids(tenant_id, &group_ids, model.dimensions(), knowledge_type)
                    .await
                    .inspect_err(|err| error!(error = %err, "failed to delete knowledge index entries"))?;
            }
            Ok::<(), AppError>(())
        };

        let chunks = async {
            Chunk::delete_by_knowledge_ids(&self.db, &ids)
                .await
                .inspect_err(|err| error!(error = %err, "failed to delete knowledge chunks"))
        };

        let files = async {
            let mut refund: i64 = 0;
            for k in &knowledge {
                if !k.file_path.is_empty() {
                    if let Err(err) = self.storage.delete_file(&k.file_path).await {
                        warn!(knowledge_id = %k.id, error = %err, "failed to delete stored file");
                    }
                }
                refund = refund.saturating_add(k.storage_size);
            }
            if let Err(err) =
                Tenant::adjust_storage_used(&self.db, tenant_id, refund.saturating_neg()).await
            {
                warn!(tenant_id, error = %err, "failed to refund tenant storage");
            }
            Ok::<(), AppError>(())
        };

        let graph = async {
            let namespaces: Vec<GraphNamespace> = knowledge.iter().map(namespace_of).collect();
            self.services
                .graph
                .delete_namespaces(&namespaces)
                .await
                .inspect_err(|err| error!(error = %err, "failed to delete knowledge graph"))
        };

        futures::try_join!(index, chunks, files, graph)?;

        Knowledge::delete_by_ids(&self.db, &ids).await?;
        info!(count = ids.len(), "knowledge deleted");
        Ok(())
    }
}

fn namespace_of(knowledge: &Knowledge) -> GraphNamespace {
    GraphNamespace {
        knowledge_base_id: knowledge.knowledge_base_id.clone(),
        knowledge_id: knowledge.id.clone(),
    }
}

/// Payload that re-reads the knowledge's original source, if it has one the
/// worker can fetch again.
fn reparse_payload(kb: &KnowledgeBase, knowledge: &Knowledge) -> Option<DocumentProcessPayload> {
    let multimodal = kb.is_multimodal_enabled();
    match knowledge.knowledge_type {
        KnowledgeType::Manual => knowledge.manual().map(|_| manual_payload(kb, knowledge)),
        KnowledgeType::File if !knowledge.file_path.is_empty() => Some(DocumentProcessPayload {
            file_path: knowledge.file_path.clone(),
            file_name: knowledge.file_name.clone(),
            file_type: super::file_type_of(&knowledge.file_name),
            ..document_payload(kb, knowledge, multimodal)
        }),
        KnowledgeType::FileUrl if !knowledge.source.is_empty() => Some(DocumentProcessPayload {
            file_url: knowledge.source.clone(),
            file_name: knowledge.file_name.clone(),
            file_type: knowledge.file_type.clone(),
            ..document_payload(kb, knowledge, multimodal)
        }),
        KnowledgeType::Url if !knowledge.source.is_empty() => Some(DocumentProcessPayload {
            url: knowledge.source.clone(),
            ..document_payload(kb, knowledge, multimodal)
        }),
        _ => None,
    }
}
