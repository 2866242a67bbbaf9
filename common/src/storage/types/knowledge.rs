use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Datetime as SurrealDatetime;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::faq::FaqImportResult;

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    #[default]
    File,
    Url,
    FileUrl,
    Passage,
    Manual,
    Faq,
}

impl KnowledgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KnowledgeType::File => "file",
            KnowledgeType::Url => "url",
            KnowledgeType::FileUrl => "file_url",
            KnowledgeType::Passage => "passage",
            KnowledgeType::Manual => "manual",
            KnowledgeType::Faq => "faq",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Deleting,
    Draft,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Processing => "processing",
            ParseStatus::Completed => "completed",
            ParseStatus::Failed => "failed",
            ParseStatus::Deleting => "deleting",
            ParseStatus::Draft => "draft",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnableStatus {
    Enabled,
    #[default]
    Disabled,
}

impl EnableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnableStatus::Enabled => "enabled",
            EnableStatus::Disabled => "disabled",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryStatus {
    #[default]
    None,
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SummaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryStatus::None => "none",
            SummaryStatus::Pending => "pending",
            SummaryStatus::Processing => "processing",
            SummaryStatus::Completed => "completed",
            SummaryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManualStatus {
    #[default]
    Draft,
    Publish,
}

impl ManualStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "" | "draft" => Some(ManualStatus::Draft),
            "publish" => Some(ManualStatus::Publish),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualMetadata {
    pub content: String,
    pub status: ManualStatus,
    pub version: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct KnowledgeMetadata {
    #[serde(default)]
    pub manual: Option<ManualMetadata>,
}

stored_object!(Knowledge, "knowledge", {
    tenant_id: u64,
    knowledge_base_id: String,
    knowledge_type: KnowledgeType,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    file_name: String,
    #[serde(default)]
    file_type: String,
    #[serde(default)]
    file_size: i64,
    #[serde(default)]
    file_hash: String,
    #[serde(default)]
    file_path: String,
    embedding_model_id: String,
    parse_status: ParseStatus,
    enable_status: EnableStatus,
    #[serde(default)]
    summary_status: SummaryStatus,
    #[serde(default)]
    storage_size: i64,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    tag_id: String,
    #[serde(default)]
    metadata: KnowledgeMetadata,
    #[serde(default)]
    last_faq_import_result: Option<FaqImportResult>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    processed_at: Option<DateTime<Utc>>
});

impl Knowledge {
    pub fn new(
        tenant_id: u64,
        knowledge_base_id: &str,
        knowledge_type: KnowledgeType,
        title: impl Into<String>,
        embedding_model_id: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            knowledge_base_id: knowledge_base_id.to_string(),
            knowledge_type,
            title: title.into(),
            description: String::new(),
            source: String::new(),
            file_name: String::new(),
            file_type: String::new(),
            file_size: 0,
            file_hash: String::new(),
            file_path: String::new(),
            embedding_model_id: embedding_model_id.to_string(),
            parse_status: ParseStatus::Pending,
            enable_status: EnableStatus::Disabled,
            summary_status: SummaryStatus::None,
            storage_size: 0,
            error_message: String::new(),
            tag_id: String::new(),
            metadata: KnowledgeMetadata::default(),
            last_faq_import_result: None,
            processed_at: None,
        }
    }

    pub fn manual(&self) -> Option<&ManualMetadata> {
        self.metadata.manual.as_ref()
    }

    pub async fn create(self, db: &SurrealDbClient) -> Result<Knowledge, AppError> {
        let stored = db.store_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("knowledge was not stored".into()))
    }

    /// Writes the whole record back and bumps `updated_at`.
    pub async fn save(mut self, db: &SurrealDbClient) -> Result<Knowledge, AppError> {
        self.updated_at = Utc::now();
        let stored = db.upsert_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("knowledge was not stored".into()))
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<Option<Knowledge>, AppError> {
        Ok(db.get_item::<Knowledge>(id).await?)
    }

    pub async fn get_for_tenant(
        db: &SurrealDbClient,
        tenant_id: u64,
        id: &str,
    ) -> Result<Knowledge, AppError> {
        match db.get_item::<Knowledge>(id).await? {
            Some(knowledge) if knowledge.tenant_id == tenant_id => Ok(knowledge),
            _ => Err(AppError::NotFound(format!("knowledge {id} not found"))),
        }
    }

    /// Existing upload in the same base with identical name, size and bytes.
    pub async fn find_duplicate_file(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        file_name: &str,
        file_size: i64,
        file_hash: &str,
    ) -> Result<Option<Knowledge>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND knowledge_base_id = $kb_id
                   AND file_hash = $hash
                   AND file_name = $name
                   AND file_size = $size
                   AND parse_status != $deleting
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("hash", file_hash.to_string()))
            .bind(("name", file_name.to_string()))
            .bind(("size", file_size))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .await?;
        let found: Option<Knowledge> = result.take(0)?;
        Ok(found)
    }

    /// Existing knowledge of `knowledge_type` in the base with the same fingerprint.
    pub async fn find_duplicate_hash(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        knowledge_type: KnowledgeType,
        file_hash: &str,
    ) -> Result<Option<Knowledge>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND knowledge_base_id = $kb_id
                   AND knowledge_type = $kind
                   AND file_hash = $hash
                   AND parse_status != $deleting
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("kind", knowledge_type.as_str()))
            .bind(("hash", file_hash.to_string()))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .await?;
        let found: Option<Knowledge> = result.take(0)?;
        Ok(found)
    }

    /// Refreshes `created_at`/`updated_at` so a re-submitted duplicate sorts as new.
    pub async fn touch(db: &SurrealDbClient, id: &str) -> Result<Option<Knowledge>, AppError> {
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET created_at = $now, updated_at = $now
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;
        let updated: Option<Knowledge> = result.take(0)?;
        Ok(updated)
    }

    /// Sets the parse status unless the record is already being deleted.
    /// Returns `None` when the row is missing or marked `deleting`.
    pub async fn update_parse_status(
        db: &SurrealDbClient,
        id: &str,
        status: ParseStatus,
        error_message: &str,
    ) -> Result<Option<Knowledge>, AppError> {
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET parse_status = $status,
                     error_message = $error,
                     updated_at = $now
                 WHERE parse_status != $deleting
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("status", status.as_str()))
            .bind(("error", error_message.to_string()))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;
        let updated: Option<Knowledge> = result.take(0)?;
        Ok(updated)
    }

    pub async fn update_summary_status(
        db: &SurrealDbClient,
        id: &str,
        status: SummaryStatus,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id)
                 SET summary_status = $status, updated_at = $now
                 WHERE parse_status != $deleting",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("status", status.as_str()))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }

    /// Stores a generated summary as the description and marks the summary
    /// completed. Returns `None` when the row is gone or being deleted.
    pub async fn complete_summary(
        db: &SurrealDbClient,
        id: &str,
        description: &str,
    ) -> Result<Option<Knowledge>, AppError> {
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET description = $description,
                     summary_status = $completed,
                     updated_at = $now
                 WHERE parse_status != $deleting
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("description", description.to_string()))
            .bind(("completed", SummaryStatus::Completed.as_str()))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?;
        let updated: Option<Knowledge> = result.take(0)?;
        Ok(updated)
    }

    /// Final write of a successful processing run. Does nothing when the row
    /// is being deleted; returns whether the update applied.
    pub async fn mark_completed(
        db: &SurrealDbClient,
        id: &str,
        storage_size: i64,
        summary_status: SummaryStatus,
    ) -> Result<bool, AppError> {
        let now = SurrealDatetime::from(Utc::now());
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET parse_status = $completed,
                     enable_status = $enabled,
                     error_message = '',
                     storage_size = $storage_size,
                     summary_status = $summary_status,
                     processed_at = $now,
                     updated_at = $now
                 WHERE parse_status != $deleting
                 RETURN AFTER",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("completed", ParseStatus::Completed.as_str()))
            .bind(("enabled", EnableStatus::Enabled.as_str()))
            .bind(("storage_size", storage_size))
            .bind(("summary_status", summary_status.as_str()))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .bind(("now", now))
            .await?;
        let updated: Option<Knowledge> = result.take(0)?;
        Ok(updated.is_some())
    }

    /// Adds a signed delta to `storage_size`, clamped at zero.
    pub async fn adjust_storage_size(
        db: &SurrealDbClient,
        id: &str,
        delta: i64,
    ) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id)
                 SET storage_size = math::max([0, storage_size + $delta]),
                     processed_at = $now,
                     updated_at = $now",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("delta", delta))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn mark_processed(db: &SurrealDbClient, id: &str) -> Result<(), AppError> {
        db.client
            .query(
                "UPDATE type::thing($table, $id)
                 SET processed_at = $now, updated_at = $now",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", id.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }

    /// Marks every listed record `deleting`; in-flight processing observes the flag.
    pub async fn mark_deleting(db: &SurrealDbClient, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.client
            .query(
                "UPDATE knowledge SET parse_status = $deleting, updated_at = $now
                 WHERE id IN $ids",
            )
            .bind(("ids", record_ids(ids)))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;
        Ok(())
    }

    /// Cooperative cancellation check. A missing row, a failed read or a
    /// `deleting` status all count as being deleted.
    pub async fn is_deleting(db: &SurrealDbClient, id: &str) -> bool {
        match db.get_item::<Knowledge>(id).await {
            Ok(Some(knowledge)) => knowledge.parse_status == ParseStatus::Deleting,
            Ok(None) | Err(_) => true,
        }
    }

    pub async fn list_by_ids(
        db: &SurrealDbClient,
        tenant_id: u64,
        ids: &[String],
    ) -> Result<Vec<Knowledge>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let found: Vec<Knowledge> = db
            .query("SELECT * FROM knowledge WHERE id IN $ids AND tenant_id = $tenant_id")
            .bind(("ids", record_ids(ids)))
            .bind(("tenant_id", tenant_id))
            .await?
            .take(0)?;
        Ok(found)
    }

    pub async fn list_by_knowledge_base(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
    ) -> Result<Vec<Knowledge>, AppError> {
        let found: Vec<Knowledge> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND knowledge_base_id = $kb_id
                 ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .await?
            .take(0)?;
        Ok(found)
    }

    /// The single `faq` container of a FAQ knowledge base, if created yet.
    pub async fn find_faq_container(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
    ) -> Result<Option<Knowledge>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id
                   AND knowledge_base_id = $kb_id
                   AND knowledge_type = $faq
                 ORDER BY created_at ASC
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("faq", KnowledgeType::Faq.as_str()))
            .await?;
        let found: Option<Knowledge> = result.take(0)?;
        Ok(found)
    }

    /// Ids of document knowledge in scope `a` whose file hash has no match in scope `b`.
    /// Only live (`!= deleting`) rows take part on either side.
    pub async fn a_minus_b(
        db: &SurrealDbClient,
        a: (u64, &str),
        b: (u64, &str),
    ) -> Result<Vec<String>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM knowledge
                 WHERE tenant_id = $a_tenant AND knowledge_base_id = $a_kb
                   AND knowledge_type != $faq AND parse_status != $deleting
                 ORDER BY created_at ASC;
                 SELECT VALUE file_hash FROM knowledge
                 WHERE tenant_id = $b_tenant AND knowledge_base_id = $b_kb
                   AND knowledge_type != $faq AND parse_status != $deleting;",
            )
            .bind(("a_tenant", a.0))
            .bind(("a_kb", a.1.to_string()))
            .bind(("b_tenant", b.0))
            .bind(("b_kb", b.1.to_string()))
            .bind(("faq", KnowledgeType::Faq.as_str()))
            .bind(("deleting", ParseStatus::Deleting.as_str()))
            .await?;
        let left: Vec<Knowledge> = result.take(0)?;
        let right: Vec<String> = result.take(1)?;
        let right: HashSet<String> = right.into_iter().collect();

        Ok(left
            .into_iter()
            .filter(|k| !right.contains(&k.file_hash))
            .map(|k| k.id)
            .collect())
    }

    pub async fn delete_by_ids(db: &SurrealDbClient, ids: &[String]) -> Result<(), AppError> {
        if ids.is_empty() {
            return Ok(());
        }
        db.client
            .query("DELETE FROM knowledge WHERE id IN $ids")
            .bind(("ids", record_ids(ids)))
            .await?
            .check()?;
        Ok(())
    }
}

fn record_ids(ids: &[String]) -> Vec<surrealdb::RecordId> {
    ids.iter()
        .map(|id| surrealdb::RecordId::from_table_key(Knowledge::table_name(), id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    fn file_knowledge(kb: &str, hash: &str) -> Knowledge {
        let mut k = Knowledge::new(1, kb, KnowledgeType::File, "doc.pdf", "embed");
        k.file_name = "doc.pdf".into();
        k.file_size = 10;
        k.file_hash = hash.into();
        k
    }

    #[tokio::test]
    async fn duplicate_lookup_ignores_deleting_rows() {
        let db = memory_db().await;
        let stored = file_knowledge("kb", "h1").create(&db).await.expect("create");

        let found = Knowledge::find_duplicate_file(&db, 1, "kb", "doc.pdf", 10, "h1")
            .await
            .expect("query");
        assert_eq!(found.map(|k| k.id), Some(stored.id.clone()));

        Knowledge::mark_deleting(&db, std::slice::from_ref(&stored.id))
            .await
            .expect("mark");
        let found = Knowledge::find_duplicate_file(&db, 1, "kb", "doc.pdf", 10, "h1")
            .await
            .expect("query");
        assert!(found.is_none());
        assert!(Knowledge::is_deleting(&db, &stored.id).await);
        assert!(Knowledge::is_deleting(&db, "missing").await);
    }

    #[tokio::test]
    async fn status_updates_respect_deleting_barrier() {
        let db = memory_db().await;
        let stored = file_knowledge("kb", "h").create(&db).await.expect("create");

        let updated = Knowledge::update_parse_status(&db, &stored.id, ParseStatus::Processing, "")
            .await
            .expect("update");
        assert_eq!(
            updated.map(|k| k.parse_status),
            Some(ParseStatus::Processing)
        );

        Knowledge::mark_deleting(&db, std::slice::from_ref(&stored.id))
            .await
            .expect("mark");
        let updated = Knowledge::update_parse_status(&db, &stored.id, ParseStatus::Completed, "")
            .await
            .expect("update");
        assert!(updated.is_none());
        let current = Knowledge::get(&db, &stored.id).await.expect("get").expect("row");
        assert_eq!(current.parse_status, ParseStatus::Deleting);
    }

    #[tokio::test]
    async fn a_minus_b_compares_file_hashes() {
        let db = memory_db().await;
        let shared = file_knowledge("src", "same").create(&db).await.expect("a");
        let only_src = file_knowledge("src", "new").create(&db).await.expect("b");
        file_knowledge("dst", "same").create(&db).await.expect("c");
        let only_dst = file_knowledge("dst", "old").create(&db).await.expect("d");

        let to_add = Knowledge::a_minus_b(&db, (1, "src"), (1, "dst"))
            .await
            .expect("diff");
        assert_eq!(to_add, vec![only_src.id]);
        assert!(!to_add.contains(&shared.id));

        let to_delete = Knowledge::a_minus_b(&db, (1, "dst"), (1, "src"))
            .await
            .expect("diff");
        assert_eq!(to_delete, vec![only_dst.id]);
    }

    #[tokio::test]
    async fn storage_size_never_goes_negative() {
        let db = memory_db().await;
        let stored = file_knowledge("kb", "h").create(&db).await.expect("create");
        Knowledge::adjust_storage_size(&db, &stored.id, 50).await.expect("add");
        Knowledge::adjust_storage_size(&db, &stored.id, -80).await.expect("sub");
        let current = Knowledge::get(&db, &stored.id).await.expect("get").expect("row");
        assert_eq!(current.storage_size, 0);
        assert!(current.processed_at.is_some());
    }
}
