use std::collections::HashSet;

use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

/// Name of the tag assigned when an entry names none.
pub const UNTAGGED_TAG_NAME: &str = "未分类";

stored_object!(KnowledgeTag, "knowledge_tag", {
    tenant_id: u64,
    knowledge_base_id: String,
    seq_id: i64,
    name: String,
    #[serde(default)]
    color: String,
    #[serde(default)]
    sort_order: i32
});

impl KnowledgeTag {
    pub fn new(tenant_id: u64, knowledge_base_id: &str, name: &str) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            tenant_id,
            knowledge_base_id: knowledge_base_id.to_string(),
            seq_id: 0,
            name: name.to_string(),
            color: String::new(),
            sort_order: if name == UNTAGGED_TAG_NAME { -1 } else { 0 },
        }
    }

    /// Stores the tag, allocating a seq id when none was set.
    pub async fn create(mut self, db: &SurrealDbClient) -> Result<KnowledgeTag, AppError> {
        if self.seq_id <= 0 {
            self.seq_id = db.next_sequence(Self::table_name(), 1).await?;
        }
        let stored = db.store_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("tag was not stored".into()))
    }

    pub async fn get_by_id(
        db: &SurrealDbClient,
        tenant_id: u64,
        id: &str,
    ) -> Result<Option<KnowledgeTag>, AppError> {
        if id.is_empty() {
            return Ok(None);
        }
        Ok(db
            .get_item::<KnowledgeTag>(id)
            .await?
            .filter(|tag| tag.tenant_id == tenant_id))
    }

    pub async fn get_by_seq_id(
        db: &SurrealDbClient,
        tenant_id: u64,
        seq_id: i64,
    ) -> Result<Option<KnowledgeTag>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND seq_id = $seq_id
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("seq_id", seq_id))
            .await?;
        let tag: Option<KnowledgeTag> = result.take(0)?;
        Ok(tag)
    }

    pub async fn find_by_name(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        name: &str,
    ) -> Result<Option<KnowledgeTag>, AppError> {
        let mut result = db
            .client
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND knowledge_base_id = $kb_id AND name = $name
                 ORDER BY seq_id ASC
                 LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .bind(("name", name.to_string()))
            .await?;
        let tag: Option<KnowledgeTag> = result.take(0)?;
        Ok(tag)
    }

    pub async fn find_or_create_by_name(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
        name: &str,
    ) -> Result<KnowledgeTag, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Validation("tag name cannot be empty".into()));
        }
        if let Some(existing) = Self::find_by_name(db, tenant_id, knowledge_base_id, name).await? {
            return Ok(existing);
        }
        match Self::new(tenant_id, knowledge_base_id, name).create(db).await {
            Ok(tag) => Ok(tag),
            // A concurrent caller won the unique name index.
            Err(err) => Self::find_by_name(db, tenant_id, knowledge_base_id, name)
                .await?
                .ok_or(err),
        }
    }

    pub async fn list_by_knowledge_base(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
    ) -> Result<Vec<KnowledgeTag>, AppError> {
        let tags: Vec<KnowledgeTag> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE tenant_id = $tenant_id AND knowledge_base_id = $kb_id
                 ORDER BY sort_order ASC, seq_id ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("tenant_id", tenant_id))
            .bind(("kb_id", knowledge_base_id.to_string()))
            .await?
            .take(0)?;
        Ok(tags)
    }

    /// Removes tags that no chunk or knowledge in the base references.
    /// Returns how many tags were deleted.
    pub async fn delete_unused(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_base_id: &str,
    ) -> Result<usize, AppError> {
        let tags = Self::list_by_knowledge_base(db, tenant_id, knowledge_base_id).await?;
        if tags.is_empty() {
            return Ok(0);
        }

        let mut result = db
            .client
            .query(
                "SELECT VALUE tag_id FROM chunk WHERE knowledge_base_id = $kb_id AND tag_id != '';
                 SELECT VALUE tag_id FROM knowledge WHERE knowledge_base_id = $kb_id AND tag_id != '';",
            )
            .bind(("kb_id", knowledge_base_id.to_string()))
            .await?;
        let chunk_tags: Vec<String> = result.take(0)?;
        let knowledge_tags: Vec<String> = result.take(1)?;
        let referenced: HashSet<String> = chunk_tags.into_iter().chain(knowledge_tags).collect();

        let unused: Vec<_> = tags
            .into_iter()
            .filter(|tag| !referenced.contains(&tag.id))
            .map(|tag| surrealdb::RecordId::from_table_key(Self::table_name(), tag.id))
            .collect();
        if unused.is_empty() {
            return Ok(0);
        }

        db.client
            .query("DELETE FROM knowledge_tag WHERE id IN $ids")
            .bind(("ids", unused.clone()))
            .await?
            .check()?;
        Ok(unused.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> SurrealDbClient {
        SurrealDbClient::memory("test_ns", &Uuid::new_v4().to_string())
            .await
            .expect("in-memory surrealdb")
    }

    #[tokio::test]
    async fn find_or_create_reuses_existing_tag() {
        let db = memory_db().await;
        let first = KnowledgeTag::find_or_create_by_name(&db, 1, "kb", "Billing")
            .await
            .expect("create");
        let second = KnowledgeTag::find_or_create_by_name(&db, 1, "kb", " Billing ")
            .await
            .expect("find");
        assert_eq!(first.id, second.id);
        assert!(first.seq_id > 0);

        let by_seq = KnowledgeTag::get_by_seq_id(&db, 1, first.seq_id)
            .await
            .expect("query")
            .expect("tag");
        assert_eq!(by_seq.name, "Billing");

        let untagged = KnowledgeTag::find_or_create_by_name(&db, 1, "kb", UNTAGGED_TAG_NAME)
            .await
            .expect("untagged");
        assert_eq!(untagged.sort_order, -1);
    }

    #[tokio::test]
    async fn concurrent_find_or_create_yields_one_tag() {
        let db = memory_db().await;
        db.build_indexes().await.expect("indexes");

        let attempts = (0..8).map(|_| KnowledgeTag::find_or_create_by_name(&db, 1, "kb", "Shared"));
        let tags = futures::future::join_all(attempts).await;

        let ids: HashSet<String> = tags
            .into_iter()
            .map(|tag| tag.expect("find or create").id)
            .collect();
        assert_eq!(ids.len(), 1);
        let stored = KnowledgeTag::list_by_knowledge_base(&db, 1, "kb")
            .await
            .expect("list");
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn delete_unused_keeps_referenced_tags() {
        let db = memory_db().await;
        let used = KnowledgeTag::find_or_create_by_name(&db, 1, "kb", "used")
            .await
            .expect("used");
        KnowledgeTag::find_or_create_by_name(&db, 1, "kb", "idle")
            .await
            .expect("idle");

        db.client
            .query("CREATE chunk SET knowledge_base_id = 'kb', tag_id = $tag")
            .bind(("tag", used.id.clone()))
            .await
            .expect("chunk");

        let removed = KnowledgeTag::delete_unused(&db, 1, "kb").await.expect("delete");
        assert_eq!(removed, 1);

        let remaining = KnowledgeTag::list_by_knowledge_base(&db, 1, "kb")
            .await
            .expect("list");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, used.id);
    }
}
