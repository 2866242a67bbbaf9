use surrealdb::sql::Datetime as SurrealDatetime;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Tenant, "tenant", {
    name: String,
    /// Bytes; zero means unlimited.
    #[serde(default)]
    storage_quota: i64,
    #[serde(default)]
    storage_used: i64
});

impl Tenant {
    pub fn new(tenant_id: u64, name: impl Into<String>, storage_quota: i64) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: tenant_id.to_string(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            storage_quota,
            storage_used: 0,
        }
    }

    pub async fn get(db: &SurrealDbClient, tenant_id: u64) -> Result<Tenant, AppError> {
        db.get_item::<Tenant>(&tenant_id.to_string())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("tenant {tenant_id} not found")))
    }

    pub fn is_unlimited(&self) -> bool {
        self.storage_quota <= 0
    }

    /// True when the tenant has already used up its whole quota.
    pub fn is_quota_exhausted(&self) -> bool {
        !self.is_unlimited() && self.storage_used >= self.storage_quota
    }

    /// True when adding `size` bytes would go beyond the quota.
    pub fn would_exceed(&self, size: i64) -> bool {
        !self.is_unlimited() && self.storage_used.saturating_add(size) > self.storage_quota
    }

    /// Applies a signed delta to `storage_used` in a single statement, clamped at zero.
    /// A missing tenant row is created with an unlimited quota.
    pub async fn adjust_storage_used(
        db: &SurrealDbClient,
        tenant_id: u64,
        delta: i64,
    ) -> Result<(), AppError> {
        if delta == 0 {
            return Ok(());
        }

        db.client
            .query(
                "UPSERT type::thing($table, $id)
                 SET storage_used = math::max([0, (storage_used OR 0) + $delta]),
                     storage_quota = storage_quota OR 0,
                     name = name OR '',
                     created_at = created_at OR $now,
                     updated_at = $now",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", tenant_id.to_string()))
            .bind(("delta", delta))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .await?
            .check()?;
        Ok(())
    }
}
