//! TTL-bounded key/value records for long-running task progress and the
//! per-knowledge-base FAQ import lock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::faq::{FaqFailedEntry, FaqImportMode, FaqSuccessEntry};

pub const FAQ_PROGRESS_TTL: Duration = Duration::from_secs(3 * 60 * 60);
pub const KB_CLONE_PROGRESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn faq_import_progress_key(task_id: &str) -> String {
    format!("faq_import_progress:{task_id}")
}

pub fn faq_import_running_key(kb_id: &str) -> String {
    format!("faq_import_running:{kb_id}")
}

pub fn kb_clone_progress_key(task_id: &str) -> String {
    format!("kb_clone_progress:{task_id}")
}

stored_object!(ProgressEntry, "progress_entry", {
    /// JSON encoded value.
    value: String,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_datetime"
    )]
    expires_at: DateTime<Utc>
});

impl ProgressEntry {
    fn expiry(ttl: Duration) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(24))
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub async fn set<T: Serialize>(
        db: &SurrealDbClient,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let encoded = serde_json::to_string(value)?;
        let now = Utc::now();
        db.client
            .query(
                "UPSERT type::thing($table, $key)
                 SET value = $value,
                     expires_at = $expires_at,
                     created_at = created_at OR $now,
                     updated_at = $now",
            )
            .bind(("table", Self::table_name()))
            .bind(("key", key.to_string()))
            .bind(("value", encoded))
            .bind(("expires_at", SurrealDatetime::from(Self::expiry(ttl))))
            .bind(("now", SurrealDatetime::from(now)))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(
        db: &SurrealDbClient,
        key: &str,
    ) -> Result<Option<T>, AppError> {
        let Some(entry) = db.get_item::<ProgressEntry>(key).await? else {
            return Ok(None);
        };
        if entry.is_expired() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&entry.value)?))
    }

    pub async fn delete(db: &SurrealDbClient, key: &str) -> Result<(), AppError> {
        db.delete_item::<ProgressEntry>(key).await?;
        Ok(())
    }

    /// Stores `value` only when no live entry exists under `key`.
    /// Returns whether the value was written.
    pub async fn set_nx<T: Serialize>(
        db: &SurrealDbClient,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<bool, AppError> {
        db.client
            .query("DELETE type::thing($table, $key) WHERE expires_at <= $now")
            .bind(("table", Self::table_name()))
            .bind(("key", key.to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .check()?;

        let now = Utc::now();
        let entry = ProgressEntry {
            id: key.to_string(),
            created_at: now,
            updated_at: now,
            value: serde_json::to_string(value)?,
            expires_at: Self::expiry(ttl),
        };

        match db.store_item(entry).await {
            Ok(_) => Ok(true),
            Err(err) => {
                let live = db
                    .get_item::<ProgressEntry>(key)
                    .await?
                    .is_some_and(|existing| !existing.is_expired());
                if live {
                    debug!(%key, "progress key already held");
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Drops every expired entry. Returns the number removed.
    pub async fn purge_expired(db: &SurrealDbClient) -> Result<usize, AppError> {
        let removed: Vec<ProgressEntry> = db
            .query("DELETE FROM type::table($table) WHERE expires_at <= $now RETURN BEFORE")
            .bind(("table", Self::table_name()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .await?
            .take(0)?;
        Ok(removed.len())
    }
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FaqImportStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FaqImportProgress {
    pub task_id: String,
    pub kb_id: String,
    pub knowledge_id: String,
    pub status: FaqImportStatus,
    /// Percentage, 0..=100.
    pub progress: u32,
    pub total: usize,
    pub processed: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub failed_entries: Vec<FaqFailedEntry>,
    pub success_entries: Vec<FaqSuccessEntry>,
    pub failed_entries_url: String,
    /// Indices into the submitted entries that passed validation; set once
    /// validation finished so retries skip it.
    pub valid_entry_indices: Option<Vec<usize>>,
    pub message: String,
    pub error: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub dry_run: bool,
    pub import_mode: Option<FaqImportMode>,
    pub imported_at: Option<DateTime<Utc>>,
    pub display_status: String,
    pub processing_time_ms: i64,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KbCloneStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KbCloneProgress {
    pub task_id: String,
    pub source_id: String,
    pub target_id: String,
    pub status: KbCloneStatus,
    pub progress: u32,
    pub total: usize,
    pub processed: usize,
    pub message: String,
    pub error: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Value stored under the FAQ running key while an import owns the base.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunningImportInfo {
    pub task_id: String,
    pub enqueued_at: i64,
}
