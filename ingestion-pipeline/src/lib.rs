#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod clone;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod enrichment;
pub mod faq;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod reader;
pub mod retrieval;
pub mod services;

#[cfg(test)]
mod test_support;

use chrono::Utc;
use common::storage::types::{
    background_task::{BackgroundTask, DEFAULT_LEASE_SECS},
    progress::ProgressEntry,
};
pub use config::{IngestionConfig, IngestionTuning};
pub use engine::KnowledgeEngine;
use std::sync::Arc;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Minimum time between sweeps of expired progress entries.
const PURGE_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub async fn run_worker_loop(
    engine: Arc<KnowledgeEngine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let worker_id = format!("knowledge-worker-{}", Uuid::new_v4());
    let lease_duration = Duration::from_secs(u64::try_from(DEFAULT_LEASE_SECS).unwrap_or(300));
    let idle_backoff = Duration::from_millis(500);
    let mut last_purge = Instant::now();

    loop {
        match BackgroundTask::claim_next_ready(engine.db(), &worker_id, Utc::now(), lease_duration)
            .await
        {
            Ok(Some(task)) => {
                let task_id = task.id.clone();
                info!(
                    %worker_id,
                    %task_id,
                    task_type = task.task_type.as_str(),
                    attempt = task.attempts,
                    "claimed background task"
                );
                if let Err(err) = engine.process_task(task).await {
                    error!(%worker_id, %task_id, error = %err, "background task failed");
                }
            }
            Ok(None) => {
                if last_purge.elapsed() >= PURGE_INTERVAL {
                    last_purge = Instant::now();
                    match ProgressEntry::purge_expired(engine.db()).await {
                        Ok(purged) => debug!(%worker_id, purged, "purged expired progress entries"),
                        Err(err) => warn!(%worker_id, error = %err, "failed to purge progress entries"),
                    }
                }
                sleep(idle_backoff).await;
            }
            Err(err) => {
                error!(%worker_id, error = %err, "failed to claim background task");
                warn!("Backing off for 1s after claim error");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
