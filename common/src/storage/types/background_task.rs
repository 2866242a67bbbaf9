use std::time::Duration;

use chrono::Duration as ChronoDuration;
use state_machines::state_machine;
use surrealdb::sql::Datetime as SurrealDatetime;
use tracing::debug;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::task_payloads::{TaskPayload, TaskQueue, TaskType};

/// Three retries after the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_LEASE_SECS: i64 = 300;

#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum TaskState {
    #[serde(rename = "Pending")]
    #[default]
    Pending,
    #[serde(rename = "Reserved")]
    Reserved,
    #[serde(rename = "Processing")]
    Processing,
    #[serde(rename = "Succeeded")]
    Succeeded,
    #[serde(rename = "Failed")]
    Failed,
    #[serde(rename = "Cancelled")]
    Cancelled,
    #[serde(rename = "DeadLetter")]
    DeadLetter,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "Pending",
            TaskState::Reserved => "Reserved",
            TaskState::Processing => "Processing",
            TaskState::Succeeded => "Succeeded",
            TaskState::Failed => "Failed",
            TaskState::Cancelled => "Cancelled",
            TaskState::DeadLetter => "DeadLetter",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq, Default)]
pub struct TaskErrorInfo {
    pub code: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
enum TaskTransition {
    Reserve,
    StartProcessing,
    Succeed,
    Fail,
    Cancel,
    DeadLetter,
}

impl TaskTransition {
    fn as_str(&self) -> &'static str {
        match self {
            TaskTransition::Reserve => "reserve",
            TaskTransition::StartProcessing => "start_processing",
            TaskTransition::Succeed => "succeed",
            TaskTransition::Fail => "fail",
            TaskTransition::Cancel => "cancel",
            TaskTransition::DeadLetter => "deadletter",
        }
    }
}

mod lifecycle {
    use super::state_machine;

    state_machine! {
        name: TaskLifecycleMachine,
        initial: Pending,
        states: [Pending, Reserved, Processing, Succeeded, Failed, Cancelled, DeadLetter],
        events {
            reserve {
                transition: { from: Pending, to: Reserved }
                transition: { from: Failed, to: Reserved }
            }
            start_processing {
                transition: { from: Reserved, to: Processing }
            }
            succeed {
                transition: { from: Processing, to: Succeeded }
            }
            fail {
                transition: { from: Processing, to: Failed }
            }
            cancel {
                transition: { from: Pending, to: Cancelled }
                transition: { from: Failed, to: Cancelled }
            }
            deadletter {
                transition: { from: Failed, to: DeadLetter }
            }
        }
    }

    pub(super) fn pending() -> TaskLifecycleMachine<(), Pending> {
        TaskLifecycleMachine::new(())
    }

    pub(super) fn reserved() -> TaskLifecycleMachine<(), Reserved> {
        pending()
            .reserve()
            .expect("reserve transition from Pending should exist")
    }

    pub(super) fn processing() -> TaskLifecycleMachine<(), Processing> {
        reserved()
            .start_processing()
            .expect("start_processing transition from Reserved should exist")
    }

    pub(super) fn failed() -> TaskLifecycleMachine<(), Failed> {
        processing()
            .fail()
            .expect("fail transition from Processing should exist")
    }
}

fn invalid_transition(state: &TaskState, event: TaskTransition) -> AppError {
    AppError::Validation(format!(
        "Invalid task transition: {} -> {}",
        state.as_str(),
        event.as_str()
    ))
}

fn compute_next_state(state: &TaskState, event: TaskTransition) -> Result<TaskState, AppError> {
    use lifecycle::*;
    match (state, event) {
        (TaskState::Pending, TaskTransition::Reserve) => pending()
            .reserve()
            .map(|_| TaskState::Reserved)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::Reserve) => failed()
            .reserve()
            .map(|_| TaskState::Reserved)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Reserved, TaskTransition::StartProcessing) => reserved()
            .start_processing()
            .map(|_| TaskState::Processing)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Succeed) => processing()
            .succeed()
            .map(|_| TaskState::Succeeded)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Processing, TaskTransition::Fail) => processing()
            .fail()
            .map(|_| TaskState::Failed)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Pending, TaskTransition::Cancel) => pending()
            .cancel()
            .map(|_| TaskState::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::Cancel) => failed()
            .cancel()
            .map(|_| TaskState::Cancelled)
            .map_err(|_| invalid_transition(state, event)),
        (TaskState::Failed, TaskTransition::DeadLetter) => failed()
            .deadletter()
            .map(|_| TaskState::DeadLetter)
            .map_err(|_| invalid_transition(state, event)),
        _ => Err(invalid_transition(state, event)),
    }
}

stored_object!(BackgroundTask, "background_task", {
    payload: TaskPayload,
    task_type: TaskType,
    queue: TaskQueue,
    state: TaskState,
    tenant_id: u64,
    attempts: u32,
    max_attempts: u32,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_datetime"
    )]
    scheduled_at: chrono::DateTime<chrono::Utc>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    lease_duration_secs: i64,
    worker_id: Option<String>,
    error_code: Option<String>,
    error_message: Option<String>,
    #[serde(
        serialize_with = "crate::storage::types::serde_helpers::serialize_option_datetime",
        deserialize_with = "crate::storage::types::serde_helpers::deserialize_option_datetime",
        default
    )]
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    priority: i32,
    #[serde(default)]
    dedup_key: Option<String>
});

impl BackgroundTask {
    pub fn new(payload: TaskPayload) -> Self {
        let now = chrono::Utc::now();
        let task_type = payload.task_type();
        let queue = task_type.default_queue();

        Self {
            id: Uuid::new_v4().to_string(),
            tenant_id: payload.tenant_id(),
            payload,
            task_type,
            queue,
            state: TaskState::Pending,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            scheduled_at: now,
            locked_at: None,
            lease_duration_secs: DEFAULT_LEASE_SECS,
            worker_id: None,
            error_code: None,
            error_message: None,
            last_error_at: None,
            priority: queue.priority(),
            dedup_key: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Caps the number of retries; total attempts become `max_retry + 1`.
    #[must_use]
    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_attempts = max_retry.saturating_add(1);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: TaskQueue) -> Self {
        self.queue = queue;
        self.priority = queue.priority();
        self
    }

    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Retries already consumed before the current attempt.
    pub fn retry_count(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn max_retry(&self) -> u32 {
        self.max_attempts.saturating_sub(1)
    }

    /// Handlers only write terminal failure state on the final attempt.
    pub fn is_last_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.lease_duration_secs).unwrap_or(0))
    }

    /// Persists the task. When a live task with the same `dedup_key` exists it is
    /// returned instead and nothing new is stored.
    pub async fn enqueue(self, db: &SurrealDbClient) -> Result<BackgroundTask, AppError> {
        if let Some(key) = self.dedup_key.as_deref() {
            let mut result = db
                .client
                .query(
                    "SELECT * FROM type::table($table)
                     WHERE dedup_key = $key AND state NOTINSIDE $terminal
                     LIMIT 1",
                )
                .bind(("table", Self::table_name()))
                .bind(("key", key.to_string()))
                .bind((
                    "terminal",
                    vec![
                        TaskState::Succeeded.as_str(),
                        TaskState::Cancelled.as_str(),
                        TaskState::DeadLetter.as_str(),
                    ],
                ))
                .await?;
            let existing: Option<BackgroundTask> = result.take(0)?;
            if let Some(existing) = existing {
                debug!(task_id = %existing.id, dedup_key = %key, "task already enqueued");
                return Ok(existing);
            }
        }

        let stored = db.store_item(self).await?;
        stored.ok_or_else(|| AppError::InternalError("task was not stored".into()))
    }

    pub async fn claim_next_ready(
        db: &SurrealDbClient,
        worker_id: &str,
        now: chrono::DateTime<chrono::Utc>,
        lease_duration: Duration,
    ) -> Result<Option<BackgroundTask>, AppError> {
        debug_assert!(compute_next_state(&TaskState::Pending, TaskTransition::Reserve).is_ok());
        debug_assert!(compute_next_state(&TaskState::Failed, TaskTransition::Reserve).is_ok());

        const CLAIM_QUERY: &str = r#"
            UPDATE (
                SELECT * FROM type::table($table)
                WHERE state IN $candidate_states
                  AND scheduled_at <= $now
                  AND (
                        attempts < max_attempts
                        OR state IN $sticky_states
                  )
                  AND (
                        locked_at = NONE
                        OR time::unix($now) - time::unix(locked_at) >= lease_duration_secs
                  )
                ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                LIMIT 1
            )
            SET attempts = if state IN $increment_states THEN
                    if attempts + 1 > max_attempts THEN max_attempts ELSE attempts + 1 END
                ELSE
                    attempts
                END,
                state = $reserved_state,
                locked_at = $now,
                worker_id = $worker_id,
                lease_duration_secs = $lease_secs,
                updated_at = $now
            RETURN *;
        "#;

        let mut result = db
            .client
            .query(CLAIM_QUERY)
            .bind(("table", Self::table_name()))
            .bind((
                "candidate_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Failed.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                ],
            ))
            .bind((
                "sticky_states",
                vec![TaskState::Reserved.as_str(), TaskState::Processing.as_str()],
            ))
            .bind((
                "increment_states",
                vec![TaskState::Pending.as_str(), TaskState::Failed.as_str()],
            ))
            .bind(("reserved_state", TaskState::Reserved.as_str()))
            .bind(("now", SurrealDatetime::from(now)))
            .bind(("worker_id", worker_id.to_string()))
            .bind((
                "lease_secs",
                i64::try_from(lease_duration.as_secs()).unwrap_or(DEFAULT_LEASE_SECS),
            ))
            .await?;

        let task: Option<BackgroundTask> = result.take(0)?;
        Ok(task)
    }

    pub async fn mark_processing(&self, db: &SurrealDbClient) -> Result<BackgroundTask, AppError> {
        let now = chrono::Utc::now();
        self.transition(
            db,
            TaskTransition::StartProcessing,
            StateChange {
                locked_at: Some(now),
                worker_id: self.worker_id.clone(),
                scheduled_at: self.scheduled_at,
                error: self.error_info(),
                last_error_at: self.last_error_at,
                owned: true,
            },
        )
        .await
    }

    pub async fn mark_succeeded(&self, db: &SurrealDbClient) -> Result<BackgroundTask, AppError> {
        self.transition(
            db,
            TaskTransition::Succeed,
            StateChange::released(chrono::Utc::now(), true),
        )
        .await
    }

    /// Records a failed attempt and schedules the next one `retry_delay` from now.
    pub async fn mark_failed(
        &self,
        error: TaskErrorInfo,
        retry_delay: Duration,
        db: &SurrealDbClient,
    ) -> Result<BackgroundTask, AppError> {
        let now = chrono::Utc::now();
        let retry_at = now
            + ChronoDuration::from_std(retry_delay).unwrap_or_else(|_| ChronoDuration::seconds(30));
        self.transition(
            db,
            TaskTransition::Fail,
            StateChange {
                scheduled_at: retry_at,
                ..StateChange::released(now, true).with_error(error, now)
            },
        )
        .await
    }

    pub async fn mark_dead_letter(
        &self,
        error: TaskErrorInfo,
        db: &SurrealDbClient,
    ) -> Result<BackgroundTask, AppError> {
        let now = chrono::Utc::now();
        self.transition(
            db,
            TaskTransition::DeadLetter,
            StateChange::released(now, false).with_error(error, now),
        )
        .await
    }

    /// Withdraws a task no worker holds, so it is never claimed again.
    pub async fn mark_cancelled(&self, db: &SurrealDbClient) -> Result<BackgroundTask, AppError> {
        let now = chrono::Utc::now();
        self.transition(
            db,
            TaskTransition::Cancel,
            StateChange {
                scheduled_at: self.scheduled_at,
                error: self.error_info(),
                last_error_at: self.last_error_at,
                ..StateChange::released(now, false)
            },
        )
        .await
    }

    async fn transition(
        &self,
        db: &SurrealDbClient,
        event: TaskTransition,
        change: StateChange,
    ) -> Result<BackgroundTask, AppError> {
        let next = compute_next_state(&self.state, event)?;

        const TRANSITION_QUERY: &str = r#"
            UPDATE type::thing($table, $id)
            SET state = $next,
                updated_at = $now,
                locked_at = $locked_at,
                worker_id = $next_worker,
                scheduled_at = $scheduled_at,
                error_code = $error_code,
                error_message = $error_message,
                last_error_at = $last_error_at
            WHERE state = $current AND ($owned = false OR worker_id = $owner)
            RETURN AFTER;
        "#;

        let (error_code, error_message) = match change.error {
            Some(info) => (info.code, Some(info.message)),
            None => (None, None),
        };
        let mut result = db
            .client
            .query(TRANSITION_QUERY)
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("next", next.as_str()))
            .bind(("current", self.state.as_str()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .bind(("locked_at", change.locked_at.map(SurrealDatetime::from)))
            .bind(("next_worker", change.worker_id))
            .bind(("scheduled_at", SurrealDatetime::from(change.scheduled_at)))
            .bind(("error_code", error_code))
            .bind(("error_message", error_message))
            .bind(("last_error_at", change.last_error_at.map(SurrealDatetime::from)))
            .bind(("owned", change.owned))
            .bind(("owner", self.worker_id.clone().unwrap_or_default()))
            .await?;

        let updated: Option<BackgroundTask> = result.take(0)?;
        updated.ok_or_else(|| invalid_transition(&self.state, event))
    }

    fn error_info(&self) -> Option<TaskErrorInfo> {
        self.error_message.as_ref().map(|message| TaskErrorInfo {
            code: self.error_code.clone(),
            message: message.clone(),
        })
    }

    /// Pushes the lease of a task this worker is processing forward to `now`.
    /// Returns false once the task is no longer held by this worker.
    pub async fn renew_lease(&self, db: &SurrealDbClient) -> Result<bool, AppError> {
        let mut result = db
            .client
            .query(
                "UPDATE type::thing($table, $id)
                 SET locked_at = $now, updated_at = $now
                 WHERE state = $processing AND worker_id = $owner
                 RETURN AFTER;",
            )
            .bind(("table", Self::table_name()))
            .bind(("id", self.id.clone()))
            .bind(("now", SurrealDatetime::from(chrono::Utc::now())))
            .bind(("processing", TaskState::Processing.as_str()))
            .bind(("owner", self.worker_id.clone().unwrap_or_default()))
            .await?;
        let renewed: Option<BackgroundTask> = result.take(0)?;
        Ok(renewed.is_some())
    }

    pub async fn list_unfinished(db: &SurrealDbClient) -> Result<Vec<BackgroundTask>, AppError> {
        let tasks: Vec<BackgroundTask> = db
            .query(
                "SELECT * FROM type::table($table)
                 WHERE state IN $active_states
                 ORDER BY priority DESC, scheduled_at ASC, created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind((
                "active_states",
                vec![
                    TaskState::Pending.as_str(),
                    TaskState::Reserved.as_str(),
                    TaskState::Processing.as_str(),
                    TaskState::Failed.as_str(),
                ],
            ))
            .await?
            .take(0)?;

        Ok(tasks)
    }

    /// Cancels queued tasks of `tenant_id` that target any of `knowledge_ids`.
    /// Tasks a worker already holds are left to notice the deletion themselves.
    pub async fn cancel_queued_for_knowledge(
        db: &SurrealDbClient,
        tenant_id: u64,
        knowledge_ids: &[String],
    ) -> Result<usize, AppError> {
        let mut cancelled = 0_usize;
        for task in Self::list_unfinished(db).await? {
            let targeted = task.tenant_id == tenant_id
                && matches!(task.state, TaskState::Pending | TaskState::Failed)
                && task
                    .payload
                    .knowledge_id()
                    .is_some_and(|id| knowledge_ids.iter().any(|k| k == id));
            if !targeted {
                continue;
            }
            match task.mark_cancelled(db).await {
                Ok(_) => cancelled = cancelled.saturating_add(1),
                // claimed in the meantime
                Err(AppError::Validation(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(cancelled)
    }
}

/// Column values written together with a state change.
struct StateChange {
    locked_at: Option<chrono::DateTime<chrono::Utc>>,
    worker_id: Option<String>,
    scheduled_at: chrono::DateTime<chrono::Utc>,
    error: Option<TaskErrorInfo>,
    last_error_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Only the worker holding the task may apply the change.
    owned: bool,
}

impl StateChange {
    fn released(now: chrono::DateTime<chrono::Utc>, owned: bool) -> Self {
        Self {
            locked_at: None,
            worker_id: None,
            scheduled_at: now,
            error: None,
            last_error_at: None,
            owned,
        }
    }

    fn with_error(mut self, error: TaskErrorInfo, at: chrono::DateTime<chrono::Utc>) -> Self {
        self.error = Some(error);
        self.last_error_at = Some(at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::task_payloads::{
        DocumentProcessPayload, KnowledgeListDeletePayload, SummaryGenerationPayload,
    };

    fn delete_payload() -> TaskPayload {
        TaskPayload::KnowledgeListDelete(KnowledgeListDeletePayload {
            tenant_id: 1,
            knowledge_ids: vec!["k1".into()],
        })
    }

    fn summary_payload() -> TaskPayload {
        TaskPayload::SummaryGeneration(SummaryGenerationPayload {
            tenant_id: 1,
            knowledge_base_id: "kb".into(),
            knowledge_id: "k1".into(),
        })
    }

    async fn memory_db() -> SurrealDbClient {
        let namespace = "test_ns";
        let database = Uuid::new_v4().to_string();
        SurrealDbClient::memory(namespace, &database)
            .await
            .expect("in-memory surrealdb")
    }

    #[tokio::test]
    async fn test_new_task_defaults() {
        let task = BackgroundTask::new(delete_payload());

        assert_eq!(task.tenant_id, 1);
        assert_eq!(task.task_type, TaskType::KnowledgeListDelete);
        assert_eq!(task.queue, TaskQueue::Default);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(task.max_retry(), 3);
        assert!(task.locked_at.is_none());

        let limited = BackgroundTask::new(delete_payload()).with_max_retry(5);
        assert_eq!(limited.max_attempts, 6);
    }

    #[tokio::test]
    async fn test_enqueue_deduplicates_live_tasks() {
        let db = memory_db().await;

        let first = BackgroundTask::new(delete_payload())
            .with_dedup_key("task-1:100")
            .enqueue(&db)
            .await
            .expect("enqueue");
        let second = BackgroundTask::new(delete_payload())
            .with_dedup_key("task-1:100")
            .enqueue(&db)
            .await
            .expect("enqueue again");
        assert_eq!(first.id, second.id);

        let live = BackgroundTask::list_unfinished(&db).await.expect("list");
        assert_eq!(live.len(), 1);

        let other = BackgroundTask::new(delete_payload())
            .with_dedup_key("task-1:200")
            .enqueue(&db)
            .await
            .expect("enqueue other");
        assert_ne!(other.id, first.id);
    }

    #[tokio::test]
    async fn test_claim_prefers_default_queue() {
        let db = memory_db().await;
        let low = BackgroundTask::new(summary_payload())
            .enqueue(&db)
            .await
            .expect("low");
        let default = BackgroundTask::new(delete_payload())
            .enqueue(&db)
            .await
            .expect("default");
        assert_eq!(low.queue, TaskQueue::Low);

        let now = chrono::Utc::now();
        let claimed = BackgroundTask::claim_next_ready(&db, "w", now, Duration::from_secs(60))
            .await
            .expect("claim")
            .expect("claimed");
        assert_eq!(claimed.id, default.id);
    }

    #[tokio::test]
    async fn test_claim_and_transition() {
        let db = memory_db().await;
        let task = BackgroundTask::new(delete_payload());
        db.store_item(task.clone()).await.expect("store");

        let worker_id = "worker-1";
        let now = chrono::Utc::now();
        let claimed =
            BackgroundTask::claim_next_ready(&db, worker_id, now, Duration::from_secs(60))
                .await
                .expect("claim")
                .expect("task claimed");
        assert_eq!(claimed.state, TaskState::Reserved);
        assert_eq!(claimed.attempts, 1);
        assert_eq!(claimed.retry_count(), 0);
        assert_eq!(claimed.worker_id.as_deref(), Some(worker_id));

        let processing = claimed.mark_processing(&db).await.expect("processing");
        assert_eq!(processing.state, TaskState::Processing);

        let succeeded = processing.mark_succeeded(&db).await.expect("succeeded");
        assert_eq!(succeeded.state, TaskState::Succeeded);
        assert!(succeeded.worker_id.is_none());
        assert!(succeeded.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_fail_and_dead_letter() {
        let db = memory_db().await;
        let task = BackgroundTask::new(delete_payload());
        db.store_item(task.clone()).await.expect("store");

        let now = chrono::Utc::now();
        let claimed =
            BackgroundTask::claim_next_ready(&db, "worker-dead", now, Duration::from_secs(60))
                .await
                .expect("claim")
                .expect("claimed");
        let processing = claimed.mark_processing(&db).await.expect("processing");

        let error_info = TaskErrorInfo {
            code: Some("pipeline_error".into()),
            message: "failed".into(),
        };

        let failed = processing
            .mark_failed(error_info.clone(), Duration::from_secs(30), &db)
            .await
            .expect("failed update");
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("failed"));
        assert!(failed.scheduled_at > now);

        let dead = failed
            .mark_dead_letter(error_info, &db)
            .await
            .expect("dead letter");
        assert_eq!(dead.state, TaskState::DeadLetter);
    }

    fn document_payload(knowledge_id: &str) -> TaskPayload {
        TaskPayload::DocumentProcess(DocumentProcessPayload {
            tenant_id: 1,
            knowledge_id: knowledge_id.into(),
            knowledge_base_id: "kb".into(),
            ..DocumentProcessPayload::default()
        })
    }

    async fn claim(db: &SurrealDbClient, worker: &str) -> Option<BackgroundTask> {
        BackgroundTask::claim_next_ready(db, worker, chrono::Utc::now(), Duration::from_secs(60))
            .await
            .expect("claim")
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_ceiling() {
        let db = memory_db().await;
        BackgroundTask::new(delete_payload())
            .with_max_retry(2)
            .enqueue(&db)
            .await
            .expect("enqueue");
        let error = TaskErrorInfo {
            code: Some("internal".into()),
            message: "index unavailable".into(),
        };

        let mut last = None;
        for attempt in 1..=3_u32 {
            let claimed = claim(&db, "worker-retry").await.expect("claimable");
            assert_eq!(claimed.attempts, attempt);
            assert_eq!(claimed.is_last_attempt(), attempt == 3);
            let processing = claimed.mark_processing(&db).await.expect("processing");
            last = Some(
                processing
                    .mark_failed(error.clone(), Duration::ZERO, &db)
                    .await
                    .expect("failed"),
            );
        }

        let failed = last.expect("three attempts ran");
        assert!(!failed.can_retry());
        assert!(claim(&db, "worker-retry").await.is_none());
        let dead = failed.mark_dead_letter(error, &db).await.expect("dead letter");
        assert_eq!(dead.state, TaskState::DeadLetter);
        assert_eq!(dead.attempts, 3);
    }

    #[tokio::test]
    async fn lease_renewal_requires_the_holding_worker() {
        let db = memory_db().await;
        BackgroundTask::new(delete_payload())
            .enqueue(&db)
            .await
            .expect("enqueue");
        let processing = claim(&db, "worker-a")
            .await
            .expect("claimed")
            .mark_processing(&db)
            .await
            .expect("processing");
        let first_lock = processing.locked_at.expect("locked");

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(processing.renew_lease(&db).await.expect("renew"));
        let renewed: BackgroundTask = db
            .get_item(&processing.id)
            .await
            .expect("load")
            .expect("row");
        assert!(renewed.locked_at.expect("locked") > first_lock);

        let stranger = BackgroundTask {
            worker_id: Some("worker-b".into()),
            ..processing.clone()
        };
        assert!(!stranger.renew_lease(&db).await.expect("renew"));

        processing.mark_succeeded(&db).await.expect("succeeded");
        assert!(!processing.renew_lease(&db).await.expect("renew"));
    }

    #[tokio::test]
    async fn queued_tasks_of_deleted_knowledge_are_cancelled() {
        let db = memory_db().await;
        let doomed = BackgroundTask::new(document_payload("k1"))
            .enqueue(&db)
            .await
            .expect("enqueue");
        let kept = BackgroundTask::new(document_payload("k2"))
            .enqueue(&db)
            .await
            .expect("enqueue");
        let foreign = BackgroundTask::new(TaskPayload::DocumentProcess(DocumentProcessPayload {
            tenant_id: 2,
            knowledge_id: "k1".into(),
            ..DocumentProcessPayload::default()
        }))
        .enqueue(&db)
        .await
        .expect("enqueue");

        let cancelled = BackgroundTask::cancel_queued_for_knowledge(&db, 1, &["k1".into()])
            .await
            .expect("cancel");
        assert_eq!(cancelled, 1);

        let live: Vec<String> = BackgroundTask::list_unfinished(&db)
            .await
            .expect("list")
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert!(!live.contains(&doomed.id));
        assert!(live.contains(&kept.id));
        assert!(live.contains(&foreign.id));

        let stored: BackgroundTask = db.get_item(&doomed.id).await.expect("load").expect("row");
        assert_eq!(stored.state, TaskState::Cancelled);
        assert!(stored.mark_cancelled(&db).await.is_err());
    }

    #[test]
    fn last_attempt_tracks_ceiling() {
        let mut task = BackgroundTask::new(delete_payload()).with_max_retry(2);
        task.attempts = 2;
        assert!(!task.is_last_attempt());
        task.attempts = 3;
        assert!(task.is_last_attempt());
        assert!(!task.can_retry());
    }
}
