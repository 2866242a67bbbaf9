use std::time::Duration;

use common::{
    error::AppError,
    storage::types::{
        background_task::{BackgroundTask, TaskErrorInfo},
        task_payloads::TaskPayload,
    },
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{config::IngestionTuning, engine::KnowledgeEngine};

impl IngestionTuning {
    /// Backoff before the next attempt: the base delay doubled per consumed
    /// attempt, with the exponent and the result both capped.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt
            .saturating_sub(1)
            .min(self.retry_backoff_cap_exponent);
        let delay = self
            .retry_base_delay_secs
            .saturating_mul(2_u64.saturating_pow(exponent));
        Duration::from_secs(delay.min(self.retry_max_delay_secs))
    }
}

impl KnowledgeEngine {
    /// Runs one claimed task to completion and records the outcome. Failures
    /// are rescheduled with backoff while attempts remain; permanent errors
    /// and exhausted tasks go to the dead letter state.
    pub async fn process_task(&self, task: BackgroundTask) -> Result<(), AppError> {
        let task_id = task.id.clone();
        let attempt = task.attempts;
        let worker_label = task
            .worker_id
            .clone()
            .unwrap_or_else(|| "unknown-worker".to_string());
        let span = info_span!(
            "background_task",
            %task_id,
            task_type = task.task_type.as_str(),
            attempt,
            worker_id = %worker_label
        );

        async move {
            let processing = task.mark_processing(&self.db).await?;
            match self.dispatch_with_lease(&processing).await {
                Ok(()) => {
                    processing.mark_succeeded(&self.db).await?;
                    info!(%task_id, attempt, "background task succeeded");
                    Ok(())
                }
                Err(err) => {
                    let reason = err.to_string();
                    let error_info = TaskErrorInfo {
                        code: Some(error_code(&err).to_string()),
                        message: reason.clone(),
                    };

                    if !err.is_permanent() && processing.can_retry() {
                        let delay = self.config.tuning.retry_delay(processing.attempts);
                        processing
                            .mark_failed(error_info, delay, &self.db)
                            .await?;
                        warn!(
                            %task_id,
                            attempt = processing.attempts,
                            retry = processing.retry_count(),
                            max_retry = processing.max_retry(),
                            retry_in_secs = delay.as_secs(),
                            error = %reason,
                            "background task failed; scheduled retry"
                        );
                    } else {
                        let failed = processing
                            .mark_failed(error_info.clone(), Duration::ZERO, &self.db)
                            .await?;
                        failed.mark_dead_letter(error_info, &self.db).await?;
                        warn!(
                            %task_id,
                            attempt = processing.attempts,
                            permanent = err.is_permanent(),
                            error = %reason,
                            "background task failed; moved to dead letter queue"
                        );
                    }

                    Err(AppError::Processing(reason))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs the handler while renewing the task lease, so no other worker
    /// reclaims a long import or clone that is still making progress.
    async fn dispatch_with_lease(&self, task: &BackgroundTask) -> Result<(), AppError> {
        let period = (task.lease_duration() / 3).max(Duration::from_secs(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let work = self.dispatch(task);
        tokio::pin!(work);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => match task.renew_lease(&self.db).await {
                    Ok(true) => debug!(task_id = %task.id, "renewed task lease"),
                    Ok(false) => warn!(task_id = %task.id, "task lease lost while processing"),
                    Err(err) => warn!(task_id = %task.id, error = %err, "failed to renew task lease"),
                },
            }
        }
    }

    async fn dispatch(&self, task: &BackgroundTask) -> Result<(), AppError> {
        let last = task.is_last_attempt();
        match &task.payload {
            TaskPayload::DocumentProcess(payload) => self.process_document(payload, last).await,
            TaskPayload::FaqImport(payload) => self.process_faq_import(payload, last).await,
            TaskPayload::QuestionGeneration(payload) => {
                self.process_question_generation(payload).await
            }
            TaskPayload::SummaryGeneration(payload) => {
                self.process_summary_generation(payload).await
            }
            TaskPayload::KbClone(payload) => self.process_kb_clone(payload, last).await,
            TaskPayload::KnowledgeListDelete(payload) => {
                self.process_knowledge_list_delete(payload).await
            }
        }
    }
}

fn error_code(err: &AppError) -> &'static str {
    match err {
        AppError::NotFound(_) => "not_found",
        AppError::Validation(_) => "validation",
        AppError::BadRequest(_) => "bad_request",
        AppError::Forbidden(_) => "forbidden",
        AppError::QuotaExceeded(_) => "quota_exceeded",
        AppError::Duplicate { .. } => "duplicate",
        _ => "internal",
    }
}
