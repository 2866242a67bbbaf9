use common::utils::config::AppConfig;

use crate::prompts::{DEFAULT_QUESTION_PROMPT, DEFAULT_SUMMARY_PROMPT};

#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub retry_backoff_cap_exponent: u32,
    pub faq_import_batch_size: usize,
    pub faq_validation_report_every: usize,
    pub faq_inline_entry_limit: usize,
    pub faq_import_max_retry: u32,
    pub faq_dry_run_max_retry: u32,
    pub faq_insert_concurrency: usize,
    pub enrichment_max_retry: u32,
    pub clone_delete_group_size: usize,
    pub clone_concurrency: usize,
    pub file_url_max_bytes: usize,
    pub file_url_timeout_secs: u64,
    pub manual_content_max_chars: usize,
    pub summary_input_max_offset: i64,
    pub summary_direct_max_chars: usize,
    pub summary_fallback_chars: usize,
    pub question_context_chars: usize,
    pub question_count_max: u32,
    pub question_count_default: u32,
    pub embed_batch_size: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 15 * 60,
            retry_backoff_cap_exponent: 5,
            faq_import_batch_size: 50,
            faq_validation_report_every: 100,
            faq_inline_entry_limit: 200,
            faq_import_max_retry: 5,
            faq_dry_run_max_retry: 3,
            faq_insert_concurrency: 8,
            enrichment_max_retry: 3,
            clone_delete_group_size: 10,
            clone_concurrency: 10,
            file_url_max_bytes: 10 * 1024 * 1024,
            file_url_timeout_secs: 60,
            manual_content_max_chars: 200_000,
            summary_input_max_offset: 4096,
            summary_direct_max_chars: 300,
            summary_fallback_chars: 500,
            question_context_chars: 500,
            question_count_max: 10,
            question_count_default: 3,
            embed_batch_size: 32,
        }
    }
}

impl IngestionTuning {
    /// Clamps a requested question count into `1..=question_count_max`;
    /// zero falls back to the default.
    pub fn clamp_question_count(&self, requested: u32) -> u32 {
        if requested == 0 {
            return self.question_count_default;
        }
        requested.min(self.question_count_max)
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
    pub summary_prompt: String,
    pub question_prompt: String,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            tuning: IngestionTuning::default(),
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            question_prompt: DEFAULT_QUESTION_PROMPT.to_string(),
        }
    }
}

impl IngestionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        let defaults = Self::default();
        Self {
            tuning: defaults.tuning,
            summary_prompt: config
                .summary_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.summary_prompt),
            question_prompt: config
                .question_prompt
                .clone()
                .filter(|p| !p.trim().is_empty())
                .unwrap_or(defaults.question_prompt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_count_is_clamped() {
        let tuning = IngestionTuning::default();
        assert_eq!(tuning.clamp_question_count(0), 3);
        assert_eq!(tuning.clamp_question_count(4), 4);
        assert_eq!(tuning.clamp_question_count(50), 10);
    }

    #[test]
    fn blank_prompt_overrides_fall_back_to_defaults() {
        let app = AppConfig {
            summary_prompt: Some("   ".into()),
            question_prompt: Some("custom {{content}}".into()),
            ..AppConfig::default()
        };
        let config = IngestionConfig::from_app_config(&app);
        assert_eq!(config.summary_prompt, DEFAULT_SUMMARY_PROMPT);
        assert_eq!(config.question_prompt, "custom {{content}}");
    }
}
