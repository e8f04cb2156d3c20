//! Fallback types: error classification, settings, and the audit log entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::ContextMethod;
use crate::error::{Error, Result};
use crate::run::TaskRun;

/// Classified provider error kind.
///
/// Only `rate_limit`, `timeout`, and `transient_server_error` drive the
/// retry-then-fallback algorithm; everything else is fatal and propagates
/// with no recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Provider throttled the request.
    RateLimit,
    /// Request timed out.
    Timeout,
    /// Transient 5xx-style provider failure.
    TransientServerError,
    /// Authentication/authorization failure.
    Auth,
    /// The request itself was rejected as invalid.
    InvalidRequest,
    /// Anything not explicitly classified.
    Unknown,
}

impl ProviderErrorKind {
    /// Whether this kind is eligible for retry-then-switch handling.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::Timeout | Self::TransientServerError
        )
    }

    /// Classify a raw provider error-type string.
    pub fn classify(error_type: &str) -> Self {
        match error_type {
            "rate_limit" | "rate_limit_error" | "overloaded_error" => Self::RateLimit,
            "timeout" | "timeout_error" => Self::Timeout,
            "transient_server_error" | "server_error" | "api_error" => Self::TransientServerError,
            "auth" | "authentication_error" | "permission_error" => Self::Auth,
            "invalid_request" | "invalid_request_error" => Self::InvalidRequest,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::Timeout => write!(f, "timeout"),
            Self::TransientServerError => write!(f, "transient_server_error"),
            Self::Auth => write!(f, "auth"),
            Self::InvalidRequest => write!(f, "invalid_request"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified provider failure reported by the task-execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderFailure {
    /// Classified kind.
    pub kind: ProviderErrorKind,
    /// Raw provider error message.
    pub message: String,
}

impl ProviderFailure {
    /// Create a failure from an already-classified kind.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a failure from a raw provider error-type string.
    pub fn from_raw(error_type: &str, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::classify(error_type), message)
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Ordering of recovery actions after a retryable failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Retry the same model/session first, switch only when retries exhaust.
    ///
    /// Transient throttling often clears quickly, and retrying in place
    /// avoids any context-preservation cost or risk.
    #[default]
    RetryFirst,
    /// Skip in-place retries and switch to the fallback model immediately.
    SwitchImmediately,
}

/// Singleton fallback configuration.
///
/// Re-read fresh at the moment of each failure, never cached for a run's
/// lifetime, so configuration changes apply to the next failure immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackSettings {
    /// Master switch for retry/fallback handling.
    pub enabled: bool,
    /// Model to switch to when retries exhaust.
    pub fallback_model_id: Option<String>,
    /// Provider of the fallback model.
    pub fallback_provider: Option<String>,
    /// In-place retry attempts before switching. Always at least 1.
    pub max_retries: u32,
    /// Fixed delay between in-place retries.
    pub retry_delay_ms: u64,
    /// Whether to condense hand-off context with a summarization model.
    pub use_llm_summarization: bool,
    /// Summarization model, when llm mode is in use.
    pub summarization_model_id: Option<String>,
    /// Provider of the summarization model.
    pub summarization_provider: Option<String>,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_model_id: None,
            fallback_provider: None,
            max_retries: 3,
            retry_delay_ms: 5_000,
            use_llm_summarization: false,
            summarization_model_id: None,
            summarization_provider: None,
        }
    }
}

impl FallbackSettings {
    /// Validate invariants (`max_retries >= 1`).
    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 1 {
            return Err(Error::configuration("max_retries must be at least 1"));
        }
        Ok(())
    }

    /// Apply a partial update, returning the merged settings.
    pub fn merged_with(&self, patch: FallbackSettingsPatch) -> Self {
        Self {
            enabled: patch.enabled.unwrap_or(self.enabled),
            fallback_model_id: patch
                .fallback_model_id
                .unwrap_or_else(|| self.fallback_model_id.clone()),
            fallback_provider: patch
                .fallback_provider
                .unwrap_or_else(|| self.fallback_provider.clone()),
            max_retries: patch.max_retries.unwrap_or(self.max_retries),
            retry_delay_ms: patch.retry_delay_ms.unwrap_or(self.retry_delay_ms),
            use_llm_summarization: patch
                .use_llm_summarization
                .unwrap_or(self.use_llm_summarization),
            summarization_model_id: patch
                .summarization_model_id
                .unwrap_or_else(|| self.summarization_model_id.clone()),
            summarization_provider: patch
                .summarization_provider
                .unwrap_or_else(|| self.summarization_provider.clone()),
        }
    }
}

/// Partial settings update. `None` leaves the field untouched; the inner
/// `Option` on model/provider fields allows explicitly clearing them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackSettingsPatch {
    pub enabled: Option<bool>,
    pub fallback_model_id: Option<Option<String>>,
    pub fallback_provider: Option<Option<String>>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub use_llm_summarization: Option<bool>,
    pub summarization_model_id: Option<Option<String>>,
    pub summarization_provider: Option<Option<String>>,
}

/// Immutable, append-only audit record of one retry/fallback attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackLogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Task this attempt belongs to.
    pub task_id: String,
    /// Provider session of the failing run, if known.
    pub session_id: Option<String>,
    /// Model that failed.
    pub from_model: String,
    /// Provider that failed.
    pub from_provider: String,
    /// Model the attempt targeted (same as `from_model` for in-place retries).
    pub to_model: String,
    /// Provider the attempt targeted.
    pub to_provider: String,
    /// Classified error that triggered the attempt.
    pub error_kind: ProviderErrorKind,
    /// Raw error message.
    pub error_message: String,
    /// How the hand-off context was produced (switch attempts only).
    pub context_method: Option<ContextMethod>,
    /// Approximate hand-off context size (switch attempts only).
    pub context_tokens: Option<u32>,
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Attempt duration.
    pub duration_ms: u64,
    /// When the attempt finished.
    pub created_at: DateTime<Utc>,
}

impl FallbackLogEntry {
    /// Record an in-place retry attempt on the run's current model.
    pub fn retry_attempt(run: &TaskRun, failure: &ProviderFailure) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: run.task_id.clone(),
            session_id: run.session_id.clone(),
            from_model: run.model_id.clone(),
            from_provider: run.provider.clone(),
            to_model: run.model_id.clone(),
            to_provider: run.provider.clone(),
            error_kind: failure.kind,
            error_message: failure.message.clone(),
            context_method: None,
            context_tokens: None,
            success: false,
            duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    /// Record a model-switch attempt with its preserved context.
    pub fn switch_attempt(
        run: &TaskRun,
        failure: &ProviderFailure,
        to_model: impl Into<String>,
        to_provider: impl Into<String>,
        context_method: ContextMethod,
        context_tokens: u32,
    ) -> Self {
        Self {
            to_model: to_model.into(),
            to_provider: to_provider.into(),
            context_method: Some(context_method),
            context_tokens: Some(context_tokens),
            ..Self::retry_attempt(run, failure)
        }
    }

    /// Mark the attempt outcome and duration.
    pub fn finished(mut self, success: bool, duration_ms: u64) -> Self {
        self.success = success;
        self.duration_ms = duration_ms;
        self.created_at = Utc::now();
        self
    }
}

/// Result of a successfully handled retryable failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackOutcome {
    /// An in-place retry on the same model/session succeeded.
    Retried {
        /// How many attempts were made (including the successful one).
        attempts: u32,
    },
    /// The task was switched to the fallback model with preserved context.
    SwitchedModel {
        /// Fallback model now running the task.
        model_id: String,
        /// Provider of the fallback model.
        provider: String,
        /// How the hand-off context was produced.
        context_method: ContextMethod,
        /// Total attempts made, in-place retries plus the switch.
        attempts: u32,
    },
}

/// Aggregate statistics over the fallback audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackStats {
    /// Total logged attempts.
    pub total_events: u64,
    /// Attempts that succeeded.
    pub successful_events: u64,
    /// Attempts that failed.
    pub failed_events: u64,
    /// successful / total, 0.0 when the log is empty.
    pub success_rate: f64,
    /// Mean attempt duration, 0.0 when the log is empty.
    pub avg_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderErrorKind::RateLimit.is_retryable());
        assert!(ProviderErrorKind::Timeout.is_retryable());
        assert!(ProviderErrorKind::TransientServerError.is_retryable());
        assert!(!ProviderErrorKind::Auth.is_retryable());
        assert!(!ProviderErrorKind::InvalidRequest.is_retryable());
        assert!(!ProviderErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_classify_raw_error_types() {
        assert_eq!(
            ProviderErrorKind::classify("rate_limit_error"),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderErrorKind::classify("overloaded_error"),
            ProviderErrorKind::RateLimit
        );
        assert_eq!(
            ProviderErrorKind::classify("authentication_error"),
            ProviderErrorKind::Auth
        );
        assert_eq!(
            ProviderErrorKind::classify("something_novel"),
            ProviderErrorKind::Unknown
        );
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = FallbackSettings::default();
        assert!(settings.validate().is_ok());

        settings.max_retries = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_settings_patch_merge() {
        let settings = FallbackSettings::default();
        let merged = settings.merged_with(FallbackSettingsPatch {
            fallback_model_id: Some(Some("gpt-4o".to_string())),
            max_retries: Some(5),
            ..Default::default()
        });

        assert_eq!(merged.fallback_model_id.as_deref(), Some("gpt-4o"));
        assert_eq!(merged.max_retries, 5);
        // Untouched fields keep their values.
        assert_eq!(merged.retry_delay_ms, settings.retry_delay_ms);
        assert_eq!(merged.enabled, settings.enabled);
    }

    #[test]
    fn test_patch_can_clear_fallback_model() {
        let settings = FallbackSettings {
            fallback_model_id: Some("gpt-4o".to_string()),
            ..FallbackSettings::default()
        };
        let merged = settings.merged_with(FallbackSettingsPatch {
            fallback_model_id: Some(None),
            ..Default::default()
        });
        assert!(merged.fallback_model_id.is_none());
    }

    #[test]
    fn test_switch_attempt_entry_carries_context() {
        let run = TaskRun::new("task-1", "claude-3-5-sonnet-20241022", "anthropic")
            .with_session_id("sess");
        let failure = ProviderFailure::new(ProviderErrorKind::RateLimit, "throttled");

        let entry = FallbackLogEntry::switch_attempt(
            &run,
            &failure,
            "gpt-4o",
            "openai",
            ContextMethod::Template,
            120,
        )
        .finished(true, 640);

        assert_eq!(entry.from_model, "claude-3-5-sonnet-20241022");
        assert_eq!(entry.to_model, "gpt-4o");
        assert_eq!(entry.context_method, Some(ContextMethod::Template));
        assert_eq!(entry.context_tokens, Some(120));
        assert!(entry.success);
        assert_eq!(entry.duration_ms, 640);
    }
}
