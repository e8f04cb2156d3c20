//! Continuation and hand-off context preservation.
//!
//! When a run is continued on the same model, or switched to a substitute
//! model after provider failures, the new run needs enough context to carry
//! on coherently. Two interchangeable strategies are supported:
//!
//! - **Template**: a deterministic, zero-cost structured recap built from the
//!   run history. Always available.
//! - **LLM**: a condensed narrative produced by a summarization model. Used
//!   only when enabled in settings, and silently degraded to the template on
//!   any failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::enforcer::CompletionSignal;
use crate::error::Result;
use crate::fallback::FallbackSettings;

/// Default time budget for one summarization call.
pub const DEFAULT_SUMMARIZATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum characters of a tool result included in the template recap.
const MAX_RESULT_CHARS: usize = 500;

/// How a preserved context was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextMethod {
    /// Deterministic recap from structured run history.
    Template,
    /// Condensed narrative from a summarization model.
    Llm,
}

impl std::fmt::Display for ContextMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Template => write!(f, "template"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

/// One executed tool call, in run order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    /// Name of the tool that was executed.
    pub tool_name: String,
    /// Short description of the input.
    pub input_summary: String,
    /// Result (possibly truncated when rendered).
    pub result: String,
}

/// Structured history of one run, the raw material for context preservation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    /// The request the run is serving.
    pub original_request: String,
    /// Already-executed tool calls, in order.
    pub tool_calls: Vec<ToolCallRecord>,
    /// The most recent assistant message, if any.
    pub last_assistant_message: Option<String>,
}

impl TaskHistory {
    /// Create a history for a request.
    pub fn new(original_request: impl Into<String>) -> Self {
        Self {
            original_request: original_request.into(),
            ..Self::default()
        }
    }

    /// Append an executed tool call.
    pub fn add_tool_call(
        &mut self,
        tool_name: impl Into<String>,
        input_summary: impl Into<String>,
        result: impl Into<String>,
    ) {
        self.tool_calls.push(ToolCallRecord {
            tool_name: tool_name.into(),
            input_summary: input_summary.into(),
            result: result.into(),
        });
    }

    /// Replace the last assistant message.
    pub fn set_last_assistant_message(&mut self, content: impl Into<String>) {
        self.last_assistant_message = Some(content.into());
    }
}

/// A context string ready to hand to a continuation or substitute run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreservedContext {
    /// The context text itself.
    pub text: String,
    /// How it was produced.
    pub method: ContextMethod,
    /// Approximate token count (~4 chars per token for English text).
    pub approx_tokens: u32,
}

impl PreservedContext {
    fn new(text: String, method: ContextMethod) -> Self {
        let approx_tokens = (text.len() / 4) as u32;
        Self {
            text,
            method,
            approx_tokens,
        }
    }
}

/// External summarization collaborator. The LLM transport itself is out of
/// scope for this crate.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a condensed narrative of the given recap prompt.
    async fn summarize(&self, model_id: &str, provider: &str, prompt: &str) -> Result<String>;
}

/// Builds continuation/hand-off contexts from task history.
#[derive(Clone)]
pub struct ContextPreserver {
    summarizer: Option<Arc<dyn Summarizer>>,
    summarization_timeout: Duration,
}

impl ContextPreserver {
    /// Create a template-only preserver.
    pub fn new() -> Self {
        Self {
            summarizer: None,
            summarization_timeout: DEFAULT_SUMMARIZATION_TIMEOUT,
        }
    }

    /// Attach a summarizer, enabling llm mode when settings request it.
    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    /// Override the summarization time budget.
    pub fn with_summarization_timeout(mut self, timeout: Duration) -> Self {
        self.summarization_timeout = timeout;
        self
    }

    /// Build the deterministic template recap. Zero external cost.
    pub fn build_template(&self, history: &TaskHistory) -> PreservedContext {
        PreservedContext::new(render_template(history, None), ContextMethod::Template)
    }

    /// Build a hand-off context, honoring the settings' summarization mode.
    ///
    /// When llm mode is requested but the summarization call fails, is
    /// unavailable, or times out, this silently falls back to the template.
    /// The degradation is never surfaced as an error; the returned method
    /// faithfully reports what was actually used.
    pub async fn preserve(
        &self,
        history: &TaskHistory,
        settings: &FallbackSettings,
    ) -> PreservedContext {
        if !settings.use_llm_summarization {
            return self.build_template(history);
        }

        let (Some(summarizer), Some(model_id)) =
            (self.summarizer.as_ref(), settings.summarization_model_id.as_deref())
        else {
            debug!("LLM summarization requested but not available, using template");
            return self.build_template(history);
        };

        let provider = settings.summarization_provider.as_deref().unwrap_or("");
        let prompt = render_template(history, None);

        match tokio::time::timeout(
            self.summarization_timeout,
            summarizer.summarize(model_id, provider, &prompt),
        )
        .await
        {
            Ok(Ok(summary)) if !summary.trim().is_empty() => {
                debug!(model_id, "Context condensed via summarization model");
                PreservedContext::new(summary, ContextMethod::Llm)
            }
            Ok(Ok(_)) => {
                warn!(model_id, "Summarization returned empty output, using template");
                self.build_template(history)
            }
            Ok(Err(err)) => {
                warn!(model_id, error = %err, "Summarization failed, using template");
                self.build_template(history)
            }
            Err(_) => {
                warn!(
                    model_id,
                    timeout_ms = self.summarization_timeout.as_millis() as u64,
                    "Summarization timed out, using template"
                );
                self.build_template(history)
            }
        }
    }
}

impl Default for ContextPreserver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContextPreserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPreserver")
            .field("has_summarizer", &self.summarizer.is_some())
            .field("summarization_timeout", &self.summarization_timeout)
            .finish()
    }
}

/// Build the continuation context for an interrupted run.
///
/// Folds the stored completion signal (if any) into the template recap so the
/// follow-up run knows what was declared done and what remains.
pub fn continuation_context(
    history: &TaskHistory,
    signal: Option<&CompletionSignal>,
) -> PreservedContext {
    PreservedContext::new(render_template(history, signal), ContextMethod::Template)
}

fn render_template(history: &TaskHistory, signal: Option<&CompletionSignal>) -> String {
    let mut out = String::new();

    out.push_str("# Task Continuation Context\n\n");

    out.push_str("## Original Request\n\n");
    let request = match (history.original_request.is_empty(), signal) {
        (true, Some(s)) => s.original_request_summary.as_str(),
        _ => history.original_request.as_str(),
    };
    if request.is_empty() {
        out.push_str("(not recorded)\n\n");
    } else {
        out.push_str(request);
        out.push_str("\n\n");
    }

    out.push_str("## Completed Tool Calls\n\n");
    if history.tool_calls.is_empty() {
        out.push_str("(none)\n\n");
    } else {
        for (i, call) in history.tool_calls.iter().enumerate() {
            let result = truncate(&call.result, MAX_RESULT_CHARS);
            out.push_str(&format!(
                "{}. [{}] {} -> {}\n",
                i + 1,
                call.tool_name,
                call.input_summary,
                result
            ));
        }
        out.push('\n');
    }

    if let Some(message) = &history.last_assistant_message {
        out.push_str("## Last Assistant Message\n\n");
        out.push_str(message);
        out.push_str("\n\n");
    }

    if let Some(signal) = signal {
        out.push_str("## Progress Declared So Far\n\n");
        out.push_str(&signal.summary);
        out.push_str("\n\n");

        if let Some(remaining) = &signal.remaining_work {
            out.push_str("## Remaining Work\n\n");
            out.push_str(remaining);
            out.push('\n');
        }
    }

    out
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{}... [truncated]", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fallback::ProviderErrorKind;

    struct FixedSummarizer(&'static str);

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, _model: &str, _provider: &str, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _model: &str, _provider: &str, _prompt: &str) -> Result<String> {
            Err(Error::retryable(
                ProviderErrorKind::RateLimit,
                "summarization throttled",
            ))
        }
    }

    struct HangingSummarizer;

    #[async_trait]
    impl Summarizer for HangingSummarizer {
        async fn summarize(&self, _model: &str, _provider: &str, _prompt: &str) -> Result<String> {
            // Longer than any test timeout; paused-clock tests auto-advance
            // past the preserver's deadline first.
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok("too late".to_string())
        }
    }

    fn sample_history() -> TaskHistory {
        let mut history = TaskHistory::new("Summarize the quarterly filings");
        history.add_tool_call("court_search", "query: ACME Corp", "3 dockets found");
        history.add_tool_call("registry_lookup", "id: 42", "registered 2019, active");
        history.set_last_assistant_message("Found the filings, starting the summary.");
        history
    }

    fn llm_settings() -> FallbackSettings {
        FallbackSettings {
            use_llm_summarization: true,
            summarization_model_id: Some("claude-3-5-haiku-20241022".to_string()),
            summarization_provider: Some("anthropic".to_string()),
            ..FallbackSettings::default()
        }
    }

    #[test]
    fn test_template_contains_ordered_history() {
        let preserver = ContextPreserver::new();
        let ctx = preserver.build_template(&sample_history());

        assert_eq!(ctx.method, ContextMethod::Template);
        assert!(ctx.text.contains("Summarize the quarterly filings"));
        assert!(ctx.text.contains("1. [court_search]"));
        assert!(ctx.text.contains("2. [registry_lookup]"));
        assert!(ctx.text.contains("starting the summary"));
        assert!(ctx.approx_tokens > 0);
    }

    #[test]
    fn test_template_truncates_long_results() {
        let mut history = TaskHistory::new("req");
        history.add_tool_call("dump", "all", "x".repeat(2_000));

        let ctx = ContextPreserver::new().build_template(&history);
        assert!(ctx.text.contains("[truncated]"));
    }

    #[test]
    fn test_continuation_context_includes_remaining_work() {
        let signal = CompletionSignal::partial("half done", "do the thing", "finish the rest");
        let ctx = continuation_context(&TaskHistory::default(), Some(&signal));

        assert!(ctx.text.contains("do the thing"));
        assert!(ctx.text.contains("half done"));
        assert!(ctx.text.contains("finish the rest"));
    }

    #[tokio::test]
    async fn test_preserve_uses_llm_when_enabled() {
        let preserver =
            ContextPreserver::new().with_summarizer(Arc::new(FixedSummarizer("condensed recap")));

        let ctx = preserver.preserve(&sample_history(), &llm_settings()).await;
        assert_eq!(ctx.method, ContextMethod::Llm);
        assert_eq!(ctx.text, "condensed recap");
    }

    #[tokio::test]
    async fn test_preserve_ignores_llm_when_disabled() {
        let preserver =
            ContextPreserver::new().with_summarizer(Arc::new(FixedSummarizer("condensed recap")));

        let ctx = preserver
            .preserve(&sample_history(), &FallbackSettings::default())
            .await;
        assert_eq!(ctx.method, ContextMethod::Template);
    }

    #[tokio::test]
    async fn test_summarization_failure_degrades_to_template() {
        let preserver = ContextPreserver::new().with_summarizer(Arc::new(FailingSummarizer));

        let ctx = preserver.preserve(&sample_history(), &llm_settings()).await;
        assert_eq!(ctx.method, ContextMethod::Template);
        assert!(ctx.text.contains("court_search"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarization_timeout_degrades_to_template() {
        let preserver = ContextPreserver::new()
            .with_summarizer(Arc::new(HangingSummarizer))
            .with_summarization_timeout(Duration::from_millis(100));

        let ctx = preserver.preserve(&sample_history(), &llm_settings()).await;
        assert_eq!(ctx.method, ContextMethod::Template);
    }

    #[tokio::test]
    async fn test_missing_summarizer_degrades_to_template() {
        let preserver = ContextPreserver::new();

        let ctx = preserver.preserve(&sample_history(), &llm_settings()).await;
        assert_eq!(ctx.method, ContextMethod::Template);
    }
}
