//! Pure step classification for the completion enforcer.
//!
//! The three-way continue/pending/complete decision is a pure function of the
//! step-finish reason, the tools-used flag, and the stored completion signal.
//! Keeping it free of timers and callbacks makes the decision table directly
//! unit-testable; the effectful scheduling lives in [`CompletionEnforcer`].
//!
//! [`CompletionEnforcer`]: crate::enforcer::CompletionEnforcer

use serde::{Deserialize, Serialize};

/// Reason the agent finished a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Generic stop.
    Stop,
    /// Model ended its turn.
    EndTurn,
    /// Step ended to execute a tool; more steps expected.
    ToolUse,
    /// Output token limit hit; more steps expected.
    MaxTokens,
    /// Any other non-terminal reason.
    Other,
}

impl FinishReason {
    /// Whether this reason can end a run. Only `stop` and `end_turn` are
    /// terminal; everything else means the engine will produce more steps.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop | Self::EndTurn)
    }
}

impl std::fmt::Display for FinishReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::EndTurn => write!(f, "end_turn"),
            Self::ToolUse => write!(f, "tool_use"),
            Self::MaxTokens => write!(f, "max_tokens"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Declared status inside a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    /// The agent declares the task fully done.
    Success,
    /// The agent declares partial progress with work remaining.
    Partial,
}

/// Explicit completion declaration from the agent.
///
/// At most one signal is live per run; storing a new one replaces the
/// previous one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionSignal {
    /// Declared status.
    pub status: CompletionStatus,
    /// What was accomplished.
    pub summary: String,
    /// Condensed restatement of the original request.
    pub original_request_summary: String,
    /// Work the agent believes is still outstanding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_work: Option<String>,
}

impl CompletionSignal {
    /// Create a success signal.
    pub fn success(
        summary: impl Into<String>,
        original_request_summary: impl Into<String>,
    ) -> Self {
        Self {
            status: CompletionStatus::Success,
            summary: summary.into(),
            original_request_summary: original_request_summary.into(),
            remaining_work: None,
        }
    }

    /// Create a partial signal with remaining work.
    pub fn partial(
        summary: impl Into<String>,
        original_request_summary: impl Into<String>,
        remaining_work: impl Into<String>,
    ) -> Self {
        Self {
            status: CompletionStatus::Partial,
            summary: summary.into(),
            original_request_summary: original_request_summary.into(),
            remaining_work: Some(remaining_work.into()),
        }
    }

    /// Whether this signal declares full success.
    pub fn is_success(&self) -> bool {
        self.status == CompletionStatus::Success
    }
}

/// Outcome of classifying one finished step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// More steps expected; nothing to do.
    Continue,
    /// Run ended mid-task; an automatic continuation is needed.
    Pending,
    /// Run is genuinely finished.
    Complete,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Pending => write!(f, "pending"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Classify a finished step.
///
/// Decision table:
/// - non-terminal reason → `Continue`
/// - stored signal with `Success` status → `Complete`, regardless of tools
/// - terminal reason, no tools used, no signal → `Complete` (purely
///   conversational exchange)
/// - terminal reason, tools used, signal absent or `Partial` → `Pending`
pub fn classify_step(
    reason: FinishReason,
    tools_used: bool,
    signal: Option<&CompletionSignal>,
) -> StepOutcome {
    if !reason.is_terminal() {
        return StepOutcome::Continue;
    }

    if signal.is_some_and(|s| s.is_success()) {
        return StepOutcome::Complete;
    }

    if !tools_used && signal.is_none() {
        return StepOutcome::Complete;
    }

    StepOutcome::Pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_terminal_reasons_continue() {
        for reason in [FinishReason::ToolUse, FinishReason::MaxTokens, FinishReason::Other] {
            assert_eq!(classify_step(reason, true, None), StepOutcome::Continue);
            assert_eq!(classify_step(reason, false, None), StepOutcome::Continue);
        }
    }

    #[test]
    fn test_conversational_stop_completes() {
        assert_eq!(
            classify_step(FinishReason::Stop, false, None),
            StepOutcome::Complete
        );
        assert_eq!(
            classify_step(FinishReason::EndTurn, false, None),
            StepOutcome::Complete
        );
    }

    #[test]
    fn test_tools_without_signal_is_pending() {
        assert_eq!(
            classify_step(FinishReason::Stop, true, None),
            StepOutcome::Pending
        );
    }

    #[test]
    fn test_partial_signal_is_pending() {
        let signal = CompletionSignal::partial("half done", "do the thing", "other half");
        assert_eq!(
            classify_step(FinishReason::Stop, true, Some(&signal)),
            StepOutcome::Pending
        );
        // A partial signal forces pending even without tools.
        assert_eq!(
            classify_step(FinishReason::EndTurn, false, Some(&signal)),
            StepOutcome::Pending
        );
    }

    #[test]
    fn test_success_signal_completes_regardless_of_tools() {
        let signal = CompletionSignal::success("done", "do the thing");
        assert_eq!(
            classify_step(FinishReason::Stop, true, Some(&signal)),
            StepOutcome::Complete
        );
        assert_eq!(
            classify_step(FinishReason::Stop, false, Some(&signal)),
            StepOutcome::Complete
        );
    }
}
