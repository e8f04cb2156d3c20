//! Completion enforcement for long-running agent runs.
//!
//! After every agent step the enforcer decides whether the run is genuinely
//! finished, needs an automatic continuation, or must be force-completed by
//! timeout. The pure decision table lives in [`decision`]; this module owns
//! the effectful part: callback invocation and the single cancellable
//! continuation timer.
//!
//! ## Example
//!
//! ```rust,ignore
//! use runkeeper::enforcer::{CompletionEnforcer, EnforcerCallbacks, FinishReason};
//! use runkeeper::TaskRun;
//!
//! let run = TaskRun::new("task-1", "claude-3-5-sonnet-20241022", "anthropic");
//! let mut enforcer = CompletionEnforcer::new(run, callbacks);
//!
//! enforcer.mark_tools_used();
//! let outcome = enforcer.handle_step_finish(FinishReason::Stop); // Pending
//! enforcer.handle_process_exit(0).await?; // spawns continuation + arms timer
//! ```

mod decision;

pub use decision::{classify_step, CompletionSignal, CompletionStatus, FinishReason, StepOutcome};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::context::{continuation_context, TaskHistory};
use crate::error::{Error, Result};
use crate::run::TaskRun;

/// Default continuation timeout: 30 seconds.
pub const DEFAULT_CONTINUATION_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Capability interface the task-execution engine must implement.
///
/// One implementation is injected per enforcer instance at construction; the
/// enforcer never reaches into any process-wide registry.
#[async_trait]
pub trait EnforcerCallbacks: Send + Sync {
    /// Spawn an automatic continuation run with the given hand-off context.
    ///
    /// Errors are not swallowed by the enforcer; recovery policy for
    /// continuation-spawn failures belongs to the caller.
    async fn on_start_continuation(&self, context: String) -> Result<()>;

    /// The run reached its terminal state. Invoked at most once per run.
    fn on_complete(&self);

    /// Diagnostic event stream. Never affects control flow.
    fn on_debug(&self, _event: &str, _message: &str, _data: Option<Value>) {}
}

/// Lifecycle state of one enforced run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    PendingContinuation,
    Completed,
}

/// Per-run state machine deciding continue / pending / complete, with
/// timeout-based forced completion.
///
/// One instance is scoped to exactly one [`TaskRun`]; it holds no locks and
/// at most one outstanding continuation timer at any time. `on_complete`
/// fires exactly once per run: the timeout path and the normal completion
/// path each cancel the other's trigger.
pub struct CompletionEnforcer {
    run: TaskRun,
    callbacks: Arc<dyn EnforcerCallbacks>,
    continuation_timeout: Duration,
    history: TaskHistory,
    tools_used: bool,
    signal: Option<CompletionSignal>,
    last_outcome: Option<StepOutcome>,
    state: RunState,
    completed: Arc<AtomicBool>,
    timer: Option<JoinHandle<()>>,
}

impl CompletionEnforcer {
    /// Create an enforcer for a run with the default 30s continuation timeout.
    pub fn new(run: TaskRun, callbacks: Arc<dyn EnforcerCallbacks>) -> Self {
        Self::with_continuation_timeout(run, callbacks, DEFAULT_CONTINUATION_TIMEOUT)
    }

    /// Create an enforcer with an explicit continuation timeout.
    pub fn with_continuation_timeout(
        run: TaskRun,
        callbacks: Arc<dyn EnforcerCallbacks>,
        continuation_timeout: Duration,
    ) -> Self {
        Self {
            run,
            callbacks,
            continuation_timeout,
            history: TaskHistory::default(),
            tools_used: false,
            signal: None,
            last_outcome: None,
            state: RunState::Idle,
            completed: Arc::new(AtomicBool::new(false)),
            timer: None,
        }
    }

    /// The run this enforcer is scoped to.
    pub fn run(&self) -> &TaskRun {
        &self.run
    }

    /// Mark that at least one tool ran during the current round.
    pub fn mark_tools_used(&mut self) {
        self.tools_used = true;
    }

    /// Record a tool call into the run history (also marks tools as used).
    pub fn record_tool_call(
        &mut self,
        tool_name: impl Into<String>,
        input_summary: impl Into<String>,
        result: impl Into<String>,
    ) {
        self.history.add_tool_call(tool_name, input_summary, result);
        self.tools_used = true;
    }

    /// Record the latest assistant message into the run history.
    pub fn record_assistant_message(&mut self, content: impl Into<String>) {
        self.history.set_last_assistant_message(content);
    }

    /// Set the original request the run is serving (used in recap contexts).
    pub fn set_original_request(&mut self, request: impl Into<String>) {
        self.history.original_request = request.into();
    }

    /// Store an explicit completion signal, replacing any prior one.
    pub fn handle_complete_task_detection(&mut self, signal: CompletionSignal) {
        if self.signal.is_some() {
            debug!(task_id = %self.run.task_id, "Replacing stored completion signal");
        }
        self.signal = Some(signal);
    }

    /// Classify a finished step and record the decision for the next
    /// [`handle_process_exit`](Self::handle_process_exit).
    pub fn handle_step_finish(&mut self, reason: FinishReason) -> StepOutcome {
        // Completion is monotonic: a completed run never regresses to
        // pending. The atomic flag is the source of truth, since the timeout
        // task completes the run without access to `self.state`.
        let already_completed = self.completed.load(Ordering::SeqCst);
        let outcome = if already_completed {
            StepOutcome::Complete
        } else {
            classify_step(reason, self.tools_used, self.signal.as_ref())
        };

        if !already_completed
            && outcome == StepOutcome::Complete
            && reason.is_terminal()
            && !self.tools_used
            && self.signal.is_none()
        {
            self.callbacks.on_debug(
                "skip_continuation",
                "conversational exchange, no continuation needed",
                Some(json!({ "task_id": self.run.task_id, "reason": reason.to_string() })),
            );
        }

        debug!(
            task_id = %self.run.task_id,
            %reason,
            tools_used = self.tools_used,
            has_signal = self.signal.is_some(),
            %outcome,
            "Step finished"
        );

        self.last_outcome = Some(outcome);
        outcome
    }

    /// Consume the last step decision at process exit.
    ///
    /// `Pending` spawns a continuation and arms the timeout timer; any other
    /// decision completes the run directly. Calling this without a preceding
    /// `handle_step_finish` in the same cycle is a protocol violation.
    pub async fn handle_process_exit(&mut self, exit_code: i32) -> Result<()> {
        if self.completed.load(Ordering::SeqCst) {
            // Late result after forced completion: dropped, never merged.
            self.callbacks.on_debug(
                "late_result_dropped",
                "process exit after run already completed",
                Some(json!({ "task_id": self.run.task_id, "exit_code": exit_code })),
            );
            return Ok(());
        }

        let outcome = self.last_outcome.take().ok_or_else(|| {
            Error::protocol("handle_process_exit called without a preceding handle_step_finish")
        })?;

        match outcome {
            StepOutcome::Pending => self.start_continuation().await,
            StepOutcome::Continue | StepOutcome::Complete => {
                self.complete_now();
                Ok(())
            }
        }
    }

    /// Clear per-round state between continuation rounds.
    ///
    /// Cancels any pending timer and clears the tools flag, the stored
    /// signal, and the recorded decision, so stale state cannot leak into the
    /// next evaluation. The exactly-once completion guarantee survives reset.
    pub fn reset(&mut self) {
        self.cancel_timer();
        self.tools_used = false;
        self.signal = None;
        self.last_outcome = None;
        if self.state != RunState::Completed {
            self.state = RunState::Idle;
        }
    }

    async fn start_continuation(&mut self) -> Result<()> {
        let context = continuation_context(&self.history, self.signal.as_ref());

        debug!(
            task_id = %self.run.task_id,
            context_tokens = context.approx_tokens,
            "Spawning continuation"
        );

        // Continuation-spawn failures propagate to the caller unchanged.
        self.callbacks.on_start_continuation(context.text).await?;

        let timeout_ms = self.continuation_timeout.as_millis() as u64;
        self.callbacks.on_debug(
            "continuation_timeout_started",
            "forced completion armed",
            Some(json!({ "task_id": self.run.task_id, "timeout_ms": timeout_ms })),
        );

        // One timer per run; replacing an old handle aborts it first.
        self.cancel_timer();
        let completed = Arc::clone(&self.completed);
        let callbacks = Arc::clone(&self.callbacks);
        let task_id = self.run.task_id.clone();
        let timeout = self.continuation_timeout;
        // The deadline is fixed here, when the timer is armed. Computing it
        // inside the task would pin it to the first poll instead, letting the
        // timeout drift by the scheduling delay.
        let deadline = tokio::time::Instant::now() + timeout;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if completed
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!(%task_id, timeout_ms = timeout.as_millis() as u64, "Continuation never arrived, forcing completion");
                callbacks.on_debug(
                    "continuation_timeout",
                    "continuation did not arrive in time, forcing completion",
                    Some(json!({ "task_id": task_id })),
                );
                callbacks.on_complete();
            }
        }));

        self.state = RunState::PendingContinuation;
        Ok(())
    }

    fn complete_now(&mut self) {
        self.cancel_timer();
        if self
            .completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.state = RunState::Completed;
            debug!(task_id = %self.run.task_id, "Run completed");
            self.callbacks.on_complete();
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for CompletionEnforcer {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
