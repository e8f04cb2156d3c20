//! # runkeeper
//!
//! A completion-enforcement and model-fallback layer for long-running agent
//! tasks.
//!
//! ## Core Components
//!
//! - **Enforcer**: Detects premature run termination and drives automatic
//!   continuation with a cancellable grace timer
//! - **Fallback**: Classifies provider failures, retries in place, and
//!   switches tasks to a substitute model with preserved context
//! - **Context**: Deterministic template recaps and optional LLM-condensed
//!   hand-off context
//! - **Store**: SQLite-backed audit log and settings persistence
//!
//! ## Example
//!
//! ```rust,ignore
//! use runkeeper::{classify_step, FinishReason, StepOutcome};
//!
//! let outcome = classify_step(FinishReason::Stop, true, None);
//! if outcome == StepOutcome::Pending {
//!     println!("run ended mid-task, continuation needed");
//! }
//! ```

pub mod context;
pub mod enforcer;
pub mod error;
pub mod fallback;
pub mod run;
pub mod store;

// Re-exports for convenience
pub use context::{
    continuation_context, ContextMethod, ContextPreserver, PreservedContext, Summarizer,
    TaskHistory, ToolCallRecord,
};
pub use enforcer::{
    classify_step, CompletionEnforcer, CompletionSignal, CompletionStatus, EnforcerCallbacks,
    FinishReason, StepOutcome, DEFAULT_CONTINUATION_TIMEOUT,
};
pub use error::{Error, Result};
pub use fallback::{
    FallbackEngine, FallbackLogEntry, FallbackOutcome, FallbackSettings, FallbackSettingsPatch,
    FallbackStats, ProviderErrorKind, ProviderFailure, ProviderRunner, RetryPolicy,
};
pub use run::TaskRun;
pub use store::{
    FallbackLog, MemorySettingsStore, SettingsStore, SqliteFallbackLog, SqliteSettingsStore,
};
