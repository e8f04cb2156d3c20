//! Error types for runkeeper.

use thiserror::Error;

use crate::fallback::ProviderErrorKind;

/// Result type alias using runkeeper's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the completion/fallback core.
#[derive(Error, Debug)]
pub enum Error {
    /// Retryable provider failure that was surfaced without recovery
    /// (fallback disabled, or retries exhausted with no switch possible).
    #[error("Retryable provider error ({kind}): {message}")]
    RetryableProvider {
        kind: ProviderErrorKind,
        message: String,
    },

    /// Fatal provider failure; propagates with no recovery attempt.
    #[error("Fatal provider error ({kind}): {message}")]
    FatalProvider {
        kind: ProviderErrorKind,
        message: String,
    },

    /// Fallback is enabled but unusable (e.g. no fallback model configured).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Ordering contract violated (e.g. process exit without a preceding
    /// step-finish in the same cycle).
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A fallback sequence is already in flight for this task.
    #[error("Fallback already in flight for task {task_id}")]
    FallbackInFlight { task_id: String },

    /// Log/settings storage error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Continuation spawn failure reported by the task engine. Not swallowed;
    /// recovery policy belongs to the caller.
    #[error("Continuation error: {0}")]
    Continuation(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a retryable provider error.
    pub fn retryable(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::RetryableProvider {
            kind,
            message: message.into(),
        }
    }

    /// Create a fatal provider error.
    pub fn fatal(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self::FatalProvider {
            kind,
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}
