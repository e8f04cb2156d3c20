//! Task run identity shared by the enforcer and the fallback engine.

use serde::{Deserialize, Serialize};

/// Identifies one agent execution.
///
/// A `TaskRun` is owned by exactly one [`CompletionEnforcer`] instance: it is
/// created when a task starts, carried across continuation rounds, and
/// discarded when the task reaches a terminal state.
///
/// [`CompletionEnforcer`]: crate::enforcer::CompletionEnforcer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    /// Logical task identifier.
    pub task_id: String,
    /// Provider-side session identifier, if one has been assigned.
    pub session_id: Option<String>,
    /// Model currently executing the task.
    pub model_id: String,
    /// Provider of the current model.
    pub provider: String,
}

impl TaskRun {
    /// Create a new run for a task on the given model/provider.
    pub fn new(
        task_id: impl Into<String>,
        model_id: impl Into<String>,
        provider: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: None,
            model_id: model_id.into(),
            provider: provider.into(),
        }
    }

    /// Attach the provider session id once known.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Move this run onto a different model/provider, keeping the task id.
    ///
    /// The session id is cleared: a substitute model starts a fresh session
    /// and receives the preserved context instead.
    pub fn switched_to(&self, model_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            task_id: self.task_id.clone(),
            session_id: None,
            model_id: model_id.into(),
            provider: provider.into(),
        }
    }
}
