//! Automatic retry and model-fallback handling for provider failures.
//!
//! When the task engine reports a provider failure, the [`FallbackEngine`]
//! classifies it, retries the current model in place for transient errors,
//! and switches the task to a configured substitute model with preserved
//! context once retries exhaust. Every attempt is written to the audit log.

mod types;

pub use types::{
    FallbackLogEntry, FallbackOutcome, FallbackSettings, FallbackSettingsPatch, FallbackStats,
    ProviderErrorKind, ProviderFailure, RetryPolicy,
};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::context::{ContextPreserver, PreservedContext, TaskHistory};
use crate::error::{Error, Result};
use crate::run::TaskRun;
use crate::store::{FallbackLog, SettingsStore};

/// Task-execution collaborator the engine drives recovery through.
///
/// The transport and process mechanics live in the host; the engine only
/// decides what to attempt and in what order.
#[async_trait]
pub trait ProviderRunner: Send + Sync {
    /// Re-attempt the run on its current model and session.
    async fn retry_same(&self, run: &TaskRun) -> std::result::Result<(), ProviderFailure>;

    /// Start the task on a substitute model with the given hand-off context.
    async fn start_fallback(
        &self,
        run: &TaskRun,
        model_id: &str,
        provider: &str,
        context: &PreservedContext,
    ) -> std::result::Result<(), ProviderFailure>;
}

/// Retry-then-fallback decision engine.
///
/// Settings are re-read from the store at the moment of each failure, so
/// configuration changes take effect on the next failure without restarting
/// anything. At most one recovery sequence runs per task at a time.
pub struct FallbackEngine {
    settings: Arc<dyn SettingsStore>,
    log: Arc<dyn FallbackLog>,
    runner: Arc<dyn ProviderRunner>,
    preserver: ContextPreserver,
    policy: RetryPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl FallbackEngine {
    /// Create an engine over the given settings store, audit log, and runner.
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        log: Arc<dyn FallbackLog>,
        runner: Arc<dyn ProviderRunner>,
    ) -> Self {
        Self {
            settings,
            log,
            runner,
            preserver: ContextPreserver::new(),
            policy: RetryPolicy::default(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replace the context preserver (e.g. to attach a summarizer).
    pub fn with_preserver(mut self, preserver: ContextPreserver) -> Self {
        self.preserver = preserver;
        self
    }

    /// Override the recovery ordering policy.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Handle a provider failure for the given run.
    ///
    /// Fatal failures propagate immediately. Retryable failures are retried
    /// in place up to `max_retries` times with a fixed delay, then the task
    /// is switched to the fallback model with preserved context. Returns the
    /// recovery outcome, or an error when recovery was impossible.
    pub async fn handle_failure(
        &self,
        run: &TaskRun,
        failure: ProviderFailure,
        history: &TaskHistory,
    ) -> Result<FallbackOutcome> {
        if !failure.kind.is_retryable() {
            warn!(
                task_id = %run.task_id,
                kind = %failure.kind,
                "Fatal provider error, no recovery attempted"
            );
            return Err(Error::fatal(failure.kind, failure.message));
        }

        let _guard = InFlightGuard::acquire(&self.in_flight, &run.task_id)?;

        // Fresh read so settings changes apply to this failure.
        let settings = self.settings.get()?;
        settings.validate()?;

        if !settings.enabled {
            info!(task_id = %run.task_id, "Fallback disabled, surfacing provider error");
            return Err(Error::retryable(failure.kind, failure.message));
        }

        let mut attempts = 0u32;

        if self.policy == RetryPolicy::RetryFirst {
            for attempt in 1..=settings.max_retries {
                tokio::time::sleep(Duration::from_millis(settings.retry_delay_ms)).await;
                attempts = attempt;

                info!(
                    task_id = %run.task_id,
                    model_id = %run.model_id,
                    attempt,
                    max_retries = settings.max_retries,
                    "Retrying run on current model"
                );

                let started = Instant::now();
                let result = self.runner.retry_same(run).await;
                let duration_ms = started.elapsed().as_millis() as u64;

                let entry = FallbackLogEntry::retry_attempt(run, &failure)
                    .finished(result.is_ok(), duration_ms);
                self.log.append(&entry)?;

                match result {
                    Ok(()) => {
                        info!(task_id = %run.task_id, attempt, "Retry succeeded");
                        return Ok(FallbackOutcome::Retried { attempts: attempt });
                    }
                    Err(retry_failure) => {
                        warn!(
                            task_id = %run.task_id,
                            attempt,
                            error = %retry_failure,
                            "Retry failed"
                        );
                    }
                }
            }
        }

        self.switch_model(run, &failure, history, &settings, attempts)
            .await
    }

    async fn switch_model(
        &self,
        run: &TaskRun,
        failure: &ProviderFailure,
        history: &TaskHistory,
        settings: &FallbackSettings,
        prior_attempts: u32,
    ) -> Result<FallbackOutcome> {
        let Some(model_id) = settings.fallback_model_id.as_deref() else {
            return Err(Error::configuration(
                "retries exhausted and no fallback model is configured",
            ));
        };
        let provider = settings.fallback_provider.as_deref().unwrap_or("");

        let context = self.preserver.preserve(history, settings).await;

        info!(
            task_id = %run.task_id,
            from_model = %run.model_id,
            to_model = %model_id,
            context_method = %context.method,
            context_tokens = context.approx_tokens,
            "Switching task to fallback model"
        );

        let started = Instant::now();
        let result = self
            .runner
            .start_fallback(run, model_id, provider, &context)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let entry = FallbackLogEntry::switch_attempt(
            run,
            failure,
            model_id,
            provider,
            context.method,
            context.approx_tokens,
        )
        .finished(result.is_ok(), duration_ms);
        self.log.append(&entry)?;

        match result {
            Ok(()) => Ok(FallbackOutcome::SwitchedModel {
                model_id: model_id.to_string(),
                provider: provider.to_string(),
                context_method: context.method,
                attempts: prior_attempts + 1,
            }),
            Err(switch_failure) => {
                warn!(
                    task_id = %run.task_id,
                    to_model = %model_id,
                    error = %switch_failure,
                    "Fallback model failed to start"
                );
                if switch_failure.kind.is_retryable() {
                    Err(Error::retryable(switch_failure.kind, switch_failure.message))
                } else {
                    Err(Error::fatal(switch_failure.kind, switch_failure.message))
                }
            }
        }
    }
}

/// Marks a task's recovery sequence as in flight; released on drop.
struct InFlightGuard {
    tasks: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl InFlightGuard {
    fn acquire(tasks: &Arc<Mutex<HashSet<String>>>, task_id: &str) -> Result<Self> {
        let mut set = tasks
            .lock()
            .map_err(|_| Error::Internal("in-flight set poisoned".to_string()))?;
        if !set.insert(task_id.to_string()) {
            return Err(Error::FallbackInFlight {
                task_id: task_id.to_string(),
            });
        }
        Ok(Self {
            tasks: Arc::clone(tasks),
            task_id: task_id.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.tasks.lock() {
            set.remove(&self.task_id);
        }
    }
}
