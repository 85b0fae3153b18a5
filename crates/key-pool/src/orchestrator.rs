//! Retry orchestration over the credential scheduler
//!
//! One logical request becomes up to N upstream calls, N being the plan
//! length. Attempt `i` acquires a fresh key (possibly waiting for one),
//! calls the generator with plan entry `i` under the call timeout, and
//! either returns the text or, unless it was the last attempt, sleeps the
//! backoff and moves on. Failures are not classified: a bad key, a quota
//! rejection and a network error are all retried the same way.

use std::sync::Arc;
use std::time::Duration;

use provider::{GenerationError, GenerationRequest, Generator};
use tracing::{error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::plan::AttemptPlan;
use crate::scheduler::CredentialScheduler;

/// Timing knobs shared by every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Upper bound on a single upstream call.
    pub call_timeout: Duration,
    /// Pause between a failed attempt and the next one.
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(600),
            backoff: Duration::from_secs(1),
        }
    }
}

/// Successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Model of the attempt that succeeded.
    pub model: String,
    /// 1-based number of the attempt that succeeded.
    pub attempts: usize,
}

/// Runs an attempt plan against a generator, one scheduled key per attempt.
pub struct RetryOrchestrator {
    scheduler: Arc<CredentialScheduler>,
    generator: Arc<dyn Generator>,
    plan: AttemptPlan,
    settings: RetrySettings,
}

impl RetryOrchestrator {
    pub fn new(
        scheduler: Arc<CredentialScheduler>,
        generator: Arc<dyn Generator>,
        plan: AttemptPlan,
        settings: RetrySettings,
    ) -> Self {
        Self {
            scheduler,
            generator,
            plan,
            settings,
        }
    }

    pub fn plan(&self) -> &AttemptPlan {
        &self.plan
    }

    /// Generate text for `prompt`.
    ///
    /// The prompt is assumed non-empty; the HTTP layer rejects empty ones.
    /// Returns `NoAttemptsConfigured` at once for an empty plan, and
    /// `RetriesExhausted` carrying the last failure when every attempt fails.
    #[instrument(skip_all, fields(generator = self.generator.id(), attempts = self.plan.len()))]
    pub async fn generate(&self, prompt: &str) -> Result<Generation> {
        let total = self.plan.len();
        let mut last_failure: Option<GenerationError> = None;

        for (index, attempt) in self.plan.iter().enumerate() {
            let number = index + 1;
            let credential = self.scheduler.acquire().await;

            let request = GenerationRequest {
                prompt,
                model: &attempt.model,
                temperature: attempt.temperature,
                timeout: self.settings.call_timeout,
            };
            let call = self.generator.generate(&credential, request);
            let outcome = match tokio::time::timeout(self.settings.call_timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(self.settings.call_timeout)),
            };

            match outcome {
                Ok(text) => {
                    record_attempt(&attempt.model, "success");
                    info!(
                        attempt = number,
                        model = %attempt.model,
                        credential = %credential,
                        "generation succeeded"
                    );
                    return Ok(Generation {
                        text,
                        model: attempt.model.clone(),
                        attempts: number,
                    });
                }
                Err(e) => {
                    record_attempt(&attempt.model, "failure");
                    if number < total {
                        warn!(
                            attempt = number,
                            model = %attempt.model,
                            credential = %credential,
                            error = %e,
                            backoff_ms = self.settings.backoff.as_millis() as u64,
                            "generation attempt failed, retrying"
                        );
                        tokio::time::sleep(self.settings.backoff).await;
                    }
                    last_failure = Some(e);
                }
            }
        }

        match last_failure {
            Some(last) => {
                error!(attempts = total, error = %last, "all generation attempts failed");
                Err(Error::RetriesExhausted {
                    attempts: total,
                    last,
                })
            }
            None => {
                warn!("attempt plan is empty, nothing to run");
                Err(Error::NoAttemptsConfigured)
            }
        }
    }
}

fn record_attempt(model: &str, outcome: &'static str) {
    metrics::counter!(
        "generation_attempts_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
