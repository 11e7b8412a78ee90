//! Generation processor: runs one attempt of a generation job.
//!
//! Picks a provider, calls the generator under a timeout, reports the outcome to
//! health tracking and, on failure, appends an attempt record and decides how the
//! task queue should reschedule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use conductor_core::{
    saturating_offset, AttemptId, Clock, Job, ProviderDescriptor, ProviderId, ProviderRegistry,
    RetryAttempt, RetryReason,
};
use conductor_infra::{FailureDisposition, RetryAttemptStore};

use crate::circuit::CircuitBreaker;
use crate::error::ProcessError;
use crate::health::HealthTracker;
use crate::retry::{RetryContext, RetryStrategy};
use crate::runner::{HandlerError, JobHandler};

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// What a generator returns on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOutput {
    pub content: JsonValue,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Content generation capability, called once per attempt.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(
        &self,
        provider: &ProviderDescriptor,
        payload: &JsonValue,
    ) -> Result<GenerationOutput, GenerationError>;
}

pub struct GenerationProcessor {
    generator: Arc<dyn ContentGenerator>,
    registry: Arc<ProviderRegistry>,
    circuit: Arc<CircuitBreaker>,
    health: Arc<HealthTracker>,
    retry: Arc<RetryStrategy>,
    attempts: Arc<dyn RetryAttemptStore>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl GenerationProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        generator: Arc<dyn ContentGenerator>,
        registry: Arc<ProviderRegistry>,
        circuit: Arc<CircuitBreaker>,
        health: Arc<HealthTracker>,
        retry: Arc<RetryStrategy>,
        attempts: Arc<dyn RetryAttemptStore>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            generator,
            registry,
            circuit,
            health,
            retry,
            attempts,
            clock,
            timeout,
        }
    }

    /// First configured provider with a closed circuit.
    async fn first_available(&self) -> Option<ProviderId> {
        for provider in self.registry.ids() {
            if !self.circuit.is_open(provider).await {
                return Some(provider.clone());
            }
        }
        None
    }

    /// Run one attempt of `job`. Returns the result payload on success.
    #[instrument(skip(self, job), fields(job_id = %job.id, attempt = job.attempt + 1))]
    pub async fn process(&self, job: &Job) -> Result<JsonValue, ProcessError> {
        let history = self.attempts.list_for_job(job.id).await?;

        let provider = if job.attempt > 0 {
            let last = history.last().and_then(|a| a.provider.as_ref());
            self.retry.select_next_provider(last).await
        } else {
            self.first_available().await
        };

        let Some((provider, descriptor)) =
            provider.and_then(|p| self.registry.get(&p).map(|d| (p, d)))
        else {
            warn!("no providers available");
            self.record_unavailable(job).await?;
            return Err(ProcessError::NoProviders);
        };

        debug!(provider = %provider, "generating");
        let started_at = self.clock.now();
        let started = Instant::now();

        let outcome = match tokio::time::timeout(
            self.timeout,
            self.generator.generate(descriptor, &job.payload),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GenerationError::new(format!(
                "generation timeout after {}ms",
                self.timeout.as_millis()
            ))),
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                self.health.record_success(&provider, elapsed).await;
                let completed_at = self.clock.now();
                info!(provider = %provider, elapsed_ms = elapsed.as_millis() as u64, "generation succeeded");

                Ok(json!({
                    "success": true,
                    "provider": provider,
                    "content": output.content,
                    "timing": {
                        "started_at": started_at,
                        "completed_at": completed_at,
                        "response_time_ms": elapsed.as_millis() as u64,
                    },
                    "token_usage": output.token_usage,
                }))
            }
            Err(err) => {
                self.health.record_failure(&provider, &err.message).await;
                self.fail_attempt(job, history, provider, err.message).await
            }
        }
    }

    /// Audit row for an attempt that found every provider excluded. The task
    /// queue's own backoff schedules the next try, so no delay is recorded.
    async fn record_unavailable(&self, job: &Job) -> Result<(), ProcessError> {
        let now = self.clock.now();
        let attempt = RetryAttempt {
            id: AttemptId::new(),
            job_id: job.id,
            job_type: job.job_type,
            attempt_number: job.attempt + 1,
            provider: None,
            reason: RetryReason::CircuitBreakerOpen,
            error: Some(ProcessError::NoProviders.to_string()),
            delay_ms: 0,
            scheduled_at: now,
            executed_at: now,
            was_successful: false,
            circuit_states: self.circuit.open_flags().await,
            system_load: self.retry.system_load().await,
        };
        self.attempts.append(&attempt).await?;
        Ok(())
    }

    async fn fail_attempt(
        &self,
        job: &Job,
        mut history: Vec<RetryAttempt>,
        provider: ProviderId,
        message: String,
    ) -> Result<JsonValue, ProcessError> {
        let reason = RetryReason::classify(&message);
        let now = self.clock.now();

        let delay = {
            let ctx = RetryContext {
                job_type: job.job_type,
                attempts: &history,
                max_attempts: job.max_attempts,
                last_error: Some(&message),
                last_provider: Some(&provider),
            };
            self.retry.calculate_delay(&ctx).await
        };

        let attempt = RetryAttempt {
            id: AttemptId::new(),
            job_id: job.id,
            job_type: job.job_type,
            attempt_number: job.attempt + 1,
            provider: Some(provider.clone()),
            reason,
            error: Some(message.clone()),
            delay_ms: delay.as_millis() as u64,
            scheduled_at: saturating_offset(now, delay),
            executed_at: now,
            was_successful: false,
            circuit_states: self.circuit.open_flags().await,
            system_load: self.retry.system_load().await,
        };
        self.attempts.append(&attempt).await?;
        history.push(attempt);

        let retry = {
            let ctx = RetryContext {
                job_type: job.job_type,
                attempts: &history,
                max_attempts: job.max_attempts,
                last_error: Some(&message),
                last_provider: Some(&provider),
            };
            self.retry.should_retry(&ctx).await
        };

        let disposition = if retry {
            FailureDisposition::Retry { delay: Some(delay) }
        } else {
            FailureDisposition::Discard
        };

        warn!(
            provider = %provider,
            reason = reason.as_str(),
            error = %message,
            retry,
            delay_ms = delay.as_millis() as u64,
            "generation failed"
        );

        Err(ProcessError::Generation {
            provider,
            reason,
            message,
            disposition,
        })
    }
}

#[async_trait]
impl JobHandler for GenerationProcessor {
    async fn handle(&self, job: &Job) -> Result<JsonValue, HandlerError> {
        Ok(self.process(job).await?)
    }
}
