//! Job model, queue defaults, and the job status state machine.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::id::JobId;

/// Job type, used to route a job to its queue.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Generation,
    Notification,
    Analytics,
    Cleanup,
    HealthCheck,
    RetryFailed,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Generation,
        JobType::Notification,
        JobType::Analytics,
        JobType::Cleanup,
        JobType::HealthCheck,
        JobType::RetryFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Generation => "generation",
            JobType::Notification => "notification",
            JobType::Analytics => "analytics",
            JobType::Cleanup => "cleanup",
            JobType::HealthCheck => "health_check",
            JobType::RetryFailed => "retry_failed",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::UnknownJobType(s.to_string()))
    }
}

/// Job lifecycle status. Exactly one is current at any time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Waiting,
    /// Claimed by a worker
    Active,
    /// Finished successfully
    Completed,
    /// Last attempt failed
    Failed,
    /// Waiting, but not before `scheduled_at`
    Delayed,
    /// Removed by a caller
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Delayed => "delayed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "delayed" => Ok(JobStatus::Delayed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!("invalid job status: {other}"))),
        }
    }
}

/// Backoff kind for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// base * 2^(attempt - 1), capped at `max_delay_ms`
    #[default]
    Exponential,
    /// Same delay between every attempt
    Fixed,
}

/// Backoff configuration carried by each job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    #[serde(rename = "type", default)]
    pub kind: BackoffKind,
    /// Base delay in milliseconds
    #[serde(rename = "delay")]
    pub delay_ms: u64,
    /// Upper bound in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add up to 10% random jitter
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl BackoffPolicy {
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay_ms: delay.as_millis() as u64,
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay_ms: delay.as_millis() as u64,
            max_delay_ms: delay.as_millis() as u64,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = max_delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before attempt `attempt + 1`, given `attempt` attempts already made (1-indexed).
    ///
    /// `random` is a sample in `[0, 1)`; it only matters when `jitter` is set.
    pub fn delay_for_attempt(&self, attempt: u32, random: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.delay_ms as f64;
        let max_ms = self.max_delay_ms.max(self.delay_ms) as f64;

        let delay_ms = match self.kind {
            BackoffKind::Fixed => base_ms,
            BackoffKind::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
                (base_ms * exp).min(max_ms)
            }
        };

        let jitter_ms = if self.jitter {
            delay_ms * 0.1 * random.clamp(0.0, 1.0)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter_ms).floor() as u64)
    }
}

/// Per-queue defaults. Pure data, loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefaults {
    /// Queue name in the task queue
    pub name: String,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    /// Lower is more urgent
    pub priority: i32,
    /// Completed tasks to keep in history
    pub remove_on_complete: usize,
    /// Failed tasks to keep in history
    pub remove_on_fail: usize,
    /// Concurrent workers for the queue
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

/// Longest delay a submission may ask for.
pub const MAX_JOB_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Per-submission overrides of [`QueueDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub priority: Option<i32>,
    /// Explicit delay before the job becomes eligible, in milliseconds
    pub delay_ms: Option<u64>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    pub remove_on_complete: Option<usize>,
    pub remove_on_fail: Option<usize>,
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Merge these overrides over the queue defaults.
    pub fn resolve(&self, defaults: &QueueDefaults) -> Result<EffectiveJobOptions, DomainError> {
        let attempts = self.attempts.unwrap_or(defaults.attempts);
        if attempts == 0 {
            return Err(DomainError::validation("attempts must be at least 1"));
        }
        let delay = Duration::from_millis(self.delay_ms.unwrap_or(0));
        if delay > MAX_JOB_DELAY {
            return Err(DomainError::validation(format!(
                "delay of {}ms exceeds the maximum of {}ms",
                delay.as_millis(),
                MAX_JOB_DELAY.as_millis()
            )));
        }

        Ok(EffectiveJobOptions {
            queue: defaults.name.clone(),
            priority: self.priority.unwrap_or(defaults.priority),
            delay,
            attempts,
            backoff: self.backoff.unwrap_or(defaults.backoff),
            remove_on_complete: self.remove_on_complete.unwrap_or(defaults.remove_on_complete),
            remove_on_fail: self.remove_on_fail.unwrap_or(defaults.remove_on_fail),
        })
    }
}

/// Options after merging overrides with queue defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectiveJobOptions {
    pub queue: String,
    pub priority: i32,
    pub delay: Duration,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: usize,
    pub remove_on_fail: usize,
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Queue the job was routed to
    pub queue: String,
    pub status: JobStatus,
    pub priority: i32,
    /// Opaque to the orchestrator
    pub payload: JsonValue,
    /// Attempts made so far
    pub attempt: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<JsonValue>,
}

/// A requested status change.
#[derive(Debug, Clone, PartialEq)]
pub enum JobTransition {
    /// A worker claimed the job.
    Activate { at: DateTime<Utc> },
    /// The attempt succeeded.
    Complete { result: JsonValue, at: DateTime<Utc> },
    /// The attempt failed.
    Fail { error: String, at: DateTime<Utc> },
    /// Back to the queue, optionally not before `scheduled_at`.
    Requeue {
        scheduled_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    },
    /// Removed by a caller.
    Cancel { at: DateTime<Utc> },
}

impl JobTransition {
    pub fn name(&self) -> &'static str {
        match self {
            JobTransition::Activate { .. } => "activate",
            JobTransition::Complete { .. } => "complete",
            JobTransition::Fail { .. } => "fail",
            JobTransition::Requeue { .. } => "requeue",
            JobTransition::Cancel { .. } => "cancel",
        }
    }
}

/// Whether a transition changed the record.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The job was in a state that absorbs this transition.
    Ignored,
}

impl Job {
    /// Create a new job record from resolved options.
    pub fn new(
        id: JobId,
        job_type: JobType,
        payload: JsonValue,
        options: &EffectiveJobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let (status, scheduled_at) = if options.delay.is_zero() {
            (JobStatus::Waiting, None)
        } else {
            let at = crate::clock::saturating_offset(now, options.delay);
            (JobStatus::Delayed, Some(at))
        };

        Self {
            id,
            job_type,
            queue: options.queue.clone(),
            status,
            priority: options.priority,
            payload,
            attempt: 0,
            max_attempts: options.attempts,
            backoff: options.backoff,
            created_at: now,
            updated_at: now,
            scheduled_at,
            started_at: None,
            completed_at: None,
            last_error: None,
            result: None,
        }
    }

    /// Whether the current status accepts `transition`.
    ///
    /// Completed and cancelled jobs absorb everything. A failed job only moves
    /// again when its task is re-delivered, requeued, or cancelled.
    pub fn accepts(&self, transition: &JobTransition) -> bool {
        match (self.status, transition) {
            (JobStatus::Completed | JobStatus::Cancelled, _) => false,
            (JobStatus::Failed, JobTransition::Complete { .. } | JobTransition::Fail { .. }) => {
                false
            }
            (JobStatus::Active, JobTransition::Activate { .. }) => false,
            _ => true,
        }
    }

    /// Apply a transition if the current status accepts it.
    pub fn apply(&mut self, transition: JobTransition) -> TransitionOutcome {
        if !self.accepts(&transition) {
            return TransitionOutcome::Ignored;
        }

        match transition {
            JobTransition::Activate { at } => {
                self.status = JobStatus::Active;
                self.started_at = Some(at);
                self.completed_at = None;
                self.updated_at = at;
            }
            JobTransition::Complete { result, at } => {
                self.status = JobStatus::Completed;
                self.attempt += 1;
                self.result = Some(result);
                self.completed_at = Some(at);
                self.updated_at = at;
            }
            JobTransition::Fail { error, at } => {
                self.status = JobStatus::Failed;
                self.attempt += 1;
                self.last_error = Some(error);
                self.completed_at = Some(at);
                self.updated_at = at;
            }
            JobTransition::Requeue { scheduled_at, at } => {
                match scheduled_at {
                    Some(when) if when > at => {
                        self.status = JobStatus::Delayed;
                        self.scheduled_at = Some(when);
                    }
                    _ => {
                        self.status = JobStatus::Waiting;
                        self.scheduled_at = None;
                    }
                }
                self.updated_at = at;
            }
            JobTransition::Cancel { at } => {
                self.status = JobStatus::Cancelled;
                self.updated_at = at;
            }
        }

        TransitionOutcome::Applied
    }

    /// Processing time of the last finished attempt.
    pub fn processing_time(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}
