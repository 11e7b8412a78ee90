//! Persistent stores for jobs, retry attempts and provider health.
//!
//! ## Components
//!
//! - `JobStore`: job records, mutated only through guarded transitions
//! - `RetryAttemptStore`: append-only attempt audit log
//! - `ProviderHealthStore`: per-provider reliability records with atomic updates
//!
//! Two backends implement all three traits: `InMemoryStore` (tests/dev) and
//! `PostgresStore` (durable).

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use conductor_core::{
    HealthOutcome, Job, JobId, JobTransition, JobType, ProviderHealth, ProviderId, RetryAttempt,
    TransitionOutcome,
};

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// Store error.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency retries were exhausted.
    #[error("concurrent update conflict: {0}")]
    Conflict(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Thresholds used when a provider record is created on first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure_threshold: conductor_core::health::DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_ms: conductor_core::health::DEFAULT_RECOVERY_TIMEOUT_MS,
        }
    }
}

impl HealthThresholds {
    pub fn fresh_record(&self, provider: &ProviderId) -> ProviderHealth {
        ProviderHealth::new(provider.clone())
            .with_thresholds(self.failure_threshold, self.recovery_timeout_ms)
    }
}

/// Completion figures for jobs that finished inside a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct FinishedWindow {
    pub completed: u64,
    pub failed: u64,
    /// Mean of `completed_at - started_at` over completed jobs
    pub avg_processing_ms: Option<f64>,
}

impl FinishedWindow {
    /// Completed share of finished jobs, in percent. `None` when nothing finished.
    pub fn completion_rate(&self) -> Option<f64> {
        let total = self.completed + self.failed;
        (total > 0).then(|| self.completed as f64 / total as f64 * 100.0)
    }
}

/// Job record persistence.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Insert several jobs in one unit of work.
    async fn insert_many(&self, jobs: &[Job]) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply a transition atomically against the current record.
    ///
    /// Returns the record after the call and whether the transition was applied.
    async fn transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<(Job, TransitionOutcome), StoreError>;

    /// Active jobs whose last start is at or after `since`.
    async fn count_active_started_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn finished_since(&self, since: DateTime<Utc>) -> Result<FinishedWindow, StoreError>;

    /// Delete completed, failed and cancelled jobs last updated before `cutoff`.
    /// Their retry attempts go with them.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Append-only attempt log.
#[async_trait]
pub trait RetryAttemptStore: Send + Sync {
    async fn append(&self, attempt: &RetryAttempt) -> Result<(), StoreError>;

    /// Attempts of one job ordered by attempt number.
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<RetryAttempt>, StoreError>;

    /// Failed attempts of a job type executed at or after `since`.
    async fn count_failures_since(
        &self,
        job_type: JobType,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

/// Provider health persistence.
///
/// `record` and `reset` are atomic per provider: concurrent writers never lose
/// an update.
#[async_trait]
pub trait ProviderHealthStore: Send + Sync {
    async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError>;

    async fn list(&self) -> Result<Vec<ProviderHealth>, StoreError>;

    /// Apply one outcome, creating the record with `thresholds` if it is missing.
    async fn record(
        &self,
        provider: &ProviderId,
        outcome: &HealthOutcome,
        thresholds: HealthThresholds,
        now: DateTime<Utc>,
    ) -> Result<ProviderHealth, StoreError>;

    /// Close the breaker. `None` if the provider has no record.
    async fn reset(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError>;
}
