//! In-memory store for tests/dev.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use conductor_core::{
    HealthOutcome, Job, JobId, JobStatus, JobTransition, JobType, ProviderHealth, ProviderId,
    RetryAttempt, TransitionOutcome,
};

use super::{
    FinishedWindow, HealthThresholds, JobStore, ProviderHealthStore, RetryAttemptStore,
    StoreError,
};

/// Implements every store trait over process memory.
///
/// Each provider record is mutated while holding the health write lock, so
/// concurrent `record` calls are serialized.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    attempts: RwLock<HashMap<JobId, Vec<RetryAttempt>>>,
    health: RwLock<HashMap<ProviderId, ProviderHealth>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.insert_many(std::slice::from_ref(job)).await
    }

    async fn insert_many(&self, batch: &[Job]) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if let Some(dup) = batch.iter().find(|j| jobs.contains_key(&j.id)) {
            return Err(StoreError::AlreadyExists(dup.id.to_string()));
        }
        for job in batch {
            jobs.insert(job.id, job.clone());
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<(Job, TransitionOutcome), StoreError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        let outcome = job.apply(transition);
        Ok((job.clone(), outcome))
    }

    async fn count_active_started_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let jobs = self.jobs.read().await;
        let count = jobs
            .values()
            .filter(|j| j.status == JobStatus::Active && j.started_at.is_some_and(|at| at >= since))
            .count();
        Ok(count as u64)
    }

    async fn finished_since(&self, since: DateTime<Utc>) -> Result<FinishedWindow, StoreError> {
        let jobs = self.jobs.read().await;
        let mut window = FinishedWindow::default();
        let mut total_ms = 0.0;

        for job in jobs.values() {
            if !job.completed_at.is_some_and(|at| at >= since) {
                continue;
            }
            match job.status {
                JobStatus::Completed => {
                    window.completed += 1;
                    if let Some(elapsed) = job.processing_time() {
                        total_ms += elapsed.num_milliseconds() as f64;
                    }
                }
                JobStatus::Failed => window.failed += 1,
                _ => {}
            }
        }

        if window.completed > 0 {
            window.avg_processing_ms = Some(total_ms / window.completed as f64);
        }
        Ok(window)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().await;
        let mut attempts = self.attempts.write().await;

        let doomed: Vec<JobId> = jobs
            .values()
            .filter(|j| j.status.is_terminal() && j.updated_at < cutoff)
            .map(|j| j.id)
            .collect();

        for id in &doomed {
            jobs.remove(id);
            attempts.remove(id);
        }
        Ok(doomed.len() as u64)
    }
}

#[async_trait]
impl RetryAttemptStore for InMemoryStore {
    async fn append(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
        if !self.jobs.read().await.contains_key(&attempt.job_id) {
            return Err(StoreError::NotFound(format!("job {}", attempt.job_id)));
        }

        let mut attempts = self.attempts.write().await;
        let list = attempts.entry(attempt.job_id).or_default();
        if list.iter().any(|a| a.id == attempt.id) {
            return Err(StoreError::AlreadyExists(attempt.id.to_string()));
        }
        list.push(attempt.clone());
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<RetryAttempt>, StoreError> {
        let attempts = self.attempts.read().await;
        let mut list = attempts.get(&job_id).cloned().unwrap_or_default();
        list.sort_by_key(|a| a.attempt_number);
        Ok(list)
    }

    async fn count_failures_since(
        &self,
        job_type: JobType,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let attempts = self.attempts.read().await;
        let count = attempts
            .values()
            .flatten()
            .filter(|a| a.job_type == job_type && !a.was_successful && a.executed_at >= since)
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl ProviderHealthStore for InMemoryStore {
    async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError> {
        Ok(self.health.read().await.get(provider).cloned())
    }

    async fn list(&self) -> Result<Vec<ProviderHealth>, StoreError> {
        let health = self.health.read().await;
        let mut list: Vec<_> = health.values().cloned().collect();
        list.sort_by(|a, b| a.provider_id.as_str().cmp(b.provider_id.as_str()));
        Ok(list)
    }

    async fn record(
        &self,
        provider: &ProviderId,
        outcome: &HealthOutcome,
        thresholds: HealthThresholds,
        now: DateTime<Utc>,
    ) -> Result<ProviderHealth, StoreError> {
        let mut health = self.health.write().await;
        let entry = health
            .entry(provider.clone())
            .or_insert_with(|| thresholds.fresh_record(provider));
        entry.apply(outcome, now);
        Ok(entry.clone())
    }

    async fn reset(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError> {
        let mut health = self.health.write().await;
        Ok(health.get_mut(provider).map(|record| {
            record.reset();
            record.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use conductor_core::{
        AttemptId, BackoffPolicy, HealthStatus, JobOptions, QueueDefaults, RetryReason,
    };

    fn defaults() -> QueueDefaults {
        QueueDefaults {
            name: "content-generation".to_string(),
            attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(2)),
            priority: 1,
            remove_on_complete: 100,
            remove_on_fail: 50,
            concurrency: 1,
        }
    }

    fn job(now: DateTime<Utc>) -> Job {
        let options = JobOptions::default().resolve(&defaults()).unwrap();
        Job::new(JobId::new(), JobType::Generation, serde_json::json!({}), &options, now)
    }

    fn failed_attempt(job: &Job, number: u32, at: DateTime<Utc>) -> RetryAttempt {
        RetryAttempt {
            id: AttemptId::new(),
            job_id: job.id,
            job_type: job.job_type,
            attempt_number: number,
            provider: Some(ProviderId::new("alpha")),
            reason: RetryReason::Timeout,
            error: Some("timeout".to_string()),
            delay_ms: 2000,
            scheduled_at: at,
            executed_at: at,
            was_successful: false,
            circuit_states: BTreeMap::new(),
            system_load: 0.0,
        }
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let store = InMemoryStore::new();
        let job = job(Utc::now());
        store.insert(&job).await.unwrap();

        let err = store.insert(&job).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn transition_of_missing_job_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .transition(JobId::new(), JobTransition::Activate { at: Utc::now() })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_job_ignores_completion() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let job = job(now);
        store.insert(&job).await.unwrap();
        store.transition(job.id, JobTransition::Activate { at: now }).await.unwrap();
        store.transition(job.id, JobTransition::Cancel { at: now }).await.unwrap();

        let (after, outcome) = store
            .transition(
                job.id,
                JobTransition::Complete {
                    result: serde_json::json!({"success": true}),
                    at: now,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Ignored);
        assert_eq!(after.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn attempts_are_listed_in_order_and_counted_by_type() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let job = job(now);
        store.insert(&job).await.unwrap();

        for n in [2, 1, 3] {
            store.append(&failed_attempt(&job, n, now)).await.unwrap();
        }

        let numbers: Vec<_> = store
            .list_for_job(job.id)
            .await
            .unwrap()
            .iter()
            .map(|a| a.attempt_number)
            .collect();
        assert_eq!(numbers, [1, 2, 3]);

        let since = now - chrono::Duration::minutes(15);
        assert_eq!(store.count_failures_since(JobType::Generation, since).await.unwrap(), 3);
        assert_eq!(store.count_failures_since(JobType::Analytics, since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn attempt_for_unknown_job_is_rejected() {
        let store = InMemoryStore::new();
        let orphan = job(Utc::now());
        let err = store.append(&failed_attempt(&orphan, 1, Utc::now())).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn purge_cascades_to_attempts() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let job = job(now);
        store.insert(&job).await.unwrap();
        store.append(&failed_attempt(&job, 1, now)).await.unwrap();
        store.transition(job.id, JobTransition::Activate { at: now }).await.unwrap();
        store
            .transition(
                job.id,
                JobTransition::Fail {
                    error: "boom".to_string(),
                    at: now,
                },
            )
            .await
            .unwrap();

        let purged = store
            .purge_finished_before(now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(JobStore::get(&store, job.id).await.unwrap().is_none());
        assert!(store.list_for_job(job.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn finished_window_reports_rate_and_processing_time() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let done = job(now);
        let failed = job(now);
        store.insert_many(&[done.clone(), failed.clone()]).await.unwrap();

        store.transition(done.id, JobTransition::Activate { at: now }).await.unwrap();
        store
            .transition(
                done.id,
                JobTransition::Complete {
                    result: serde_json::Value::Null,
                    at: now + chrono::Duration::milliseconds(400),
                },
            )
            .await
            .unwrap();
        store.transition(failed.id, JobTransition::Activate { at: now }).await.unwrap();
        store
            .transition(
                failed.id,
                JobTransition::Fail {
                    error: "boom".to_string(),
                    at: now,
                },
            )
            .await
            .unwrap();

        let window = store.finished_since(now - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(window.completed, 1);
        assert_eq!(window.failed, 1);
        assert_eq!(window.completion_rate(), Some(50.0));
        assert_eq!(window.avg_processing_ms, Some(400.0));
    }

    #[tokio::test]
    async fn concurrent_failures_are_not_lost() {
        let store = InMemoryStore::arc();
        let provider = ProviderId::new("alpha");
        let thresholds = HealthThresholds {
            failure_threshold: 1000,
            recovery_timeout_ms: 60_000,
        };

        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            let provider = provider.clone();
            handles.push(tokio::spawn(async move {
                let outcome = HealthOutcome::Failure {
                    error: format!("error {i}"),
                };
                store.record(&provider, &outcome, thresholds, Utc::now()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let health = ProviderHealthStore::get(&*store, &provider).await.unwrap().unwrap();
        assert_eq!(health.failed_requests, 50);
        assert_eq!(health.consecutive_failures, 50);
        assert_eq!(health.version, 50);
    }

    #[tokio::test]
    async fn reset_of_unknown_provider_is_none() {
        let store = InMemoryStore::new();
        assert!(store.reset(&ProviderId::new("ghost")).await.unwrap().is_none());

        let provider = ProviderId::new("alpha");
        for _ in 0..5 {
            store
                .record(
                    &provider,
                    &HealthOutcome::Failure {
                        error: "boom".to_string(),
                    },
                    HealthThresholds::default(),
                    Utc::now(),
                )
                .await
                .unwrap();
        }
        let reset = store.reset(&provider).await.unwrap().unwrap();
        assert_eq!(reset.status, HealthStatus::Healthy);
        assert_eq!(reset.consecutive_failures, 0);
    }
}
