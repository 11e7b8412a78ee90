//! Queue runner: claims tasks, dispatches them to handlers, and keeps the job
//! record in step with the task queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use conductor_core::{
    Clock, Job, JobId, JobStatus, JobTransition, JobType, QueueDefaults, TransitionOutcome,
};
use conductor_infra::config::RunnerSettings;
use conductor_infra::{
    FailureDisposition, JobStore, QueueError, StoreError, TaskQueue, TaskState,
};

use crate::error::{OrchestratorError, ProcessError};

/// A failed handler run and what the queue should do about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    pub message: String,
    pub disposition: FailureDisposition,
}

impl HandlerError {
    /// Retry with the queue's own backoff.
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            disposition: FailureDisposition::Retry { delay: None },
        }
    }

    /// Fail permanently.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            disposition: FailureDisposition::Discard,
        }
    }
}

impl From<ProcessError> for HandlerError {
    fn from(err: ProcessError) -> Self {
        Self {
            disposition: err.disposition(),
            message: err.to_string(),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::retry(err.to_string())
    }
}

/// Work for one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JsonValue, HandlerError>;
}

/// What one claim-and-run step did.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(JobId),
    /// Failed; the queue rescheduled it.
    Retrying { id: JobId, state: TaskState },
    /// Failed for good.
    Failed(JobId),
    /// The job was cancelled, finished or missing; nothing ran.
    Skipped(JobId),
}

/// Runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunnerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn record(&self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Completed(_) => {
                self.succeeded.fetch_add(1, Ordering::Relaxed);
            }
            StepOutcome::Retrying { .. } => {
                self.retried.fetch_add(1, Ordering::Relaxed);
            }
            StepOutcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            StepOutcome::Skipped(_) => return,
        }
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, uptime: Duration) -> RunnerStats {
        RunnerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            uptime_secs: uptime.as_secs(),
        }
    }
}

pub struct Runner {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    queues: BTreeMap<JobType, QueueDefaults>,
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    poll_jitter: Duration,
    counters: Counters,
}

impl Runner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        queues: BTreeMap<JobType, QueueDefaults>,
        clock: Arc<dyn Clock>,
        settings: &RunnerSettings,
    ) -> Self {
        Self {
            jobs,
            queue,
            queues,
            handlers: HashMap::new(),
            clock,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            poll_jitter: Duration::from_millis(settings.jitter_ms),
            counters: Counters::default(),
        }
    }

    /// Register the handler for a job type, replacing any previous one.
    pub fn register_handler(&mut self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type, handler);
    }

    pub fn has_handler(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    pub fn stats(&self) -> RunnerStats {
        self.counters.snapshot(Duration::ZERO)
    }

    /// Claim and run at most one task from `queue`.
    pub async fn process_next(&self, queue: &str) -> Result<Option<StepOutcome>, OrchestratorError> {
        let Some(task) = self.queue.claim(queue).await? else {
            return Ok(None);
        };
        let id = task.id;

        let activated = self
            .jobs
            .transition(id, JobTransition::Activate { at: self.clock.now() })
            .await;
        let job = match activated {
            Ok((job, _)) => job,
            Err(StoreError::NotFound(_)) => {
                warn!(job_id = %id, "task has no job record, discarding");
                self.settle(self.queue.fail(id, "job record missing", FailureDisposition::Discard).await)?;
                return Ok(Some(StepOutcome::Skipped(id)));
            }
            Err(e) => return Err(self.release(id, e).await),
        };

        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            debug!(job_id = %id, status = %job.status, "job already settled, dropping task");
            self.queue.remove(id).await?;
            return Ok(Some(StepOutcome::Skipped(id)));
        }

        self.counters.running.fetch_add(1, Ordering::Relaxed);
        let result = match self.handlers.get(&job.job_type) {
            Some(handler) => handler.handle(&job).await,
            None => Err(HandlerError::fatal(format!(
                "no handler registered for job type {}",
                job.job_type
            ))),
        };
        self.counters.running.fetch_sub(1, Ordering::Relaxed);

        let outcome = match result {
            Ok(value) => self.finish_success(&job, value).await?,
            Err(err) => self.finish_failure(&job, err).await?,
        };
        self.counters.record(&outcome);
        Ok(Some(outcome))
    }

    async fn finish_success(&self, job: &Job, value: JsonValue) -> Result<StepOutcome, OrchestratorError> {
        let complete = JobTransition::Complete {
            result: value.clone(),
            at: self.clock.now(),
        };
        if let Some(TransitionOutcome::Ignored) = self.record(job.id, complete).await {
            return self.drop_cancelled(job).await;
        }

        if self.settle(self.queue.complete(job.id, value).await)?.is_none() {
            return Ok(StepOutcome::Skipped(job.id));
        }
        debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
        Ok(StepOutcome::Completed(job.id))
    }

    async fn finish_failure(&self, job: &Job, err: HandlerError) -> Result<StepOutcome, OrchestratorError> {
        let fail = JobTransition::Fail {
            error: err.message.clone(),
            at: self.clock.now(),
        };
        if let Some(TransitionOutcome::Ignored) = self.record(job.id, fail).await {
            return self.drop_cancelled(job).await;
        }

        let Some(state) =
            self.settle(self.queue.fail(job.id, &err.message, err.disposition).await)?
        else {
            return Ok(StepOutcome::Skipped(job.id));
        };

        match state {
            TaskState::Waiting | TaskState::Delayed => {
                let scheduled_at = match self.queue.get(job.id).await? {
                    Some(task) if state == TaskState::Delayed => Some(task.ready_at),
                    _ => None,
                };
                let requeue = JobTransition::Requeue {
                    scheduled_at,
                    at: self.clock.now(),
                };
                self.record(job.id, requeue).await;
                debug!(job_id = %job.id, error = %err.message, state = %state, "job rescheduled");
                Ok(StepOutcome::Retrying { id: job.id, state })
            }
            _ => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %err.message, "job failed");
                Ok(StepOutcome::Failed(job.id))
            }
        }
    }

    /// Apply a transition after the handler ran. The task state decides the
    /// outcome from here on, so a store error is logged and left for read-time
    /// reconciliation instead of stranding the claimed task.
    async fn record(&self, id: JobId, transition: JobTransition) -> Option<TransitionOutcome> {
        let name = transition.name();
        match self.jobs.transition(id, transition).await {
            Ok((_, outcome)) => Some(outcome),
            Err(e) => {
                warn!(job_id = %id, transition = name, error = %e, "job record not updated");
                None
            }
        }
    }

    /// The job was cancelled while its handler ran.
    async fn drop_cancelled(&self, job: &Job) -> Result<StepOutcome, OrchestratorError> {
        debug!(job_id = %job.id, "job cancelled while running, dropping task");
        self.queue.remove(job.id).await?;
        Ok(StepOutcome::Skipped(job.id))
    }

    /// Hand a claimed task back to the queue when its job could not be activated.
    async fn release(&self, id: JobId, err: StoreError) -> OrchestratorError {
        let reason = format!("job store unavailable: {err}");
        let released = self
            .queue
            .fail(id, &reason, FailureDisposition::Retry { delay: None })
            .await;
        match released {
            Ok(state) => warn!(job_id = %id, error = %err, state = %state, "task released"),
            Err(e) => error!(job_id = %id, error = %e, "failed to release task"),
        }
        err.into()
    }

    /// A task removed while its job ran is not an error.
    fn settle<T>(&self, result: Result<T, QueueError>) -> Result<Option<T>, OrchestratorError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(QueueError::NotFound(id)) => {
                debug!(job_id = %id, "task removed while running");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn poll_delay(&self) -> Duration {
        let jitter_ms = self.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.poll_interval;
        }
        self.poll_interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Start `concurrency` polling workers for every configured queue.
    pub fn spawn(self: Arc<Self>) -> RunHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        for (job_type, defaults) in &self.queues {
            if !self.has_handler(*job_type) {
                warn!(queue = %defaults.name, job_type = %job_type, "no handler registered, tasks will fail");
            }
            for slot in 0..defaults.concurrency.max(1) {
                let runner = self.clone();
                let queue = defaults.name.clone();
                let shutdown = shutdown_rx.clone();
                workers.push(tokio::spawn(async move {
                    runner.worker_loop(queue, slot, shutdown).await;
                }));
            }
        }

        info!(workers = workers.len(), "runner started");
        RunHandle {
            shutdown: shutdown_tx,
            workers,
            runner: self,
            started: Instant::now(),
        }
    }

    async fn worker_loop(&self, queue: String, slot: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(queue = %queue, slot, "worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_next(&queue).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(queue = %queue, error = %e, "failed to process task"),
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.poll_delay()) => {}
            }
        }
        debug!(queue = %queue, slot, "worker stopped");
    }
}

/// Handle to control spawned workers.
pub struct RunHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    runner: Arc<Runner>,
    started: Instant,
}

impl RunHandle {
    pub fn stats(&self) -> RunnerStats {
        self.runner.counters.snapshot(self.started.elapsed())
    }

    /// Stop polling and wait for in-flight tasks to finish.
    pub async fn shutdown(self) -> RunnerStats {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task panicked");
            }
        }
        let stats = self.runner.counters.snapshot(self.started.elapsed());
        info!(processed = stats.jobs_processed, "runner stopped");
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conductor_core::{JobOptions, ManualClock};
    use conductor_infra::config::default_queues;
    use conductor_infra::{InMemoryStore, InMemoryTaskQueue, NewTask};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &Job) -> Result<JsonValue, HandlerError> {
            Ok(json!({ "echo": job.payload }))
        }
    }

    struct Flaky {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for Flaky {
        async fn handle(&self, _: &Job) -> Result<JsonValue, HandlerError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(HandlerError {
                    message: "upstream 503".to_string(),
                    disposition: FailureDisposition::Retry {
                        delay: Some(Duration::ZERO),
                    },
                });
            }
            Ok(json!("ok"))
        }
    }

    /// Cancels its own job mid-run, as a concurrent `remove` would.
    struct SelfCancelling {
        store: Arc<InMemoryStore>,
    }

    #[async_trait]
    impl JobHandler for SelfCancelling {
        async fn handle(&self, job: &Job) -> Result<JsonValue, HandlerError> {
            self.store
                .transition(job.id, JobTransition::Cancel { at: Utc::now() })
                .await?;
            Ok(json!("too late"))
        }
    }

    /// Job store whose next `failures` transitions named `on` fail.
    struct UnreliableStore {
        inner: Arc<InMemoryStore>,
        on: &'static str,
        failures: AtomicU32,
    }

    #[async_trait]
    impl JobStore for UnreliableStore {
        async fn insert(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.insert(job).await
        }

        async fn insert_many(&self, jobs: &[Job]) -> Result<(), StoreError> {
            self.inner.insert_many(jobs).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
            JobStore::get(&*self.inner, id).await
        }

        async fn transition(
            &self,
            id: JobId,
            transition: JobTransition,
        ) -> Result<(Job, TransitionOutcome), StoreError> {
            if transition.name() == self.on
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                return Err(StoreError::Storage("connection reset".to_string()));
            }
            self.inner.transition(id, transition).await
        }

        async fn count_active_started_since(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.inner.count_active_started_since(since).await
        }

        async fn finished_since(
            &self,
            since: chrono::DateTime<Utc>,
        ) -> Result<conductor_infra::FinishedWindow, StoreError> {
            self.inner.finished_since(since).await
        }

        async fn purge_finished_before(&self, cutoff: chrono::DateTime<Utc>) -> Result<u64, StoreError> {
            self.inner.purge_finished_before(cutoff).await
        }
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryTaskQueue>,
        clock: Arc<ManualClock>,
        runner: Runner,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        fixture_with(store.clone(), store)
    }

    /// Runner writing through `jobs`, with `store` as the backing records.
    fn fixture_with(store: Arc<InMemoryStore>, jobs: Arc<dyn JobStore>) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(InMemoryTaskQueue::with_clock(clock.clone()));
        let runner = Runner::new(
            jobs,
            queue.clone(),
            default_queues(),
            clock.clone(),
            &RunnerSettings::default(),
        );
        Fixture {
            store,
            queue,
            clock,
            runner,
        }
    }

    async fn submit(f: &Fixture, job_type: JobType, options: JobOptions) -> Job {
        let defaults = &default_queues()[&job_type];
        let opts = options.resolve(defaults).unwrap();
        let job = Job::new(JobId::new(), job_type, json!({"n": 1}), &opts, f.clock.now());
        f.store.insert(&job).await.unwrap();
        f.queue.enqueue(NewTask::for_job(&job, &opts)).await.unwrap();
        job
    }

    #[tokio::test]
    async fn completes_job_and_task() {
        let mut f = fixture();
        f.runner.register_handler(JobType::Generation, Arc::new(Echo));
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;

        let outcome = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Completed(job.id)));

        let stored = JobStore::get(&*f.store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.result, Some(json!({"echo": {"n": 1}})));

        let task = f.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(f.runner.stats().jobs_succeeded, 1);
        assert_eq!(f.runner.process_next(&job.queue).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failed_attempt_is_rescheduled_then_succeeds() {
        let mut f = fixture();
        f.runner.register_handler(
            JobType::Generation,
            Arc::new(Flaky {
                failures_left: AtomicU32::new(1),
            }),
        );
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;

        let first = f.runner.process_next(&job.queue).await.unwrap();
        assert!(matches!(first, Some(StepOutcome::Retrying { .. })));
        let stored = JobStore::get(&*f.store, job.id).await.unwrap().unwrap();
        assert!(matches!(stored.status, JobStatus::Waiting | JobStatus::Delayed));
        assert_eq!(stored.attempt, 1);
        assert_eq!(stored.last_error.as_deref(), Some("upstream 503"));

        f.clock.advance(chrono::Duration::milliseconds(1));
        let second = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(second, Some(StepOutcome::Completed(job.id)));
        let stored = JobStore::get(&*f.store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.attempt, 2);
    }

    #[tokio::test]
    async fn missing_handler_fails_permanently() {
        let f = fixture();
        let job = submit(&f, JobType::Notification, JobOptions::default()).await;

        let outcome = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Failed(job.id)));

        let stored = JobStore::get(&*f.store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.last_error.unwrap().contains("no handler registered"));
    }

    #[tokio::test]
    async fn cancelled_job_is_skipped() {
        let mut f = fixture();
        f.runner.register_handler(JobType::Generation, Arc::new(Echo));
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;
        f.store
            .transition(job.id, JobTransition::Cancel { at: f.clock.now() })
            .await
            .unwrap();

        let outcome = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Skipped(job.id)));
        assert!(f.queue.get(job.id).await.unwrap().is_none());
        assert_eq!(f.runner.stats().jobs_processed, 0);
    }

    fn unreliable(on: &'static str) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let jobs = Arc::new(UnreliableStore {
            inner: store.clone(),
            on,
            failures: AtomicU32::new(1),
        });
        fixture_with(store, jobs)
    }

    #[tokio::test]
    async fn activation_failure_hands_task_back() {
        let mut f = unreliable("activate");
        f.runner.register_handler(JobType::Generation, Arc::new(Echo));
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;

        let err = f.runner.process_next(&job.queue).await.unwrap_err();
        assert!(err.to_string().contains("connection reset"));
        let task = f.queue.get(job.id).await.unwrap().unwrap();
        assert!(matches!(task.state, TaskState::Waiting | TaskState::Delayed));

        f.clock.advance(chrono::Duration::hours(1));
        let outcome = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Completed(job.id)));
        let stored = JobStore::get(&*f.store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn completion_write_failure_still_completes_task() {
        let mut f = unreliable("complete");
        f.runner.register_handler(JobType::Generation, Arc::new(Echo));
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;

        let outcome = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Completed(job.id)));

        let task = f.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Completed);
        assert_eq!(task.return_value, Some(json!({"echo": {"n": 1}})));
        assert_eq!(f.runner.process_next(&job.queue).await.unwrap(), None);
    }

    #[tokio::test]
    async fn failure_write_failure_still_reschedules_task() {
        let mut f = unreliable("fail");
        f.runner.register_handler(
            JobType::Generation,
            Arc::new(Flaky {
                failures_left: AtomicU32::new(1),
            }),
        );
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;

        let first = f.runner.process_next(&job.queue).await.unwrap();
        assert!(matches!(first, Some(StepOutcome::Retrying { .. })));

        f.clock.advance(chrono::Duration::milliseconds(1));
        let second = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(second, Some(StepOutcome::Completed(job.id)));
    }

    #[tokio::test]
    async fn job_cancelled_while_running_is_not_completed() {
        let mut f = fixture();
        f.runner.register_handler(
            JobType::Generation,
            Arc::new(SelfCancelling {
                store: f.store.clone(),
            }),
        );
        let job = submit(&f, JobType::Generation, JobOptions::default()).await;

        let outcome = f.runner.process_next(&job.queue).await.unwrap();
        assert_eq!(outcome, Some(StepOutcome::Skipped(job.id)));

        let stored = JobStore::get(&*f.store, job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.result, None);
        assert!(f.queue.get(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn spawned_workers_drain_queue_and_stop() {
        let clock = Arc::new(conductor_core::SystemClock);
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryTaskQueue::new());
        let settings = RunnerSettings {
            poll_interval_ms: 5,
            jitter_ms: 0,
        };
        let mut runner = Runner::new(store.clone(), queue.clone(), default_queues(), clock.clone(), &settings);
        runner.register_handler(JobType::Generation, Arc::new(Echo));

        let defaults = &default_queues()[&JobType::Generation];
        let opts = JobOptions::default().resolve(defaults).unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let job = Job::new(JobId::new(), JobType::Generation, json!({}), &opts, Utc::now());
            store.insert(&job).await.unwrap();
            queue.enqueue(NewTask::for_job(&job, &opts)).await.unwrap();
            ids.push(job.id);
        }

        let handle = Arc::new(runner).spawn();
        for _ in 0..200 {
            if handle.stats().jobs_succeeded == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_succeeded, 3);

        for id in ids {
            let job = JobStore::get(&*store, id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    }
}
