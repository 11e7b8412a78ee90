//! Public entry point: submit jobs, query and steer them, inspect providers.
//!
//! The task queue is the source of truth for where a job is in its lifecycle.
//! Reads reconcile the persisted record against the live task through the job
//! transition guard, so a cancelled or completed job never moves again.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use conductor_core::{
    CircuitBreakerState, Clock, EffectiveJobOptions, Job, JobId, JobOptions, JobStatus, JobTransition, JobType,
    ProviderHealth, ProviderId, QueueDefaults,
};
use conductor_infra::{JobStore, NewTask, QueueCounts, Task, TaskEvent, TaskQueue, TaskState};

use crate::circuit::{CircuitBreaker, CircuitLookup};
use crate::error::OrchestratorError;
use crate::health::HealthTracker;

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Window for the completion figures in [`QueueHealth`].
const HEALTH_WINDOW_HOURS: i64 = 1;

/// One job of a batch submission.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_type: JobType,
    pub payload: JsonValue,
    pub options: JobOptions,
}

impl JobRequest {
    pub fn new(job_type: JobType, payload: JsonValue) -> Self {
        Self {
            job_type,
            payload,
            options: JobOptions::default(),
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

/// Snapshot of queue activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueHealth {
    pub totals: QueueCounts,
    pub queues: BTreeMap<String, QueueCounts>,
    /// Percent of jobs finished in the last hour that completed.
    pub completion_rate: Option<f64>,
    pub avg_processing_ms: Option<f64>,
    pub paused: bool,
}

pub struct Orchestrator {
    queues: BTreeMap<JobType, QueueDefaults>,
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    health: Arc<HealthTracker>,
    circuit: Arc<CircuitBreaker>,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        queues: BTreeMap<JobType, QueueDefaults>,
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        health: Arc<HealthTracker>,
        circuit: Arc<CircuitBreaker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queues,
            jobs,
            queue,
            health,
            circuit,
            clock,
        }
    }

    fn resolve(&self, job_type: JobType, options: &JobOptions) -> OrchestratorResult<EffectiveJobOptions> {
        let defaults = self
            .queues
            .get(&job_type)
            .ok_or(OrchestratorError::UnknownQueue(job_type))?;
        Ok(options.resolve(defaults)?)
    }

    /// Persist a job and enqueue its task. Returns the new job id.
    #[instrument(skip(self, job_type, payload, options), fields(job_type = %job_type))]
    pub async fn submit(
        &self,
        job_type: JobType,
        payload: JsonValue,
        options: JobOptions,
    ) -> OrchestratorResult<JobId> {
        let opts = self.resolve(job_type, &options)?;
        let job = Job::new(JobId::new(), job_type, payload, &opts, self.clock.now());

        self.jobs.insert(&job).await?;
        if let Err(e) = self.queue.enqueue(NewTask::for_job(&job, &opts)).await {
            self.abandon(job.id).await;
            return Err(e.into());
        }

        info!(job_id = %job.id, queue = %opts.queue, status = %job.status, "job submitted");
        Ok(job.id)
    }

    /// Submit several jobs. Tasks are enqueued in one bulk call per queue, keeping
    /// the relative order of each queue's jobs. Ids come back in request order.
    ///
    /// All or nothing: if any queue rejects its tasks, tasks already enqueued for
    /// this batch are removed and every job of the batch is cancelled.
    #[instrument(skip(self, requests), fields(count = requests.len()))]
    pub async fn submit_batch(&self, requests: Vec<JobRequest>) -> OrchestratorResult<Vec<JobId>> {
        let now = self.clock.now();
        let mut jobs = Vec::with_capacity(requests.len());
        let mut by_queue: BTreeMap<String, Vec<NewTask>> = BTreeMap::new();

        for request in requests {
            let opts = self.resolve(request.job_type, &request.options)?;
            let job = Job::new(JobId::new(), request.job_type, request.payload, &opts, now);
            by_queue
                .entry(opts.queue.clone())
                .or_default()
                .push(NewTask::for_job(&job, &opts));
            jobs.push(job);
        }

        self.jobs.insert_many(&jobs).await?;
        let mut enqueued: Vec<JobId> = Vec::with_capacity(jobs.len());
        for (queue, tasks) in by_queue {
            let ids: Vec<JobId> = tasks.iter().map(|t| t.id).collect();
            if let Err(e) = self.queue.enqueue_bulk(tasks).await {
                warn!(queue = %queue, error = %e, "batch enqueue failed; rolling back");
                self.roll_back_batch(&enqueued, &jobs).await;
                return Err(e.into());
            }
            debug!(queue = %queue, "batch enqueued");
            enqueued.extend(ids);
        }

        info!(count = jobs.len(), "batch submitted");
        Ok(jobs.into_iter().map(|j| j.id).collect())
    }

    async fn roll_back_batch(&self, enqueued: &[JobId], jobs: &[Job]) {
        for id in enqueued {
            if let Err(e) = self.queue.remove(*id).await {
                warn!(job_id = %id, error = %e, "failed to remove task of rolled back batch");
            }
        }
        for job in jobs {
            self.abandon(job.id).await;
        }
    }

    /// Cancel a job whose task never made it into the queue.
    async fn abandon(&self, id: JobId) {
        let cancel = JobTransition::Cancel { at: self.clock.now() };
        if let Err(e) = self.jobs.transition(id, cancel).await {
            warn!(job_id = %id, error = %e, "failed to cancel unqueued job");
        }
    }

    /// The job record, reconciled against its live task.
    pub async fn job(&self, id: JobId) -> OrchestratorResult<Job> {
        let job = self
            .jobs
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))?;
        match self.queue.get(id).await? {
            Some(task) => self.reconcile(job, &task).await,
            None => Ok(job),
        }
    }

    pub async fn status(&self, id: JobId) -> OrchestratorResult<JobStatus> {
        Ok(self.job(id).await?.status)
    }

    /// Result payload of a completed job; `None` until it completes.
    pub async fn result(&self, id: JobId) -> OrchestratorResult<Option<JsonValue>> {
        let job = self.job(id).await?;
        Ok(match job.status {
            JobStatus::Completed => job.result,
            _ => None,
        })
    }

    async fn reconcile(&self, job: Job, task: &Task) -> OrchestratorResult<Job> {
        let at = self.clock.now();
        let transition = match (task.state, job.status) {
            (TaskState::Active, JobStatus::Waiting | JobStatus::Delayed) => JobTransition::Activate {
                at: task.processed_at.unwrap_or(at),
            },
            (TaskState::Completed, status) if status != JobStatus::Completed => {
                JobTransition::Complete {
                    result: task.return_value.clone().unwrap_or(JsonValue::Null),
                    at: task.finished_at.unwrap_or(at),
                }
            }
            (TaskState::Failed, JobStatus::Active | JobStatus::Waiting | JobStatus::Delayed) => {
                JobTransition::Fail {
                    error: task
                        .failed_reason
                        .clone()
                        .unwrap_or_else(|| "task failed".to_string()),
                    at: task.finished_at.unwrap_or(at),
                }
            }
            (TaskState::Waiting, JobStatus::Failed | JobStatus::Active | JobStatus::Delayed) => {
                JobTransition::Requeue {
                    scheduled_at: None,
                    at,
                }
            }
            (TaskState::Delayed, status) if status != JobStatus::Delayed => JobTransition::Requeue {
                scheduled_at: Some(task.ready_at),
                at,
            },
            _ => return Ok(job),
        };

        let name = transition.name();
        let (job, outcome) = self.jobs.transition(job.id, transition).await?;
        debug!(job_id = %job.id, transition = name, ?outcome, task_state = %task.state, "job reconciled");
        Ok(job)
    }

    /// Put a job back into its queue with a fresh task attempt budget.
    #[instrument(skip(self))]
    pub async fn retry(&self, id: JobId) -> OrchestratorResult<()> {
        let job = self
            .jobs
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            return Err(OrchestratorError::InvalidState(format!(
                "job {id} is {}, cannot retry",
                job.status
            )));
        }

        self.queue.retry(id).await?;
        self.jobs
            .transition(
                id,
                JobTransition::Requeue {
                    scheduled_at: None,
                    at: self.clock.now(),
                },
            )
            .await?;
        info!(job_id = %id, "job retried");
        Ok(())
    }

    /// Mark the job cancelled, then drop its task.
    ///
    /// The job is cancelled first so a runner finishing the task concurrently
    /// sees the cancellation and its completion is ignored. A job that already
    /// completed stays completed.
    #[instrument(skip(self))]
    pub async fn remove(&self, id: JobId) -> OrchestratorResult<()> {
        let (job, outcome) = self
            .jobs
            .transition(id, JobTransition::Cancel { at: self.clock.now() })
            .await
            .map_err(|e| match e {
                conductor_infra::StoreError::NotFound(_) => OrchestratorError::NotFound(id),
                other => other.into(),
            })?;
        let removed = self.queue.remove(id).await?;
        info!(job_id = %id, task_removed = removed, status = %job.status, ?outcome, "job removed");
        Ok(())
    }

    /// Counts across all configured queues and completion figures for the last hour.
    pub async fn health(&self) -> OrchestratorResult<QueueHealth> {
        let mut totals = QueueCounts::default();
        let mut queues = BTreeMap::new();
        for defaults in self.queues.values() {
            let counts = self.queue.counts(&defaults.name).await?;
            totals += counts;
            queues.insert(defaults.name.clone(), counts);
        }

        let since = self.clock.now() - chrono::Duration::hours(HEALTH_WINDOW_HOURS);
        let window = self.jobs.finished_since(since).await?;

        Ok(QueueHealth {
            totals,
            queues,
            completion_rate: window.completion_rate(),
            avg_processing_ms: window.avg_processing_ms,
            paused: self.queue.is_paused().await,
        })
    }

    pub async fn pause(&self) -> OrchestratorResult<()> {
        self.queue.pause().await?;
        info!("orchestrator paused");
        Ok(())
    }

    pub async fn resume(&self) -> OrchestratorResult<()> {
        self.queue.resume().await?;
        info!("orchestrator resumed");
        Ok(())
    }

    /// Task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.queue.subscribe()
    }

    pub async fn provider_health(&self) -> Vec<ProviderHealth> {
        self.health.all().await
    }

    pub async fn circuit_states(&self) -> BTreeMap<ProviderId, CircuitBreakerState> {
        self.circuit.states().await
    }

    pub async fn inspect_circuit(&self, provider: &ProviderId) -> CircuitLookup {
        self.circuit.inspect(provider).await
    }

    /// Force a provider's circuit closed.
    pub async fn reset_circuit(&self, provider: &ProviderId) -> OrchestratorResult<Option<ProviderHealth>> {
        Ok(self.circuit.reset(provider).await?)
    }
}
