//! Durable task queue primitive.
//!
//! ## Design
//!
//! - Named queues; tasks keyed by the id of the job they carry
//! - Priority first (lower is more urgent), FIFO among equal priorities
//! - Delayed tasks become claimable at `ready_at`
//! - Each task carries its own attempts and backoff, applied on `fail`
//! - Completed/failed history is trimmed to the per-task retention counts
//! - Lifecycle events are broadcast to subscribers
//!
//! ## Components
//!
//! - `TaskQueue`: broker abstraction
//! - `InMemoryTaskQueue`: single-process broker for tests/dev and the worker binary

pub mod in_memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::broadcast;

use conductor_core::{BackoffPolicy, EffectiveJobOptions, Job, JobId, JobType};

pub use in_memory::InMemoryTaskQueue;

#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(JobId),

    #[error("task already enqueued: {0}")]
    Duplicate(JobId),

    #[error("task {id} is {state}, cannot {operation}")]
    InvalidState {
        id: JobId,
        state: TaskState,
        operation: &'static str,
    },

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Broker-side task state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Waiting => "waiting",
            TaskState::Delayed => "delayed",
            TaskState::Active => "active",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }
}

impl core::fmt::Display for TaskState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A task to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub id: JobId,
    pub queue: String,
    pub job_type: JobType,
    pub payload: JsonValue,
    pub priority: i32,
    pub delay: Duration,
    pub attempts: u32,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: usize,
    pub remove_on_fail: usize,
}

impl NewTask {
    /// Task carrying `job`, with the options it was submitted with.
    pub fn for_job(job: &Job, options: &EffectiveJobOptions) -> Self {
        Self {
            id: job.id,
            queue: options.queue.clone(),
            job_type: job.job_type,
            payload: job.payload.clone(),
            priority: options.priority,
            delay: options.delay,
            attempts: options.attempts,
            backoff: options.backoff,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
        }
    }
}

/// A task as held by the broker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: JobId,
    pub queue: String,
    pub job_type: JobType,
    pub payload: JsonValue,
    pub priority: i32,
    pub state: TaskState,
    /// Finished attempts (completed or failed)
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub enqueued_at: DateTime<Utc>,
    pub ready_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failed_reason: Option<String>,
    pub return_value: Option<JsonValue>,
    pub remove_on_complete: usize,
    pub remove_on_fail: usize,
    #[serde(skip)]
    sequence: u64,
}

/// What the broker should do with a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Reschedule while attempts remain. `delay` overrides the task's backoff.
    Retry { delay: Option<Duration> },
    /// Fail for good, even if attempts remain.
    Discard,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    Waiting,
    Active,
    Completed,
    Failed,
    Delayed,
    Removed,
}

/// Lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskEvent {
    pub queue: String,
    pub task_id: JobId,
    pub kind: TaskEventKind,
    pub at: DateTime<Utc>,
}

/// Per-queue counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl core::ops::AddAssign for QueueCounts {
    fn add_assign(&mut self, other: Self) {
        self.waiting += other.waiting;
        self.active += other.active;
        self.completed += other.completed;
        self.failed += other.failed;
        self.delayed += other.delayed;
    }
}

/// Task broker.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: NewTask) -> Result<(), QueueError>;

    /// Enqueue several tasks at once; relative order among them is preserved.
    async fn enqueue_bulk(&self, tasks: Vec<NewTask>) -> Result<(), QueueError>;

    /// Exclusively claim the next ready task of `queue`. `None` when empty or paused.
    async fn claim(&self, queue: &str) -> Result<Option<Task>, QueueError>;

    async fn complete(&self, id: JobId, result: JsonValue) -> Result<(), QueueError>;

    /// Record a failed attempt; returns the state the task moved to.
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<TaskState, QueueError>;

    async fn get(&self, id: JobId) -> Result<Option<Task>, QueueError>;

    /// Drop the task. Returns whether it existed.
    async fn remove(&self, id: JobId) -> Result<bool, QueueError>;

    /// Put a finished or pending task back to waiting with a fresh attempt budget.
    async fn retry(&self, id: JobId) -> Result<(), QueueError>;

    async fn pause(&self) -> Result<(), QueueError>;

    async fn resume(&self) -> Result<(), QueueError>;

    async fn is_paused(&self) -> bool;

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError>;

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent>;
}
