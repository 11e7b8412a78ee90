//! Single-process task broker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value as JsonValue;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use conductor_core::{saturating_offset, Clock, JobId, SystemClock};

use super::{
    FailureDisposition, NewTask, QueueCounts, QueueError, Task, TaskEvent, TaskEventKind,
    TaskQueue, TaskState,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct History {
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
}

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<JobId, Task>,
    history: HashMap<String, History>,
    next_sequence: u64,
    paused: bool,
}

/// In-memory broker.
///
/// All state sits behind one mutex, which is what makes claims exclusive.
#[derive(Debug)]
pub struct InMemoryTaskQueue {
    inner: Mutex<Inner>,
    events: broadcast::Sender<TaskEvent>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Mutex::new(Inner::default()),
            events,
            clock,
        }
    }

    fn emit(&self, queue: &str, task_id: JobId, kind: TaskEventKind, at: DateTime<Utc>) {
        // No subscribers is fine.
        let _ = self.events.send(TaskEvent {
            queue: queue.to_string(),
            task_id,
            kind,
            at,
        });
    }

    /// Move due delayed tasks to waiting.
    fn promote_due(&self, inner: &mut Inner, now: DateTime<Utc>) {
        for task in inner.tasks.values_mut() {
            if task.state == TaskState::Delayed && task.ready_at <= now {
                task.state = TaskState::Waiting;
                self.emit(&task.queue, task.id, TaskEventKind::Waiting, now);
            }
        }
    }

    fn insert(&self, inner: &mut Inner, new: NewTask, now: DateTime<Utc>) {
        let ready_at = saturating_offset(now, new.delay);
        let state = if ready_at > now {
            TaskState::Delayed
        } else {
            TaskState::Waiting
        };

        inner.next_sequence += 1;
        let task = Task {
            id: new.id,
            queue: new.queue,
            job_type: new.job_type,
            payload: new.payload,
            priority: new.priority,
            state,
            attempts_made: 0,
            max_attempts: new.attempts.max(1),
            backoff: new.backoff,
            enqueued_at: now,
            ready_at,
            processed_at: None,
            finished_at: None,
            failed_reason: None,
            return_value: None,
            remove_on_complete: new.remove_on_complete,
            remove_on_fail: new.remove_on_fail,
            sequence: inner.next_sequence,
        };

        let kind = match state {
            TaskState::Delayed => TaskEventKind::Delayed,
            _ => TaskEventKind::Waiting,
        };
        self.emit(&task.queue, task.id, kind, now);
        inner.tasks.insert(task.id, task);
    }

    /// Record a finished task in its queue history and trim to `keep`.
    fn retain(inner: &mut Inner, queue: &str, id: JobId, state: TaskState, keep: usize) {
        let history = inner.history.entry(queue.to_string()).or_default();
        let list = match state {
            TaskState::Completed => &mut history.completed,
            _ => &mut history.failed,
        };
        list.push_back(id);

        let mut evicted = Vec::new();
        while list.len() > keep {
            if let Some(old) = list.pop_front() {
                evicted.push(old);
            }
        }
        for old in evicted {
            inner.tasks.remove(&old);
        }
    }

    fn forget_history(inner: &mut Inner, queue: &str, id: JobId) {
        if let Some(history) = inner.history.get_mut(queue) {
            history.completed.retain(|t| *t != id);
            history.failed.retain(|t| *t != id);
        }
    }

    fn active_task<'a>(
        inner: &'a mut Inner,
        id: JobId,
        operation: &'static str,
    ) -> Result<&'a mut Task, QueueError> {
        let task = inner.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if task.state != TaskState::Active {
            return Err(QueueError::InvalidState {
                id,
                state: task.state,
                operation,
            });
        }
        Ok(task)
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: NewTask) -> Result<(), QueueError> {
        self.enqueue_bulk(vec![task]).await
    }

    async fn enqueue_bulk(&self, tasks: Vec<NewTask>) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let mut seen = std::collections::HashSet::new();
        for task in &tasks {
            if inner.tasks.contains_key(&task.id) || !seen.insert(task.id) {
                return Err(QueueError::Duplicate(task.id));
            }
        }

        let count = tasks.len();
        for task in tasks {
            self.insert(&mut inner, task, now);
        }
        debug!(count, "tasks enqueued");
        Ok(())
    }

    async fn claim(&self, queue: &str) -> Result<Option<Task>, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if inner.paused {
            return Ok(None);
        }
        self.promote_due(&mut inner, now);

        let next = inner
            .tasks
            .values()
            .filter(|t| t.queue == queue && t.state == TaskState::Waiting)
            .min_by_key(|t| (t.priority, t.sequence))
            .map(|t| t.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(None);
        };
        task.state = TaskState::Active;
        task.processed_at = Some(now);
        let claimed = task.clone();

        self.emit(queue, id, TaskEventKind::Active, now);
        Ok(Some(claimed))
    }

    async fn complete(&self, id: JobId, result: JsonValue) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let task = Self::active_task(&mut inner, id, "complete")?;
        task.state = TaskState::Completed;
        task.attempts_made += 1;
        task.finished_at = Some(now);
        task.return_value = Some(result);
        let queue = task.queue.clone();
        let keep = task.remove_on_complete;

        Self::retain(&mut inner, &queue, id, TaskState::Completed, keep);
        self.emit(&queue, id, TaskEventKind::Completed, now);
        Ok(())
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        disposition: FailureDisposition,
    ) -> Result<TaskState, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let task = Self::active_task(&mut inner, id, "fail")?;
        task.attempts_made += 1;
        task.failed_reason = Some(error.to_string());
        task.finished_at = Some(now);

        let delay = match disposition {
            FailureDisposition::Retry { .. } if task.attempts_made >= task.max_attempts => None,
            FailureDisposition::Retry { delay: Some(delay) } => Some(delay),
            FailureDisposition::Retry { delay: None } => {
                let random = rand::thread_rng().r#gen::<f64>();
                Some(task.backoff.delay_for_attempt(task.attempts_made, random))
            }
            FailureDisposition::Discard => None,
        };

        let queue = task.queue.clone();
        match delay {
            Some(delay) => {
                task.ready_at = saturating_offset(now, delay);
                task.state = if task.ready_at > now {
                    TaskState::Delayed
                } else {
                    TaskState::Waiting
                };
                let state = task.state;
                let kind = match state {
                    TaskState::Delayed => TaskEventKind::Delayed,
                    _ => TaskEventKind::Waiting,
                };
                debug!(task_id = %id, attempts_made = task.attempts_made, ?delay, "task rescheduled");
                self.emit(&queue, id, TaskEventKind::Failed, now);
                self.emit(&queue, id, kind, now);
                Ok(state)
            }
            None => {
                task.state = TaskState::Failed;
                let keep = task.remove_on_fail;
                Self::retain(&mut inner, &queue, id, TaskState::Failed, keep);
                self.emit(&queue, id, TaskEventKind::Failed, now);
                Ok(TaskState::Failed)
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Task>, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.promote_due(&mut inner, now);
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn remove(&self, id: JobId) -> Result<bool, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(task) = inner.tasks.remove(&id) else {
            return Ok(false);
        };
        Self::forget_history(&mut inner, &task.queue, id);
        self.emit(&task.queue, id, TaskEventKind::Removed, now);
        Ok(true)
    }

    async fn retry(&self, id: JobId) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        inner.next_sequence += 1;
        let sequence = inner.next_sequence;
        let task = inner.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if task.state == TaskState::Active {
            return Err(QueueError::InvalidState {
                id,
                state: task.state,
                operation: "retry",
            });
        }

        task.state = TaskState::Waiting;
        task.attempts_made = 0;
        task.ready_at = now;
        task.finished_at = None;
        task.failed_reason = None;
        task.return_value = None;
        task.sequence = sequence;
        let queue = task.queue.clone();

        Self::forget_history(&mut inner, &queue, id);
        self.emit(&queue, id, TaskEventKind::Waiting, now);
        Ok(())
    }

    async fn pause(&self) -> Result<(), QueueError> {
        self.inner.lock().await.paused = true;
        info!("task queue paused");
        Ok(())
    }

    async fn resume(&self) -> Result<(), QueueError> {
        self.inner.lock().await.paused = false;
        info!("task queue resumed");
        Ok(())
    }

    async fn is_paused(&self) -> bool {
        self.inner.lock().await.paused
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        self.promote_due(&mut inner, now);

        let mut counts = QueueCounts::default();
        for task in inner.tasks.values().filter(|t| t.queue == queue) {
            match task.state {
                TaskState::Waiting => counts.waiting += 1,
                TaskState::Delayed => counts.delayed += 1,
                TaskState::Active => counts.active += 1,
                TaskState::Completed => counts.completed += 1,
                TaskState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }
}
