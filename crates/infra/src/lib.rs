//! Infrastructure layer: configuration, persistent stores, cache and task queue.

pub mod cache;
pub mod config;
pub mod queue;
pub mod store;

pub use cache::{Cache, CacheError, InMemoryCache};
pub use config::{ConfigError, OrchestratorConfig};
pub use queue::{
    FailureDisposition, InMemoryTaskQueue, NewTask, QueueCounts, QueueError, Task, TaskEvent,
    TaskEventKind, TaskQueue, TaskState,
};
pub use store::{
    FinishedWindow, HealthThresholds, InMemoryStore, JobStore, PostgresStore,
    ProviderHealthStore, RetryAttemptStore, StoreError,
};
