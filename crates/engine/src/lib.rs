//! `conductor-engine`: orchestration services.
//!
//! - `HealthTracker`: per-provider reliability bookkeeping
//! - `CircuitBreaker`: cached open/half-open/closed view over provider health
//! - `RetryStrategy`: retry admission, delay and provider selection
//! - `GenerationProcessor`: one attempt of a generation job
//! - `Runner`: worker pool draining the task queues
//! - `Orchestrator`: submit / query / steer jobs

pub mod circuit;
pub mod error;
pub mod handlers;
pub mod health;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod runner;
pub mod services;

pub use circuit::{CircuitBreaker, CircuitLookup};
pub use error::{OrchestratorError, ProcessError};
pub use handlers::{CleanupHandler, HealthCheckHandler, RetryFailedHandler};
pub use health::{circuit_key, HealthTracker};
pub use orchestrator::{JobRequest, Orchestrator, OrchestratorResult, QueueHealth};
pub use processor::{
    ContentGenerator, GenerationError, GenerationOutput, GenerationProcessor, TokenUsage,
};
pub use retry::{
    FixedJitter, JitterSource, LoadEstimator, RecentActivityLoad, RetryContext, RetryStrategy,
    ThreadRngJitter,
};
pub use runner::{HandlerError, JobHandler, RunHandle, Runner, RunnerStats, StepOutcome};
pub use services::{Backends, Services};
