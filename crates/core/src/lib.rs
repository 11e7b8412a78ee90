//! `conductor-core`: domain building blocks for job orchestration.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job state machine, retry-attempt records, and provider
//! health arithmetic.

pub mod attempt;
pub mod clock;
pub mod error;
pub mod health;
pub mod id;
pub mod job;
pub mod provider;

pub use attempt::{RetryAttempt, RetryReason};
pub use clock::{checked_offset, saturating_offset, Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use health::{CircuitBreakerState, HealthOutcome, HealthStatus, ProviderHealth, RecentError};
pub use id::{AttemptId, JobId, ProviderId};
pub use job::{
    BackoffKind, BackoffPolicy, EffectiveJobOptions, Job, JobOptions, JobStatus, JobTransition,
    JobType, QueueDefaults, TransitionOutcome, MAX_JOB_DELAY,
};
pub use provider::{ProviderDescriptor, ProviderRegistry};
