use thiserror::Error;

use conductor_core::{DomainError, JobId, JobType, ProviderId, RetryReason};
use conductor_infra::{FailureDisposition, QueueError, StoreError};

/// Errors surfaced by [`crate::Orchestrator`] operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no queue configured for job type {0}")]
    UnknownQueue(JobType),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(QueueError),
}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => OrchestratorError::NotFound(id),
            QueueError::InvalidState { .. } => OrchestratorError::InvalidState(err.to_string()),
            other => OrchestratorError::Queue(other),
        }
    }
}

/// A failed generation attempt, carrying what the task queue should do next.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Every configured provider is excluded or has an open circuit.
    #[error("no providers available")]
    NoProviders,

    #[error("{message}")]
    Generation {
        provider: ProviderId,
        reason: RetryReason,
        message: String,
        disposition: FailureDisposition,
    },

    /// Reading or writing the attempt log failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessError {
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            // The queue's own backoff decides; nothing was attempted here.
            ProcessError::NoProviders => FailureDisposition::Retry { delay: None },
            ProcessError::Generation { disposition, .. } => *disposition,
            ProcessError::Store(_) => FailureDisposition::Retry { delay: None },
        }
    }
}
