//! Handlers for the housekeeping job types.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::info;

use conductor_core::{Clock, Job, JobId};
use conductor_infra::JobStore;

use crate::circuit::CircuitBreaker;
use crate::error::OrchestratorError;
use crate::health::HealthTracker;
use crate::orchestrator::Orchestrator;
use crate::runner::{HandlerError, JobHandler};

const DEFAULT_RETENTION_HOURS: i64 = 24;

fn parse_payload<T: for<'de> Deserialize<'de>>(job: &Job) -> Result<T, HandlerError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| HandlerError::fatal(format!("validation error: invalid payload: {e}")))
}

#[derive(Debug, Default, Deserialize)]
struct CleanupPayload {
    older_than_hours: Option<i64>,
}

/// Purges finished jobs (and their attempt rows) older than the retention window.
pub struct CleanupHandler {
    jobs: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl CleanupHandler {
    pub fn new(jobs: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { jobs, clock }
    }
}

#[async_trait]
impl JobHandler for CleanupHandler {
    async fn handle(&self, job: &Job) -> Result<JsonValue, HandlerError> {
        let payload: CleanupPayload = if job.payload.is_null() {
            CleanupPayload::default()
        } else {
            parse_payload(job)?
        };
        let hours = payload.older_than_hours.unwrap_or(DEFAULT_RETENTION_HOURS);
        if hours < 0 {
            return Err(HandlerError::fatal("validation error: older_than_hours must not be negative"));
        }

        let cutoff = self.clock.now() - chrono::Duration::hours(hours);
        let purged = self.jobs.purge_finished_before(cutoff).await?;
        info!(purged, older_than_hours = hours, "finished jobs purged");
        Ok(json!({ "purged": purged, "cutoff": cutoff }))
    }
}

/// Reports circuit states and provider health.
pub struct HealthCheckHandler {
    circuit: Arc<CircuitBreaker>,
    health: Arc<HealthTracker>,
}

impl HealthCheckHandler {
    pub fn new(circuit: Arc<CircuitBreaker>, health: Arc<HealthTracker>) -> Self {
        Self { circuit, health }
    }
}

#[async_trait]
impl JobHandler for HealthCheckHandler {
    async fn handle(&self, _job: &Job) -> Result<JsonValue, HandlerError> {
        let circuits = self.circuit.states().await;
        let providers = self.health.all().await;
        let open = circuits.values().filter(|state| state.is_open).count();
        info!(providers = circuits.len(), open_circuits = open, "health check");

        Ok(json!({
            "circuits": circuits,
            "providers": providers,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RetryFailedPayload {
    job_id: JobId,
}

/// Re-queues the job named in the payload.
pub struct RetryFailedHandler {
    orchestrator: Arc<Orchestrator>,
}

impl RetryFailedHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl JobHandler for RetryFailedHandler {
    async fn handle(&self, job: &Job) -> Result<JsonValue, HandlerError> {
        let payload: RetryFailedPayload = parse_payload(job)?;
        match self.orchestrator.retry(payload.job_id).await {
            Ok(()) => Ok(json!({ "retried": payload.job_id })),
            Err(e @ (OrchestratorError::NotFound(_) | OrchestratorError::InvalidState(_))) => {
                Err(HandlerError::fatal(e.to_string()))
            }
            Err(e) => Err(HandlerError::retry(e.to_string())),
        }
    }
}
