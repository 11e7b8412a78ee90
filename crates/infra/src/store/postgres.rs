//! Postgres-backed store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (foreign key violation) | `23503` | `NotFound` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Other | N/A | `Storage` |
//!
//! ## Atomic updates
//!
//! Job transitions lock the row (`SELECT ... FOR UPDATE`) and apply the guard in
//! Rust inside one transaction. Provider health uses insert-if-absent followed by
//! a versioned compare-and-swap (`UPDATE ... WHERE version = $n`), retried on
//! conflict up to [`MAX_CAS_RETRIES`] times.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, Row};
use rand::Rng;
use tracing::{debug, error, instrument};
use uuid::Uuid;

use conductor_core::{
    AttemptId, BackoffPolicy, HealthOutcome, HealthStatus, Job, JobId, JobStatus, JobTransition,
    JobType, ProviderHealth, ProviderId, RecentError, RetryAttempt, RetryReason,
    TransitionOutcome,
};

use super::{
    FinishedWindow, HealthThresholds, JobStore, ProviderHealthStore, RetryAttemptStore,
    StoreError,
};

pub const MAX_CAS_RETRIES: usize = 8;

/// Base pause between compare-and-swap retries; doubles per conflict.
const CAS_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Pause before retry number `attempt + 1`: exponential from
/// [`CAS_BACKOFF_BASE`] plus up to one base of jitter (`random` in `[0, 1]`).
fn cas_backoff(attempt: usize, random: f64) -> Duration {
    let exponential = CAS_BACKOFF_BASE * (1_u32 << attempt.min(10));
    exponential + CAS_BACKOFF_BASE.mul_f64(random.clamp(0.0, 1.0))
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        job_type TEXT NOT NULL,
        queue TEXT NOT NULL,
        status TEXT NOT NULL,
        priority INTEGER NOT NULL,
        payload JSONB NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        backoff JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        scheduled_at TIMESTAMPTZ,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        last_error TEXT,
        result JSONB
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_status_started_idx ON jobs (status, started_at)",
    "CREATE INDEX IF NOT EXISTS jobs_completed_idx ON jobs (completed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS retry_attempts (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        job_type TEXT NOT NULL,
        attempt_number INTEGER NOT NULL,
        provider TEXT,
        reason TEXT NOT NULL,
        error TEXT,
        delay_ms BIGINT NOT NULL,
        scheduled_at TIMESTAMPTZ NOT NULL,
        executed_at TIMESTAMPTZ NOT NULL,
        was_successful BOOLEAN NOT NULL,
        circuit_states JSONB NOT NULL,
        system_load DOUBLE PRECISION NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS retry_attempts_job_idx ON retry_attempts (job_id, attempt_number)",
    "CREATE INDEX IF NOT EXISTS retry_attempts_type_idx ON retry_attempts (job_type, executed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS provider_health (
        provider_id TEXT PRIMARY KEY,
        total_requests BIGINT NOT NULL DEFAULT 0,
        successful_requests BIGINT NOT NULL DEFAULT 0,
        failed_requests BIGINT NOT NULL DEFAULT 0,
        success_rate DOUBLE PRECISION NOT NULL DEFAULT 100,
        avg_response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
        min_response_time_ms BIGINT,
        max_response_time_ms BIGINT,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        last_failure_at TIMESTAMPTZ,
        last_success_at TIMESTAMPTZ,
        circuit_opened_at TIMESTAMPTZ,
        status TEXT NOT NULL,
        failure_threshold INTEGER NOT NULL,
        recovery_timeout_ms BIGINT NOT NULL,
        recent_errors JSONB NOT NULL DEFAULT '[]',
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
];

/// Postgres implementation of every store trait.
///
/// Uses the SQLx connection pool, which is `Send + Sync` and safe to share.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create tables and indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        debug!("store schema ready");
        Ok(())
    }

    async fn insert_health_if_absent(&self, record: &ProviderHealth) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO provider_health (provider_id, status, failure_threshold, recovery_timeout_ms)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (provider_id) DO NOTHING
            "#,
        )
        .bind(record.provider_id.as_str())
        .bind(record.status.as_str())
        .bind(record.failure_threshold as i32)
        .bind(record.recovery_timeout_ms as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_provider_health", e))?;
        Ok(())
    }

    /// Write `record` if the row still has `expected_version`. Returns whether it did.
    async fn compare_and_swap_health(
        &self,
        record: &ProviderHealth,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE provider_health SET
                total_requests = $2,
                successful_requests = $3,
                failed_requests = $4,
                success_rate = $5,
                avg_response_time_ms = $6,
                min_response_time_ms = $7,
                max_response_time_ms = $8,
                consecutive_failures = $9,
                last_failure_at = $10,
                last_success_at = $11,
                circuit_opened_at = $12,
                status = $13,
                recent_errors = $14,
                version = $15
            WHERE provider_id = $1 AND version = $16
            "#,
        )
        .bind(record.provider_id.as_str())
        .bind(record.total_requests as i64)
        .bind(record.successful_requests as i64)
        .bind(record.failed_requests as i64)
        .bind(record.success_rate)
        .bind(record.avg_response_time_ms)
        .bind(record.min_response_time_ms.map(|v| v as i64))
        .bind(record.max_response_time_ms.map(|v| v as i64))
        .bind(record.consecutive_failures as i32)
        .bind(record.last_failure_at)
        .bind(record.last_success_at)
        .bind(record.circuit_opened_at)
        .bind(record.status.as_str())
        .bind(Json(&record.recent_errors))
        .bind(record.version as i64)
        .bind(expected_version as i64)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_provider_health", e))?;

        Ok(result.rows_affected() == 1)
    }

    /// Read, mutate in Rust, write back with a version check; retry on conflict.
    async fn update_health<F>(
        &self,
        provider: &ProviderId,
        mut mutate: F,
    ) -> Result<Option<ProviderHealth>, StoreError>
    where
        F: FnMut(&mut ProviderHealth) + Send,
    {
        for attempt in 0..MAX_CAS_RETRIES {
            let Some(mut record) = ProviderHealthStore::get(self, provider).await? else {
                return Ok(None);
            };
            let expected = record.version;
            mutate(&mut record);

            if self.compare_and_swap_health(&record, expected).await? {
                return Ok(Some(record));
            }
            if attempt + 1 < MAX_CAS_RETRIES {
                let pause = cas_backoff(attempt, rand::thread_rng().r#gen::<f64>());
                debug!(provider = %provider, attempt, ?pause, "provider health version conflict, retrying");
                tokio::time::sleep(pause).await;
            }
        }

        error!(provider = %provider, retries = MAX_CAS_RETRIES, "provider health update lost after repeated conflicts");
        Err(StoreError::Conflict(format!("provider health {provider}")))
    }
}

const JOB_COLUMNS: &str = "id, job_type, queue, status, priority, payload, attempt, max_attempts, \
     backoff, created_at, updated_at, scheduled_at, started_at, completed_at, last_error, result";

#[async_trait]
impl JobStore for PostgresStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type), err)]
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.insert_many(std::slice::from_ref(job)).await
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()), err)]
    async fn insert_many(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for job in jobs {
            sqlx::query(
                r#"
                INSERT INTO jobs (
                    id, job_type, queue, status, priority, payload, attempt, max_attempts,
                    backoff, created_at, updated_at, scheduled_at, started_at, completed_at,
                    last_error, result
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.job_type.as_str())
            .bind(&job.queue)
            .bind(job.status.as_str())
            .bind(job.priority)
            .bind(&job.payload)
            .bind(job.attempt as i32)
            .bind(job.max_attempts as i32)
            .bind(Json(job.backoff))
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.scheduled_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(&job.last_error)
            .bind(&job.result)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::AlreadyExists(format!("job {}", job.id))
                } else {
                    map_sqlx_error("insert_job", e)
                }
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| job_from_row(&row)).transpose()
    }

    #[instrument(skip(self, transition), fields(job_id = %id, transition = transition.name()), err)]
    async fn transition(
        &self,
        id: JobId,
        transition: JobTransition,
    ) -> Result<(Job, TransitionOutcome), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?
        .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;

        let mut job = job_from_row(&row)?;
        let outcome = job.apply(transition);

        if outcome == TransitionOutcome::Applied {
            sqlx::query(
                r#"
                UPDATE jobs SET
                    status = $2,
                    attempt = $3,
                    updated_at = $4,
                    scheduled_at = $5,
                    started_at = $6,
                    completed_at = $7,
                    last_error = $8,
                    result = $9
                WHERE id = $1
                "#,
            )
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(job.attempt as i32)
            .bind(job.updated_at)
            .bind(job.scheduled_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(&job.last_error)
            .bind(&job.result)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok((job, outcome))
    }

    async fn count_active_started_since(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE status = 'active' AND started_at >= $1",
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_active", e))?;
        Ok(count as u64)
    }

    async fn finished_since(&self, since: DateTime<Utc>) -> Result<FinishedWindow, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                CAST(
                    AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000)
                        FILTER (WHERE status = 'completed' AND started_at IS NOT NULL)
                    AS DOUBLE PRECISION
                ) AS avg_ms
            FROM jobs
            WHERE completed_at >= $1
            "#,
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finished_since", e))?;

        let completed: i64 = row.try_get("completed").map_err(corrupt)?;
        let failed: i64 = row.try_get("failed").map_err(corrupt)?;
        let avg_processing_ms: Option<f64> = row.try_get("avg_ms").map_err(corrupt)?;

        Ok(FinishedWindow {
            completed: completed as u64,
            failed: failed as u64,
            avg_processing_ms,
        })
    }

    #[instrument(skip(self), err)]
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_jobs", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RetryAttemptStore for PostgresStore {
    #[instrument(
        skip(self, attempt),
        fields(job_id = %attempt.job_id, attempt_number = attempt.attempt_number),
        err
    )]
    async fn append(&self, attempt: &RetryAttempt) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO retry_attempts (
                id, job_id, job_type, attempt_number, provider, reason, error, delay_ms,
                scheduled_at, executed_at, was_successful, circuit_states, system_load
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(attempt.id.as_uuid())
        .bind(attempt.job_id.as_uuid())
        .bind(attempt.job_type.as_str())
        .bind(attempt.attempt_number as i32)
        .bind(attempt.provider.as_ref().map(ProviderId::as_str))
        .bind(attempt.reason.as_str())
        .bind(&attempt.error)
        .bind(attempt.delay_ms as i64)
        .bind(attempt.scheduled_at)
        .bind(attempt.executed_at)
        .bind(attempt.was_successful)
        .bind(Json(&attempt.circuit_states))
        .bind(attempt.system_load)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_attempt", e))?;
        Ok(())
    }

    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<RetryAttempt>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, job_type, attempt_number, provider, reason, error, delay_ms,
                   scheduled_at, executed_at, was_successful, circuit_states, system_load
            FROM retry_attempts
            WHERE job_id = $1
            ORDER BY attempt_number ASC, executed_at ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_attempts", e))?;

        rows.iter().map(attempt_from_row).collect()
    }

    async fn count_failures_since(
        &self,
        job_type: JobType,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM retry_attempts
            WHERE job_type = $1 AND was_successful = FALSE AND executed_at >= $2
            "#,
        )
        .bind(job_type.as_str())
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_failures", e))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl ProviderHealthStore for PostgresStore {
    async fn get(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError> {
        let row = sqlx::query("SELECT * FROM provider_health WHERE provider_id = $1")
            .bind(provider.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_provider_health", e))?;

        row.map(|row| {
            HealthRow::from_row(&row)
                .map_err(corrupt)
                .and_then(ProviderHealth::try_from)
        })
        .transpose()
    }

    async fn list(&self) -> Result<Vec<ProviderHealth>, StoreError> {
        let rows = sqlx::query("SELECT * FROM provider_health ORDER BY provider_id")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_provider_health", e))?;

        rows.iter()
            .map(|row| {
                HealthRow::from_row(row)
                    .map_err(corrupt)
                    .and_then(ProviderHealth::try_from)
            })
            .collect()
    }

    #[instrument(skip(self, outcome, thresholds), fields(provider = %provider), err)]
    async fn record(
        &self,
        provider: &ProviderId,
        outcome: &HealthOutcome,
        thresholds: HealthThresholds,
        now: DateTime<Utc>,
    ) -> Result<ProviderHealth, StoreError> {
        self.insert_health_if_absent(&thresholds.fresh_record(provider))
            .await?;

        self.update_health(provider, |record| record.apply(outcome, now))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("provider {provider}")))
    }

    #[instrument(skip(self), fields(provider = %provider), err)]
    async fn reset(&self, provider: &ProviderId) -> Result<Option<ProviderHealth>, StoreError> {
        self.update_health(provider, ProviderHealth::reset).await
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.try_get("job_type").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempt: i32 = row.try_get("attempt").map_err(corrupt)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(corrupt)?;
    let backoff: Json<BackoffPolicy> = row.try_get("backoff").map_err(corrupt)?;
    let id: Uuid = row.try_get("id").map_err(corrupt)?;

    Ok(Job {
        id: JobId::from_uuid(id),
        job_type: job_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        queue: row.try_get("queue").map_err(corrupt)?,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        priority: row.try_get("priority").map_err(corrupt)?,
        payload: row.try_get("payload").map_err(corrupt)?,
        attempt: attempt.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        backoff: backoff.0,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
        scheduled_at: row.try_get("scheduled_at").map_err(corrupt)?,
        started_at: row.try_get("started_at").map_err(corrupt)?,
        completed_at: row.try_get("completed_at").map_err(corrupt)?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        result: row.try_get("result").map_err(corrupt)?,
    })
}

fn attempt_from_row(row: &PgRow) -> Result<RetryAttempt, StoreError> {
    let id: Uuid = row.try_get("id").map_err(corrupt)?;
    let job_id: Uuid = row.try_get("job_id").map_err(corrupt)?;
    let job_type: String = row.try_get("job_type").map_err(corrupt)?;
    let attempt_number: i32 = row.try_get("attempt_number").map_err(corrupt)?;
    let provider: Option<String> = row.try_get("provider").map_err(corrupt)?;
    let reason: String = row.try_get("reason").map_err(corrupt)?;
    let delay_ms: i64 = row.try_get("delay_ms").map_err(corrupt)?;
    let circuit_states: Json<BTreeMap<ProviderId, bool>> =
        row.try_get("circuit_states").map_err(corrupt)?;

    Ok(RetryAttempt {
        id: AttemptId::from_uuid(id),
        job_id: JobId::from_uuid(job_id),
        job_type: job_type
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("{e}")))?,
        attempt_number: attempt_number.max(0) as u32,
        provider: provider.map(ProviderId::new),
        reason: RetryReason::parse(&reason),
        error: row.try_get("error").map_err(corrupt)?,
        delay_ms: delay_ms.max(0) as u64,
        scheduled_at: row.try_get("scheduled_at").map_err(corrupt)?,
        executed_at: row.try_get("executed_at").map_err(corrupt)?,
        was_successful: row.try_get("was_successful").map_err(corrupt)?,
        circuit_states: circuit_states.0,
        system_load: row.try_get("system_load").map_err(corrupt)?,
    })
}

// SQLx row types

#[derive(Debug)]
struct HealthRow {
    provider_id: String,
    total_requests: i64,
    successful_requests: i64,
    failed_requests: i64,
    success_rate: f64,
    avg_response_time_ms: f64,
    min_response_time_ms: Option<i64>,
    max_response_time_ms: Option<i64>,
    consecutive_failures: i32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    circuit_opened_at: Option<DateTime<Utc>>,
    status: String,
    failure_threshold: i32,
    recovery_timeout_ms: i64,
    recent_errors: Json<VecDeque<RecentError>>,
    version: i64,
}

impl<'r> FromRow<'r, PgRow> for HealthRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(HealthRow {
            provider_id: row.try_get("provider_id")?,
            total_requests: row.try_get("total_requests")?,
            successful_requests: row.try_get("successful_requests")?,
            failed_requests: row.try_get("failed_requests")?,
            success_rate: row.try_get("success_rate")?,
            avg_response_time_ms: row.try_get("avg_response_time_ms")?,
            min_response_time_ms: row.try_get("min_response_time_ms")?,
            max_response_time_ms: row.try_get("max_response_time_ms")?,
            consecutive_failures: row.try_get("consecutive_failures")?,
            last_failure_at: row.try_get("last_failure_at")?,
            last_success_at: row.try_get("last_success_at")?,
            circuit_opened_at: row.try_get("circuit_opened_at")?,
            status: row.try_get("status")?,
            failure_threshold: row.try_get("failure_threshold")?,
            recovery_timeout_ms: row.try_get("recovery_timeout_ms")?,
            recent_errors: row.try_get("recent_errors")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<HealthRow> for ProviderHealth {
    type Error = StoreError;

    fn try_from(row: HealthRow) -> Result<Self, Self::Error> {
        let status = HealthStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("health status {}", row.status)))?;

        Ok(ProviderHealth {
            provider_id: ProviderId::new(row.provider_id),
            total_requests: row.total_requests as u64,
            successful_requests: row.successful_requests as u64,
            failed_requests: row.failed_requests as u64,
            success_rate: row.success_rate,
            avg_response_time_ms: row.avg_response_time_ms,
            min_response_time_ms: row.min_response_time_ms.map(|v| v as u64),
            max_response_time_ms: row.max_response_time_ms.map(|v| v as u64),
            consecutive_failures: row.consecutive_failures.max(0) as u32,
            last_failure_at: row.last_failure_at,
            last_success_at: row.last_success_at,
            circuit_opened_at: row.circuit_opened_at,
            status,
            failure_threshold: row.failure_threshold.max(1) as u32,
            recovery_timeout_ms: row.recovery_timeout_ms.max(0) as u64,
            recent_errors: row.recent_errors.0,
            version: row.version as u64,
        })
    }
}

fn corrupt(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(err.to_string())
}

/// Map SQLx errors to store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::AlreadyExists(msg),
                Some("23503") => StoreError::NotFound(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
