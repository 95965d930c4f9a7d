//! Postgres-backed job and dead-letter store.
//!
//! ## Atomicity
//!
//! Every transition is a single conditional `UPDATE`:
//!
//! - `try_start`: `... WHERE status = 'pending'`
//! - `record_batch`: counters are incremented in place (`processed_count =
//!   processed_count + $n`) `WHERE status = 'running'`
//! - `pause` / `resume`: `... WHERE status = 'running'` / `'paused'`
//! - `finish`: `... WHERE status IN ('pending', 'running', 'paused')`
//!
//! so concurrent runners, the reaper and cancellation cannot interleave into
//! a state the in-memory store would reject. A table-level `CHECK` keeps
//! `processed_count = succeeded_count + failed_count`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database `23505` on insert | `AlreadyExists` |
//! | Other database errors | `Storage` |
//! | `PoolClosed`, `PoolTimedOut`, `Io` | `Unavailable` |
//! | Anything else | `Storage` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{info, instrument};

use opsflow_core::{DeadLetterId, JobId, TenantId};

use super::store::{DeadLetterStore, JobStats, JobStore, JobStoreError};
use super::types::{
    BatchOutcome, DeadLetterEntry, DeadLetterSummary, Job, JobSpec, JobStatus, JobType,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_jobs (
        job_id UUID PRIMARY KEY,
        tenant_id UUID NULL,
        created_by TEXT NOT NULL,
        job_type TEXT NOT NULL,
        spec JSONB NOT NULL,
        status TEXT NOT NULL,
        batch_size INTEGER NOT NULL CHECK (batch_size > 0),
        total_items BIGINT NOT NULL DEFAULT 0,
        processed_count BIGINT NOT NULL DEFAULT 0,
        succeeded_count BIGINT NOT NULL DEFAULT 0,
        failed_count BIGINT NOT NULL DEFAULT 0,
        pending_review_count BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        started_at TIMESTAMPTZ NULL,
        completed_at TIMESTAMPTZ NULL,
        heartbeat_at TIMESTAMPTZ NULL,
        error_message TEXT NULL,
        CHECK (processed_count = succeeded_count + failed_count)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS pipeline_jobs_status_idx ON pipeline_jobs (status, created_at)",
    "CREATE INDEX IF NOT EXISTS pipeline_jobs_completed_idx ON pipeline_jobs (completed_at)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_dead_letters (
        entry_id UUID PRIMARY KEY,
        job_id UUID NULL,
        job_type TEXT NULL,
        tenant_id UUID NULL,
        item_id TEXT NOT NULL,
        original_item JSONB NOT NULL,
        failure_reason TEXT NOT NULL,
        attempt_count INTEGER NOT NULL,
        moved_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS pipeline_dead_letters_job_idx ON pipeline_dead_letters (job_id)",
];

const JOB_COLUMNS: &str = "job_id, tenant_id, created_by, spec, status, batch_size, total_items, \
     processed_count, succeeded_count, failed_count, pending_review_count, created_at, \
     started_at, completed_at, heartbeat_at, error_message";

const DEAD_LETTER_COLUMNS: &str = "entry_id, job_id, job_type, tenant_id, item_id, original_item, \
     failure_reason, attempt_count, moved_at";

/// Postgres job store. Cheap to clone; shares one pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the job and dead-letter tables if they do not exist.
    #[instrument(skip_all, err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        info!("pipeline job tables ready");
        Ok(())
    }

    async fn exists(&self, job_id: JobId) -> Result<Option<JobStatus>, JobStoreError> {
        let row = sqlx::query("SELECT status FROM pipeline_jobs WHERE job_id = $1")
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_status", e))?;
        row.map(|r| {
            let status: String = r.try_get("status").map_err(|e| map_sqlx_error("job_status", e))?;
            parse_status(&status)
        })
        .transpose()
    }

    async fn summarize(&self, since: Option<DateTime<Utc>>) -> Result<DeadLetterSummary, JobStoreError> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, MIN(moved_at) AS oldest FROM pipeline_dead_letters \
             WHERE $1::timestamptz IS NULL OR moved_at >= $1",
        )
        .bind(since)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_summary", e))?;
        let total: i64 = totals.try_get("total").map_err(|e| map_sqlx_error("dead_letter_summary", e))?;
        let oldest: Option<DateTime<Utc>> =
            totals.try_get("oldest").map_err(|e| map_sqlx_error("dead_letter_summary", e))?;

        let rows = sqlx::query(
            "SELECT failure_reason, COUNT(*) AS n FROM pipeline_dead_letters \
             WHERE $1::timestamptz IS NULL OR moved_at >= $1 GROUP BY failure_reason",
        )
        .bind(since)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("dead_letter_summary", e))?;

        let mut by_reason = BTreeMap::new();
        for row in rows {
            let reason: String = row.try_get("failure_reason").map_err(|e| map_sqlx_error("dead_letter_summary", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("dead_letter_summary", e))?;
            by_reason.insert(reason, n as u64);
        }

        Ok(DeadLetterSummary {
            total: total as u64,
            oldest_moved_at: oldest,
            by_reason,
        })
    }

    async fn fetch_jobs(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Job>, JobStoreError> {
        query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .iter()
            .map(job_from_row)
            .collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip_all, fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let spec = serde_json::to_value(&job.spec)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode job spec: {e}")))?;

        sqlx::query(&format!(
            "INSERT INTO pipeline_jobs (job_type, {JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(job.job_type().as_str())
        .bind(*job.id.as_uuid())
        .bind(job.tenant_id.map(|t| *t.as_uuid()))
        .bind(&job.created_by)
        .bind(spec)
        .bind(job.status.as_str())
        .bind(job.batch_size as i32)
        .bind(job.total_items as i64)
        .bind(job.processed_count as i64)
        .bind(job.succeeded_count as i64)
        .bind(job.failed_count as i64)
        .bind(job.pending_review_count as i64)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.heartbeat_at)
        .bind(&job.error_message)
        .execute(&*self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                JobStoreError::AlreadyExists(job.id)
            }
            other => map_sqlx_error("insert_job", other),
        })?;
        Ok(())
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE job_id = $1"))
            .bind(*job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?
            .as_ref()
            .map(job_from_row)
            .transpose()
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn try_start(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE pipeline_jobs SET status = 'running', started_at = $2, heartbeat_at = $2 \
             WHERE job_id = $1 AND status = 'pending' RETURNING {JOB_COLUMNS}"
        ))
        .bind(*job_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_start", e))?;

        match row {
            Some(row) => job_from_row(&row).map(Some),
            None => match self.exists(job_id).await? {
                Some(_) => Ok(None),
                None => Err(JobStoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, processed = outcome.processed()), err)]
    async fn record_batch(
        &self,
        job_id: JobId,
        outcome: &BatchOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_jobs SET
                processed_count = processed_count + $2,
                succeeded_count = succeeded_count + $3,
                failed_count = failed_count + $4,
                pending_review_count = pending_review_count + $5,
                heartbeat_at = $6
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(*job_id.as_uuid())
        .bind(outcome.processed() as i64)
        .bind(outcome.succeeded as i64)
        .bind(outcome.failed as i64)
        .bind(outcome.pending_review as i64)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_batch", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.exists(job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn pause(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_jobs SET status = 'paused' WHERE job_id = $1 AND status = 'running'",
        )
        .bind(*job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("pause", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.exists(job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn resume(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE pipeline_jobs SET status = 'running', heartbeat_at = $2 \
             WHERE job_id = $1 AND status = 'paused' RETURNING {JOB_COLUMNS}"
        ))
        .bind(*job_id.as_uuid())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resume", e))?;

        match row {
            Some(row) => job_from_row(&row).map(Some),
            None => match self.exists(job_id).await? {
                Some(_) => Ok(None),
                None => Err(JobStoreError::NotFound(job_id)),
            },
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_jobs SET heartbeat_at = $2 WHERE job_id = $1 AND status = 'running'",
        )
        .bind(*job_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.exists(job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, status = %status), err)]
    async fn finish(
        &self,
        job_id: JobId,
        status: JobStatus,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        if !status.is_terminal() {
            let from = self.exists(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
            return Err(JobStoreError::InvalidTransition { id: job_id, from, to: status });
        }

        let row = sqlx::query(&format!(
            "UPDATE pipeline_jobs SET status = $2, completed_at = $3, \
                 error_message = COALESCE($4, error_message) \
             WHERE job_id = $1 AND status IN ('pending', 'running', 'paused') \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(*job_id.as_uuid())
        .bind(status.as_str())
        .bind(now)
        .bind(error)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => {
                let from = self.exists(job_id).await?.ok_or(JobStoreError::NotFound(job_id))?;
                Err(JobStoreError::InvalidTransition { id: job_id, from, to: status })
            }
        }
    }

    #[instrument(skip(self), err)]
    async fn list_recent(&self, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs ORDER BY created_at DESC, job_id DESC LIMIT $1"
        );
        self.fetch_jobs("list_recent", sqlx::query(&sql).bind(sql_limit(limit)))
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE status = $1 \
             ORDER BY created_at, job_id LIMIT $2"
        );
        self.fetch_jobs(
            "list_by_status",
            sqlx::query(&sql).bind(status.as_str()).bind(sql_limit(limit)),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn list_stale_running(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE status = 'running' \
             AND COALESCE(heartbeat_at, started_at, created_at) < $1 ORDER BY created_at, job_id"
        );
        self.fetch_jobs("list_stale_running", sqlx::query(&sql).bind(cutoff))
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_finished_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs \
             WHERE status NOT IN ('pending', 'running', 'paused') AND completed_at >= $1 \
             ORDER BY created_at, job_id"
        );
        self.fetch_jobs("list_finished_since", sqlx::query(&sql).bind(since))
            .await
    }

    #[instrument(skip(self), err)]
    async fn list_created_since(&self, since: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM pipeline_jobs WHERE created_at >= $1 ORDER BY created_at, job_id"
        );
        self.fetch_jobs("list_created_since", sqlx::query(&sql).bind(since))
            .await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM pipeline_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("job_stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("job_stats", e))?;
            *stats.slot(parse_status(&status)?) = n as u64;
        }
        Ok(stats)
    }
}

#[async_trait]
impl DeadLetterStore for PostgresJobStore {
    #[instrument(skip_all, fields(entry_id = %entry.id, item_id = %entry.item_id), err)]
    async fn push(&self, entry: DeadLetterEntry) -> Result<(), JobStoreError> {
        sqlx::query(&format!(
            "INSERT INTO pipeline_dead_letters ({DEAD_LETTER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) ON CONFLICT (entry_id) DO NOTHING"
        ))
        .bind(*entry.id.as_uuid())
        .bind(entry.job_id.map(|id| *id.as_uuid()))
        .bind(entry.job_type.map(|t| t.as_str()))
        .bind(entry.tenant_id.map(|t| *t.as_uuid()))
        .bind(&entry.item_id)
        .bind(&entry.original_item)
        .bind(&entry.failure_reason)
        .bind(entry.attempt_count as i32)
        .bind(entry.moved_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("push_dead_letter", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM pipeline_dead_letters \
             ORDER BY moved_at, entry_id LIMIT $1"
        ))
        .bind(sql_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?
        .iter()
        .map(dead_letter_from_row)
        .collect()
    }

    #[instrument(skip_all, fields(job_id = %job_id), err)]
    async fn list_for_job(&self, job_id: JobId) -> Result<Vec<DeadLetterEntry>, JobStoreError> {
        sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM pipeline_dead_letters WHERE job_id = $1 \
             ORDER BY moved_at, entry_id"
        ))
        .bind(*job_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters_for_job", e))?
        .iter()
        .map(dead_letter_from_row)
        .collect()
    }

    #[instrument(skip_all, fields(entry_id = %id), err)]
    async fn get_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        sqlx::query(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM pipeline_dead_letters WHERE entry_id = $1"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_dead_letter", e))?
        .as_ref()
        .map(dead_letter_from_row)
        .transpose()
    }

    #[instrument(skip_all, fields(entry_id = %id), err)]
    async fn remove_entry(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, JobStoreError> {
        sqlx::query(&format!(
            "DELETE FROM pipeline_dead_letters WHERE entry_id = $1 RETURNING {DEAD_LETTER_COLUMNS}"
        ))
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("remove_dead_letter", e))?
        .as_ref()
        .map(dead_letter_from_row)
        .transpose()
    }

    #[instrument(skip(self), err)]
    async fn summary(&self) -> Result<DeadLetterSummary, JobStoreError> {
        self.summarize(None).await
    }

    #[instrument(skip(self), err)]
    async fn summary_since(&self, since: DateTime<Utc>) -> Result<DeadLetterSummary, JobStoreError> {
        self.summarize(Some(since)).await
    }
}

/// `LIMIT` takes a signed bigint; anything past it means no limit.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn parse_status(s: &str) -> Result<JobStatus, JobStoreError> {
    s.parse()
        .map_err(|e| JobStoreError::Storage(format!("corrupt job row: {e}")))
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode job row: {e}"));

    let spec: serde_json::Value = row.try_get("spec").map_err(decode)?;
    let spec: JobSpec = serde_json::from_value(spec)
        .map_err(|e| JobStoreError::Storage(format!("failed to decode job spec: {e}")))?;
    let status: String = row.try_get("status").map_err(decode)?;
    let tenant: Option<uuid::Uuid> = row.try_get("tenant_id").map_err(decode)?;
    let count = |column: &str| -> Result<u64, JobStoreError> {
        let v: i64 = row.try_get(column).map_err(decode)?;
        Ok(v.max(0) as u64)
    };
    let batch_size: i32 = row.try_get("batch_size").map_err(decode)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("job_id").map_err(decode)?),
        tenant_id: tenant.map(TenantId::from_uuid),
        created_by: row.try_get("created_by").map_err(decode)?,
        spec,
        status: parse_status(&status)?,
        batch_size: batch_size.max(1) as u32,
        total_items: count("total_items")?,
        processed_count: count("processed_count")?,
        succeeded_count: count("succeeded_count")?,
        failed_count: count("failed_count")?,
        pending_review_count: count("pending_review_count")?,
        created_at: row.try_get("created_at").map_err(decode)?,
        started_at: row.try_get("started_at").map_err(decode)?,
        completed_at: row.try_get("completed_at").map_err(decode)?,
        heartbeat_at: row.try_get("heartbeat_at").map_err(decode)?,
        error_message: row.try_get("error_message").map_err(decode)?,
    })
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> Result<DeadLetterEntry, JobStoreError> {
    let decode = |e: sqlx::Error| JobStoreError::Storage(format!("failed to decode dead letter row: {e}"));

    let job_id: Option<uuid::Uuid> = row.try_get("job_id").map_err(decode)?;
    let tenant: Option<uuid::Uuid> = row.try_get("tenant_id").map_err(decode)?;
    let job_type: Option<String> = row.try_get("job_type").map_err(decode)?;
    let job_type = job_type
        .map(|t| t.parse::<JobType>())
        .transpose()
        .map_err(|e| JobStoreError::Storage(format!("corrupt dead letter row: {e}")))?;
    let attempts: i32 = row.try_get("attempt_count").map_err(decode)?;

    Ok(DeadLetterEntry {
        id: DeadLetterId::from_uuid(row.try_get("entry_id").map_err(decode)?),
        job_id: job_id.map(JobId::from_uuid),
        job_type,
        tenant_id: tenant.map(TenantId::from_uuid),
        item_id: row.try_get("item_id").map_err(decode)?,
        original_item: row.try_get("original_item").map_err(decode)?,
        failure_reason: row.try_get("failure_reason").map_err(decode)?,
        attempt_count: attempts.max(0) as u32,
        moved_at: row.try_get("moved_at").map_err(decode)?,
    })
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            JobStoreError::Unavailable(format!("connection pool unavailable in {operation}"))
        }
        sqlx::Error::Io(e) => JobStoreError::Unavailable(format!("io error in {operation}: {e}")),
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{CatalogFilter, CategorizeConfig};
    use opsflow_ai::CatalogItem;

    async fn store() -> PostgresJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        let store = PostgresJobStore::new(pool);
        store.migrate().await.expect("migrate");
        store
    }

    fn job() -> Job {
        Job::new(
            JobSpec::full_scan(CatalogFilter::default().with_limit(3), CategorizeConfig::default()),
            2,
            "pg-test",
        )
        .for_tenant(TenantId::new())
        .with_total_items(3)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn job_lifecycle_round_trips() {
        let store = store().await;
        let job = job();
        let id = job.id;
        store.insert(job.clone()).await.unwrap();
        assert!(matches!(
            store.insert(job.clone()).await,
            Err(JobStoreError::AlreadyExists(_))
        ));

        let loaded = store.get(id).await.unwrap().unwrap();
        assert_eq!(loaded.spec, job.spec);
        assert_eq!(loaded.tenant_id, job.tenant_id);

        let now = Utc::now();
        assert!(store.try_start(id, now).await.unwrap().is_some());
        assert!(store.try_start(id, now).await.unwrap().is_none());

        let outcome = BatchOutcome {
            succeeded: 1,
            failed: 1,
            pending_review: 1,
        };
        assert!(store.record_batch(id, &outcome, now).await.unwrap());

        let done = store.finish(id, JobStatus::PartiallyFailed, None, now).await.unwrap();
        assert_eq!(done.processed_count, 2);
        assert_eq!(done.pending_review_count, 1);
        assert!(!store.record_batch(id, &outcome, now).await.unwrap());
        assert!(matches!(
            store.finish(id, JobStatus::Failed, None, now).await,
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn oversized_limits_are_clamped() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn pause_and_resume_round_trip() {
        let store = store().await;
        let job = job();
        let id = job.id;
        store.insert(job).await.unwrap();

        assert!(!store.pause(id).await.unwrap());
        let now = Utc::now();
        store.try_start(id, now).await.unwrap();
        assert!(store.pause(id).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Paused);
        assert!(store.list_recent(usize::MAX).await.unwrap().iter().any(|j| j.id == id));

        let resumed = store.resume(id, now).await.unwrap().unwrap();
        assert_eq!(resumed.status, JobStatus::Running);
        assert!(store.resume(id, now).await.unwrap().is_none());

        store.pause(id).await.unwrap();
        let cancelled = store.finish(id, JobStatus::Cancelled, None, now).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn dead_letters_round_trip() {
        let store = store().await;
        let job = job();
        let entry = DeadLetterEntry::for_item(&job, &CatalogItem::new("sku-1"), "boom", 3);
        store.push(entry.clone()).await.unwrap();
        store.push(entry.clone()).await.unwrap();

        let listed = store.list_for_job(job.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].job_type, Some(JobType::FullScan));
        assert_eq!(listed[0].failure_reason, "boom");
        let recent = store.summary_since(entry.moved_at).await.unwrap();
        assert_eq!(recent.by_reason.get("boom"), Some(&1));

        assert!(store.remove_entry(entry.id).await.unwrap().is_some());
        assert!(store.get_entry(entry.id).await.unwrap().is_none());
    }
}
