use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::repos::ensure_repository;
use super::{tenant_clause, PostgresStore};
use crate::error::{StoreError, StoreResult};
use crate::index::commit_key;
use crate::queue::{terminal_message, IndexingJob, JobStatus, NewJob, QueueStats};
use crate::retry;
use crate::store::JobQueue;
use crate::tenant::TenantScope;

const JOB_COLUMNS: &str = "id, repo_id, commit_hash, job_type, status, attempt_count, max_attempts,
    last_error, next_attempt_at, created_at, updated_at, started_at, completed_at";

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    repo_id: i64,
    commit_hash: String,
    job_type: String,
    status: String,
    attempt_count: i32,
    max_attempts: i32,
    last_error: String,
    next_attempt_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for IndexingJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> StoreResult<Self> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(IndexingJob {
            id: row.id,
            repo_id: row.repo_id,
            commit_hash: row.commit_hash,
            job_type: row.job_type,
            status,
            attempt_count: row.attempt_count,
            max_attempts: row.max_attempts,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn stale(job_id: i64) -> StoreError {
    debug!(job_id, "job is no longer in progress");
    StoreError::not_found(format!("in-progress indexing job {}", job_id))
}

impl PostgresStore {
    async fn enqueue_once(&self, tenant: Option<&str>, job: &NewJob) -> StoreResult<IndexingJob> {
        let mut tx = self.pool.begin().await?;
        ensure_repository(&mut tx, tenant, job.repo_id).await?;

        let now = Utc::now();
        // A completed row fails the DO UPDATE predicate and returns nothing.
        let upserted: Option<JobRow> = sqlx::query_as(&format!(
            "INSERT INTO indexing_jobs
                (repo_id, commit_hash, job_type, status, attempt_count, max_attempts,
                 last_error, next_attempt_at, created_at, updated_at)
             VALUES ($1, $2, $3, 'queued', 0, COALESCE($4, $5), '', $6, $7, $7)
             ON CONFLICT (repo_id, commit_hash, job_type) DO UPDATE SET
                status = 'queued',
                last_error = '',
                next_attempt_at = EXCLUDED.next_attempt_at,
                started_at = NULL,
                completed_at = NULL,
                max_attempts = COALESCE($4, indexing_jobs.max_attempts),
                updated_at = EXCLUDED.updated_at
             WHERE indexing_jobs.status <> 'completed'
             RETURNING {}",
            JOB_COLUMNS
        ))
        .bind(job.repo_id)
        .bind(&job.commit_hash)
        .bind(&job.job_type)
        .bind(job.max_attempts)
        .bind(job.effective_max_attempts())
        .bind(job.next_attempt_at.unwrap_or(now))
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let row = match upserted {
            Some(row) => row,
            None => {
                sqlx::query_as(&format!(
                    "SELECT {} FROM indexing_jobs
                     WHERE repo_id = $1 AND commit_hash = $2 AND job_type = $3",
                    JOB_COLUMNS
                ))
                .bind(job.repo_id)
                .bind(&job.commit_hash)
                .bind(&job.job_type)
                .fetch_one(&mut *tx)
                .await?
            }
        };
        tx.commit().await?;
        row.try_into()
    }

    async fn claim_once(&self, tenant: Option<&str>) -> StoreResult<Option<JobRow>> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "WITH next AS (
                SELECT id FROM indexing_jobs
                WHERE status = 'queued' AND next_attempt_at <= $1 AND {}
                ORDER BY next_attempt_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
             )
             UPDATE indexing_jobs AS j SET
                status = 'in_progress',
                attempt_count = j.attempt_count + 1,
                started_at = $1,
                completed_at = NULL,
                updated_at = $1
             FROM next
             WHERE j.id = next.id
             RETURNING j.*",
            tenant_clause(2)
        ))
        .bind(Utc::now())
        .bind(tenant)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl JobQueue for PostgresStore {
    async fn enqueue_job(&self, scope: &TenantScope, job: &NewJob) -> StoreResult<IndexingJob> {
        let job = job.validated()?;
        let tenant = scope.as_param();

        let stored = self
            .retry
            .run_async("enqueue_job", retry::busy, || {
                self.enqueue_once(tenant.as_deref(), &job)
            })
            .await?;

        debug!(
            job_id = stored.id,
            repo_id = stored.repo_id,
            commit = %stored.commit_hash,
            status = %stored.status,
            "enqueued indexing job"
        );
        Ok(stored)
    }

    async fn claim_job(&self, scope: &TenantScope) -> StoreResult<Option<IndexingJob>> {
        let tenant = scope.as_param();
        let claimed = self
            .retry
            .run_async("claim_job", retry::busy, || self.claim_once(tenant.as_deref()))
            .await?
            .map(IndexingJob::try_from)
            .transpose()?;

        if let Some(job) = &claimed {
            info!(
                job_id = job.id,
                repo_id = job.repo_id,
                commit = %job.commit_hash,
                attempt = job.attempt_count,
                "claimed indexing job"
            );
        }
        Ok(claimed)
    }

    async fn complete_job(
        &self,
        scope: &TenantScope,
        job_id: i64,
        status: JobStatus,
        message: &str,
    ) -> StoreResult<IndexingJob> {
        let last_error = terminal_message(status, message)?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE indexing_jobs SET
                status = $2,
                last_error = $3,
                completed_at = $4,
                updated_at = $4
             WHERE id = $1 AND status = 'in_progress' AND {}
             RETURNING {}",
            tenant_clause(5),
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(status.as_str())
        .bind(&last_error)
        .bind(Utc::now())
        .bind(scope.as_param())
        .fetch_optional(&self.pool)
        .await?;

        let finished = IndexingJob::try_from(row.ok_or_else(|| stale(job_id))?)?;
        info!(job_id, status = %finished.status, "finished indexing job");
        Ok(finished)
    }

    async fn requeue_job(
        &self,
        scope: &TenantScope,
        job_id: i64,
        message: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<IndexingJob> {
        let last_error = terminal_message(JobStatus::Failed, message)?;

        // SET expressions all see the pre-update row.
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "UPDATE indexing_jobs SET
                status = CASE WHEN attempt_count >= max_attempts
                    THEN 'failed' ELSE 'queued' END,
                last_error = $2,
                next_attempt_at = CASE WHEN attempt_count >= max_attempts
                    THEN next_attempt_at ELSE $3 END,
                started_at = CASE WHEN attempt_count >= max_attempts
                    THEN started_at ELSE NULL END,
                completed_at = CASE WHEN attempt_count >= max_attempts
                    THEN $4 ELSE NULL END,
                updated_at = $4
             WHERE id = $1 AND status = 'in_progress' AND {}
             RETURNING {}",
            tenant_clause(5),
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(&last_error)
        .bind(next_attempt_at)
        .bind(Utc::now())
        .bind(scope.as_param())
        .fetch_optional(&self.pool)
        .await?;

        let requeued = IndexingJob::try_from(row.ok_or_else(|| stale(job_id))?)?;
        info!(
            job_id,
            status = %requeued.status,
            attempt = requeued.attempt_count,
            max_attempts = requeued.max_attempts,
            "requeued indexing job"
        );
        Ok(requeued)
    }

    async fn get_job(&self, scope: &TenantScope, job_id: i64) -> StoreResult<IndexingJob> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM indexing_jobs WHERE id = $1 AND {}",
            JOB_COLUMNS,
            tenant_clause(2)
        ))
        .bind(job_id)
        .bind(scope.as_param())
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| StoreError::not_found(format!("indexing job {}", job_id)))?
            .try_into()
    }

    async fn job_status(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<IndexingJob> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM indexing_jobs
             WHERE repo_id = $1 AND commit_hash = $2
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(repo_id)
        .bind(&commit)
        .fetch_optional(&mut *conn)
        .await?;

        row.ok_or_else(|| StoreError::not_found(format!("indexing job for {}@{}", repo_id, commit)))?
            .try_into()
    }

    async fn queue_stats(&self, scope: &TenantScope) -> StoreResult<QueueStats> {
        let (queued, in_progress, failed, oldest_queued_at): (
            i64,
            i64,
            i64,
            Option<DateTime<Utc>>,
        ) = sqlx::query_as(&format!(
            "SELECT
                COUNT(*) FILTER (WHERE status = 'queued'),
                COUNT(*) FILTER (WHERE status = 'in_progress'),
                COUNT(*) FILTER (WHERE status = 'failed'),
                MIN(next_attempt_at) FILTER (WHERE status = 'queued')
             FROM indexing_jobs
             WHERE {}",
            tenant_clause(1)
        ))
        .bind(scope.as_param())
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            queued,
            in_progress,
            failed,
            oldest_queued_at,
        })
    }
}
