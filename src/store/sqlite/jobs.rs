use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::repos::ensure_repository;
use super::{decode_failure, from_millis, opt_from_millis, to_millis, SqliteStore};
use crate::error::{StoreError, StoreResult};
use crate::index::commit_key;
use crate::queue::{terminal_message, IndexingJob, JobStatus, NewJob, QueueStats};
use crate::store::JobQueue;
use crate::tenant::TenantScope;

const JOB_COLUMNS: &str = "id, repo_id, commit_hash, job_type, status, attempt_count, max_attempts,
    last_error, next_attempt_at, created_at, updated_at, started_at, completed_at";

/// Restricts a job-id statement to the tenant bound at `?N`.
fn tenant_clause(n: usize) -> String {
    format!(
        "(?{n} IS NULL OR repo_id IN (SELECT id FROM repositories WHERE tenant_id = ?{n}))",
        n = n
    )
}

fn row_to_job(row: &Row) -> rusqlite::Result<IndexingJob> {
    let status: String = row.get(4)?;
    Ok(IndexingJob {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        commit_hash: row.get(2)?,
        job_type: row.get(3)?,
        status: status.parse::<JobStatus>().map_err(|e| decode_failure(4, e))?,
        attempt_count: row.get(5)?,
        max_attempts: row.get(6)?,
        last_error: row.get(7)?,
        next_attempt_at: from_millis(row.get(8)?),
        created_at: from_millis(row.get(9)?),
        updated_at: from_millis(row.get(10)?),
        started_at: opt_from_millis(row.get(11)?),
        completed_at: opt_from_millis(row.get(12)?),
    })
}

fn stale(job_id: i64) -> StoreError {
    debug!(job_id, "job is no longer in progress");
    StoreError::not_found(format!("in-progress indexing job {}", job_id))
}

#[async_trait]
impl JobQueue for SqliteStore {
    async fn enqueue_job(&self, scope: &TenantScope, job: &NewJob) -> StoreResult<IndexingJob> {
        let job = job.validated()?;
        let tenant = scope.as_param();

        let stored = self
            .write("enqueue_job", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_repository(&tx, tenant.as_deref(), job.repo_id)?;

                let now = to_millis(Utc::now());
                let next_attempt_at = job.next_attempt_at.map(to_millis).unwrap_or(now);

                // A completed row fails the DO UPDATE predicate and returns nothing.
                let upserted = tx
                    .query_row(
                        &format!(
                            "INSERT INTO indexing_jobs
                                (repo_id, commit_hash, job_type, status, attempt_count, max_attempts,
                                 last_error, next_attempt_at, created_at, updated_at)
                             VALUES (?1, ?2, ?3, 'queued', 0, COALESCE(?4, ?5), '', ?6, ?7, ?7)
                             ON CONFLICT (repo_id, commit_hash, job_type) DO UPDATE SET
                                status = 'queued',
                                last_error = '',
                                next_attempt_at = excluded.next_attempt_at,
                                started_at = NULL,
                                completed_at = NULL,
                                max_attempts = COALESCE(?4, indexing_jobs.max_attempts),
                                updated_at = excluded.updated_at
                             WHERE indexing_jobs.status <> 'completed'
                             RETURNING {}",
                            JOB_COLUMNS
                        ),
                        params![
                            job.repo_id,
                            job.commit_hash,
                            job.job_type,
                            job.max_attempts,
                            job.effective_max_attempts(),
                            next_attempt_at,
                            now,
                        ],
                        row_to_job,
                    )
                    .optional()?;

                let stored = match upserted {
                    Some(stored) => stored,
                    None => tx.query_row(
                        &format!(
                            "SELECT {} FROM indexing_jobs
                             WHERE repo_id = ?1 AND commit_hash = ?2 AND job_type = ?3",
                            JOB_COLUMNS
                        ),
                        params![job.repo_id, job.commit_hash, job.job_type],
                        row_to_job,
                    )?,
                };
                tx.commit()?;
                Ok(stored)
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
            .write("claim_job", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let now = to_millis(Utc::now());
                let claimed = tx
                    .query_row(
                        &format!(
                            "UPDATE indexing_jobs SET
                                status = 'in_progress',
                                attempt_count = attempt_count + 1,
                                started_at = ?1,
                                completed_at = NULL,
                                updated_at = ?1
                             WHERE id = (
                                SELECT id FROM indexing_jobs
                                WHERE status = 'queued' AND next_attempt_at <= ?1 AND {}
                                ORDER BY next_attempt_at, id
                                LIMIT 1
                             )
                             AND status = 'queued'
                             RETURNING {}",
                            tenant_clause(2),
                            JOB_COLUMNS
                        ),
                        params![now, tenant],
                        row_to_job,
                    )
                    .optional()?;
                tx.commit()?;
                Ok(claimed)
            })
            .await?;

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
        let tenant = scope.as_param();

        let finished = self
            .write("complete_job", move |conn| {
                Ok(conn
                    .query_row(
                        &format!(
                            "UPDATE indexing_jobs SET
                                status = ?2,
                                last_error = ?3,
                                completed_at = ?4,
                                updated_at = ?4
                             WHERE id = ?1 AND status = 'in_progress' AND {}
                             RETURNING {}",
                            tenant_clause(5),
                            JOB_COLUMNS
                        ),
                        params![
                            job_id,
                            status.as_str(),
                            last_error,
                            to_millis(Utc::now()),
                            tenant
                        ],
                        row_to_job,
                    )
                    .optional()?)
            })
            .await?
            .ok_or_else(|| stale(job_id))?;

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
        let tenant = scope.as_param();
        let next_attempt_at = to_millis(next_attempt_at);

        let requeued = self
            .write("requeue_job", move |conn| {
                // SET expressions all see the pre-update row.
                Ok(conn
                    .query_row(
                        &format!(
                            "UPDATE indexing_jobs SET
                                status = CASE WHEN attempt_count >= max_attempts
                                    THEN 'failed' ELSE 'queued' END,
                                last_error = ?2,
                                next_attempt_at = CASE WHEN attempt_count >= max_attempts
                                    THEN next_attempt_at ELSE ?3 END,
                                started_at = CASE WHEN attempt_count >= max_attempts
                                    THEN started_at ELSE NULL END,
                                completed_at = CASE WHEN attempt_count >= max_attempts
                                    THEN ?4 ELSE NULL END,
                                updated_at = ?4
                             WHERE id = ?1 AND status = 'in_progress' AND {}
                             RETURNING {}",
                            tenant_clause(5),
                            JOB_COLUMNS
                        ),
                        params![
                            job_id,
                            last_error,
                            next_attempt_at,
                            to_millis(Utc::now()),
                            tenant
                        ],
                        row_to_job,
                    )
                    .optional()?)
            })
            .await?
            .ok_or_else(|| stale(job_id))?;

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
        let tenant = scope.as_param();
        self.read(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM indexing_jobs WHERE id = ?1 AND {}",
                    JOB_COLUMNS,
                    tenant_clause(2)
                ),
                params![job_id, tenant],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("indexing job {}", job_id)))
        })
        .await
    }

    async fn job_status(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<IndexingJob> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM indexing_jobs
                     WHERE repo_id = ?1 AND commit_hash = ?2
                     ORDER BY created_at DESC, id DESC
                     LIMIT 1",
                    JOB_COLUMNS
                ),
                params![repo_id, commit],
                row_to_job,
            )
            .optional()?
            .ok_or_else(|| {
                StoreError::not_found(format!("indexing job for {}@{}", repo_id, commit))
            })
        })
        .await
    }

    async fn queue_stats(&self, scope: &TenantScope) -> StoreResult<QueueStats> {
        let tenant = scope.as_param();
        self.read(move |conn| {
            Ok(conn.query_row(
                &format!(
                    "SELECT
                        COALESCE(SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0),
                        MIN(CASE WHEN status = 'queued' THEN next_attempt_at END)
                     FROM indexing_jobs
                     WHERE {}",
                    tenant_clause(1)
                ),
                params![tenant],
                |row| {
                    Ok(QueueStats {
                        queued: row.get(0)?,
                        in_progress: row.get(1)?,
                        failed: row.get(2)?,
                        oldest_queued_at: opt_from_millis(row.get(3)?),
                    })
                },
            )?)
        })
        .await
    }
}
