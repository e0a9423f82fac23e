use anyhow::{Context, Result};
use tracing::info;

use forge_index::queue::NewJob;

use super::Session;

pub async fn enqueue(
    session: &Session,
    repo_id: i64,
    commit: &str,
    job_type: &str,
    max_attempts: Option<i32>,
) -> Result<()> {
    let max_attempts = max_attempts.unwrap_or(session.config.queue.default_max_attempts);
    let request = NewJob::new(repo_id, commit, job_type).with_max_attempts(max_attempts);

    let job = session
        .store
        .enqueue_job(&session.scope, &request)
        .await
        .with_context(|| format!("Failed to enqueue {} for {}@{}", job_type, repo_id, commit))?;

    info!(job_id = job.id, repo_id, commit = %job.commit_hash, status = %job.status, "enqueued");
    session.emit(&job, |job| {
        println!(
            "Job {} for {}@{} is {} (attempt {}/{})",
            job.id, job.repo_id, job.commit_hash, job.status, job.attempt_count, job.max_attempts
        );
    })
}
