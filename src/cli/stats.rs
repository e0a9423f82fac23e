use anyhow::{Context, Result};

use super::Session;

pub async fn show_status(session: &Session, repo_id: i64, commit: &str) -> Result<()> {
    let job = session
        .store
        .job_status(&session.scope, repo_id, commit)
        .await
        .with_context(|| format!("No indexing job for {}@{}", repo_id, commit))?;

    session.emit(&job, |job| {
        println!("Job {} ({})", job.id, job.job_type);
        println!("  commit: {}@{}", job.repo_id, job.commit_hash);
        println!("  status: {}", job.status);
        println!("  attempts: {}/{}", job.attempt_count, job.max_attempts);
        if !job.last_error.is_empty() {
            println!("  last error: {}", job.last_error);
        }
        if !job.status.is_terminal() {
            println!("  next attempt: {}", job.next_attempt_at.to_rfc3339());
        }
        if let Some(done) = job.completed_at {
            println!("  finished: {}", done.to_rfc3339());
        }
    })
}

pub async fn show_stats(session: &Session) -> Result<()> {
    let stats = session
        .store
        .queue_stats(&session.scope)
        .await
        .context("Failed to read queue statistics")?;

    session.emit(&stats, |stats| {
        println!("Queue Statistics:");
        println!("  Queued: {}", stats.queued);
        println!("  In progress: {}", stats.in_progress);
        println!("  Failed: {}", stats.failed);
        match stats.oldest_queued_at {
            Some(at) => println!("  Oldest queued: {}", at.to_rfc3339()),
            None => println!("  Oldest queued: -"),
        }
    })
}
