// Indexing job queue types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Attempts granted to a job when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

/// Job type used for full per-commit indexing passes.
pub const COMMIT_INDEX_JOB: &str = "commit_index";

/// Message recorded when a job is failed without an explanation.
pub const DEFAULT_FAILURE_MESSAGE: &str = "indexing failed";

/// Job lifecycle states
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(StoreError::validation(format!("unknown job status: {}", other))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A job as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingJob {
    pub id: i64,
    pub repo_id: i64,
    pub commit_hash: String,
    pub job_type: String,
    pub status: JobStatus,
    pub attempt_count: i32,
    pub max_attempts: i32,
    pub last_error: String,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IndexingJob {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }
}

/// Enqueue request. Unset fields take queue defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub repo_id: i64,
    pub commit_hash: String,
    pub job_type: String,
    pub max_attempts: Option<i32>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(repo_id: i64, commit_hash: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            repo_id,
            commit_hash: commit_hash.into(),
            job_type: job_type.into(),
            max_attempts: None,
            next_attempt_at: None,
        }
    }

    pub fn commit_index(repo_id: i64, commit_hash: impl Into<String>) -> Self {
        Self::new(repo_id, commit_hash, COMMIT_INDEX_JOB)
    }

    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Reject malformed requests before any I/O and normalize the keys.
    pub fn validated(&self) -> StoreResult<NewJob> {
        let commit_hash = self.commit_hash.trim();
        if commit_hash.is_empty() {
            return Err(StoreError::validation("commit hash must not be empty"));
        }
        let job_type = self.job_type.trim();
        if job_type.is_empty() {
            return Err(StoreError::validation("job type must not be empty"));
        }
        if let Some(max) = self.max_attempts {
            if max <= 0 {
                return Err(StoreError::validation(format!(
                    "max attempts must be positive, got {}",
                    max
                )));
            }
        }
        Ok(NewJob {
            repo_id: self.repo_id,
            commit_hash: commit_hash.to_string(),
            job_type: job_type.to_string(),
            max_attempts: self.max_attempts,
            next_attempt_at: self.next_attempt_at,
        })
    }

    pub fn effective_max_attempts(&self) -> i32 {
        self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS)
    }
}

/// Queue health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: i64,
    pub in_progress: i64,
    pub failed: i64,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// Resolve the stored error message for a terminal transition.
///
/// Only `completed` and `failed` are accepted. Completion discards the message;
/// failure falls back to [`DEFAULT_FAILURE_MESSAGE`] when none is given.
pub fn terminal_message(status: JobStatus, message: &str) -> StoreResult<String> {
    match status {
        JobStatus::Completed => Ok(String::new()),
        JobStatus::Failed => {
            let trimmed = message.trim();
            if trimmed.is_empty() {
                Ok(DEFAULT_FAILURE_MESSAGE.to_string())
            } else {
                Ok(trimmed.to_string())
            }
        }
        other => Err(StoreError::validation(format!(
            "complete requires a terminal status, got {}",
            other
        ))),
    }
}

/// Retry schedule used by workers when handing a job back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(30 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay after the `attempt`-th failed attempt: base * 2^(attempt-1), capped.
    pub fn delay_for(&self, attempt: i32) -> Duration {
        let shift = (attempt.max(1) - 1).min(20) as u32;
        self.base.saturating_mul(1u32 << shift).min(self.max)
    }

    pub fn next_attempt_at(&self, now: DateTime<Utc>, attempt: i32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(attempt))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max.as_secs() as i64));
        now + delay
    }
}
