//! Background driver for the indexing queue.
//!
//! A [`Worker`] claims one job at a time, hands it to a [`CommitAnalyzer`],
//! persists the analysis in dependency order (identities, versions, index
//! snapshot, xref graph) and then completes the job. Analyzer or persistence
//! failures requeue the job with exponential backoff; the store decides whether
//! attempts are exhausted.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::StoreResult;
use crate::index::{Definition, Edge, IdentitySighting, IndexEntry, VersionSnapshot};
use crate::queue::{BackoffPolicy, IndexingJob, JobStatus};
use crate::store::Store;
use crate::tenant::TenantScope;

/// Everything an analyzer extracted from one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitAnalysis {
    pub identities: Vec<IdentitySighting>,
    pub versions: Vec<VersionSnapshot>,
    pub entries: Vec<IndexEntry>,
    pub definitions: Vec<Definition>,
    pub edges: Vec<Edge>,
}

/// Produces the derived data for a claimed job.
///
/// Implementations usually shell out to a parser or a separate analysis
/// service; the worker only cares about the result.
#[async_trait]
pub trait CommitAnalyzer: Send + Sync {
    async fn analyze(&self, job: &IndexingJob) -> Result<CommitAnalysis>;
}

/// What a single [`Worker::run_once`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// No job was ready.
    Idle,
    Completed(IndexingJob),
    /// The commit was already indexed; the job was completed without analysis.
    Skipped(IndexingJob),
    /// Handed back to the queue for a later attempt.
    Requeued(IndexingJob),
    /// Attempts exhausted.
    Failed(IndexingJob),
    /// Another party finished or restarted the job first; our work was dropped.
    Stale { job_id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for WorkerConfig {
    fn from(queue: &QueueConfig) -> Self {
        Self {
            poll_interval: queue.poll_interval(),
            backoff: queue.backoff(),
        }
    }
}

pub struct Worker {
    store: Arc<dyn Store>,
    analyzer: Arc<dyn CommitAnalyzer>,
    scope: TenantScope,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, analyzer: Arc<dyn CommitAnalyzer>) -> Self {
        Self {
            store,
            analyzer,
            scope: TenantScope::unscoped(),
            config: WorkerConfig::default(),
        }
    }

    /// Only claim jobs belonging to `scope`.
    pub fn with_scope(mut self, scope: TenantScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<JobOutcome> {
        let Some(job) = self
            .store
            .claim_job(&self.scope)
            .await
            .context("Failed to claim indexing job")?
        else {
            return Ok(JobOutcome::Idle);
        };

        // The job is in progress from here on; every error must hand it back.
        match self.already_indexed(&job).await {
            Ok(true) => {
                debug!(job_id = job.id, commit = %job.commit_hash, "commit already indexed");
                return self.finish(job, JobOutcome::Skipped).await;
            }
            Ok(false) => {}
            Err(err) => {
                warn!(job_id = job.id, commit = %job.commit_hash, "index lookup failed: {:#}", err);
                return self.retry_later(&job, &format!("{:#}", err)).await;
            }
        }

        let analysis = match self.analyzer.analyze(&job).await {
            Ok(analysis) => analysis,
            Err(err) => {
                warn!(job_id = job.id, commit = %job.commit_hash, "analysis failed: {:#}", err);
                return self.retry_later(&job, &format!("{:#}", err)).await;
            }
        };

        if let Err(err) = self.persist(&job, &analysis).await {
            warn!(job_id = job.id, commit = %job.commit_hash, "persisting analysis failed: {}", err);
            return self.retry_later(&job, &err.to_string()).await;
        }

        self.finish(job, JobOutcome::Completed).await
    }

    /// Poll until `shutdown` flips to `true`. Returns the number of jobs handled.
    pub async fn run_until(&self, mut shutdown: watch::Receiver<bool>) -> Result<usize> {
        info!(
            poll_interval = ?self.config.poll_interval,
            tenant = self.scope.tenant_id().map(|t| t.as_str()).unwrap_or("*"),
            "indexing worker started"
        );
        let mut handled = 0;

        while !*shutdown.borrow() {
            let idle = match self.run_once().await {
                Ok(JobOutcome::Idle) => true,
                Ok(_) => {
                    handled += 1;
                    false
                }
                Err(err) => {
                    error!("worker iteration failed: {:#}", err);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(handled, "indexing worker stopped");
        Ok(handled)
    }

    async fn already_indexed(&self, job: &IndexingJob) -> Result<bool> {
        let has_index = self
            .store
            .has_index_for_commit(&self.scope, job.repo_id, &job.commit_hash)
            .await
            .context("Failed to check entity index")?;
        if !has_index {
            return Ok(false);
        }
        self.store
            .has_graph_for_commit(&self.scope, job.repo_id, &job.commit_hash)
            .await
            .context("Failed to check xref graph")
    }

    /// Identities before versions (foreign key), then the commit snapshots.
    async fn persist(&self, job: &IndexingJob, analysis: &CommitAnalysis) -> StoreResult<()> {
        let (scope, repo_id, commit) = (&self.scope, job.repo_id, job.commit_hash.as_str());

        for sighting in &analysis.identities {
            self.store
                .upsert_identity(scope, repo_id, commit, sighting)
                .await?;
        }
        for version in &analysis.versions {
            self.store.set_version(scope, repo_id, commit, version).await?;
        }
        self.store
            .replace_commit_snapshot(scope, repo_id, commit, &analysis.entries)
            .await?;
        self.store
            .replace_commit_graph(scope, repo_id, commit, &analysis.definitions, &analysis.edges)
            .await?;
        Ok(())
    }

    async fn finish(
        &self,
        job: IndexingJob,
        outcome: fn(IndexingJob) -> JobOutcome,
    ) -> Result<JobOutcome> {
        match self
            .store
            .complete_job(&self.scope, job.id, JobStatus::Completed, "")
            .await
        {
            Ok(done) => Ok(outcome(done)),
            Err(err) if err.is_not_found() => {
                info!(job_id = job.id, "claim went stale before completion; discarding results");
                Ok(JobOutcome::Stale { job_id: job.id })
            }
            Err(err) => Err(err).context("Failed to complete indexing job"),
        }
    }

    async fn retry_later(&self, job: &IndexingJob, message: &str) -> Result<JobOutcome> {
        let next_attempt_at = self
            .config
            .backoff
            .next_attempt_at(Utc::now(), job.attempt_count);

        match self
            .store
            .requeue_job(&self.scope, job.id, message, next_attempt_at)
            .await
        {
            Ok(requeued) if requeued.status == JobStatus::Failed => {
                warn!(
                    job_id = requeued.id,
                    attempts = requeued.attempt_count,
                    "indexing job failed permanently"
                );
                Ok(JobOutcome::Failed(requeued))
            }
            Ok(requeued) => Ok(JobOutcome::Requeued(requeued)),
            Err(err) if err.is_not_found() => {
                info!(job_id = job.id, "claim went stale before requeue");
                Ok(JobOutcome::Stale { job_id: job.id })
            }
            Err(err) => Err(err).context("Failed to requeue indexing job"),
        }
    }
}
