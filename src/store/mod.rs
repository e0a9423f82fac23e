//! Storage contract and backend selection.
//!
//! Every operation takes a [`TenantScope`]. Both backends honor the same
//! observable guarantees; how they get there differs:
//!
//! * PostgreSQL claims with `FOR UPDATE SKIP LOCKED`.
//! * SQLite claims with one conditional `UPDATE ... WHERE id = (SELECT ...)`
//!   and retries busy/locked writes with capped backoff.

pub mod postgres;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::{BackendKind, Config};
use crate::error::{StoreError, StoreResult};
use crate::index::objects::{HashMapping, Repository};
use crate::index::{
    CommitIndexSummary, Definition, Edge, EntityIdentity, EntityIndexEntry, EntityVersion,
    GraphCounts, IdentitySighting, IndexEntry, Page, VersionFilter, VersionSnapshot,
    XRefDefinition, XRefEdge,
};
use crate::queue::{IndexingJob, JobStatus, NewJob, QueueStats};
use crate::tenant::TenantScope;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Repository rows the core tables hang off, plus per-repository numbering.
#[async_trait]
pub trait RepositoryStore: Send + Sync {
    /// Create a repository owned by the scope's tenant (if any).
    async fn create_repository(
        &self,
        scope: &TenantScope,
        owner: &str,
        name: &str,
    ) -> StoreResult<Repository>;

    async fn get_repository(&self, scope: &TenantScope, repo_id: i64) -> StoreResult<Repository>;

    /// Delete a repository and everything that cascades from it.
    async fn delete_repository(&self, scope: &TenantScope, repo_id: i64) -> StoreResult<()>;

    /// Allocate the next number in the repository's issue/pull-request space.
    async fn reserve_number(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        item_kind: &str,
    ) -> StoreResult<i64>;
}

/// Per-commit indexing job scheduler.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert or restart the job for `(repo, commit, type)`.
    ///
    /// A completed job is returned unchanged.
    async fn enqueue_job(&self, scope: &TenantScope, job: &NewJob) -> StoreResult<IndexingJob>;

    /// Claim the oldest ready job, or `None` when nothing is eligible.
    async fn claim_job(&self, scope: &TenantScope) -> StoreResult<Option<IndexingJob>>;

    /// Finish an in-progress job. `NotFound` means the caller's claim is stale.
    async fn complete_job(
        &self,
        scope: &TenantScope,
        job_id: i64,
        status: JobStatus,
        message: &str,
    ) -> StoreResult<IndexingJob>;

    /// Hand an in-progress job back, or fail it when attempts are exhausted.
    async fn requeue_job(
        &self,
        scope: &TenantScope,
        job_id: i64,
        message: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> StoreResult<IndexingJob>;

    async fn get_job(&self, scope: &TenantScope, job_id: i64) -> StoreResult<IndexingJob>;

    /// Most recent job for a commit across job types.
    async fn job_status(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<IndexingJob>;

    async fn queue_stats(&self, scope: &TenantScope) -> StoreResult<QueueStats>;
}

/// git <-> got object hash bijection.
#[async_trait]
pub trait HashMappingStore: Send + Sync {
    async fn set_hash_mapping(&self, scope: &TenantScope, mapping: &HashMapping)
        -> StoreResult<()>;

    /// All-or-nothing batch upsert.
    async fn set_hash_mappings(
        &self,
        scope: &TenantScope,
        mappings: &[HashMapping],
    ) -> StoreResult<()>;

    async fn get_got_hash(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        git_hash: &str,
    ) -> StoreResult<String>;

    async fn get_git_hash(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        got_hash: &str,
    ) -> StoreResult<String>;
}

/// Order-independent merge-base memo.
#[async_trait]
pub trait MergeBaseCache: Send + Sync {
    async fn set_merge_base(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        left: &str,
        right: &str,
        base: &str,
    ) -> StoreResult<()>;

    async fn get_merge_base(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        left: &str,
        right: &str,
    ) -> StoreResult<Option<String>>;
}

/// Stable identities and their per-commit versions.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn upsert_identity(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        sighting: &IdentitySighting,
    ) -> StoreResult<EntityIdentity>;

    async fn get_identity(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        stable_id: &str,
    ) -> StoreResult<EntityIdentity>;

    async fn set_version(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        version: &VersionSnapshot,
    ) -> StoreResult<()>;

    async fn list_versions_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<Vec<EntityVersion>>;

    async fn count_versions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        filter: &VersionFilter,
    ) -> StoreResult<i64>;

    async fn list_versions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        filter: &VersionFilter,
        page: Page,
    ) -> StoreResult<Vec<EntityVersion>>;

    async fn has_versions_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<bool>;
}

/// Per-commit searchable symbol table.
#[async_trait]
pub trait EntityIndex: Send + Sync {
    /// Atomically swap the commit's entries; returns the number written.
    async fn replace_commit_snapshot(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entries: &[IndexEntry],
    ) -> StoreResult<usize>;

    async fn list_by_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EntityIndexEntry>>;

    async fn search_entities(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        query: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EntityIndexEntry>>;

    async fn has_index_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<bool>;

    async fn index_summary(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<CommitIndexSummary>;
}

/// Per-commit cross-reference graph.
#[async_trait]
pub trait XRefGraph: Send + Sync {
    /// Atomically swap the commit's definitions and edges.
    async fn replace_commit_graph(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        definitions: &[Definition],
        edges: &[Edge],
    ) -> StoreResult<GraphCounts>;

    async fn get_definition(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
    ) -> StoreResult<XRefDefinition>;

    async fn search_definitions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        name: &str,
        limit: usize,
    ) -> StoreResult<Vec<XRefDefinition>>;

    async fn outgoing_edges(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
        kind: Option<&str>,
    ) -> StoreResult<Vec<XRefEdge>>;

    async fn incoming_edges(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
        kind: Option<&str>,
    ) -> StoreResult<Vec<XRefEdge>>;

    async fn has_graph_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<bool>;
}

/// Combined store contract implemented by each backend.
#[async_trait]
pub trait Store:
    RepositoryStore
    + JobQueue
    + HashMappingStore
    + MergeBaseCache
    + EntityStore
    + EntityIndex
    + XRefGraph
    + Send
    + Sync
{
    fn backend(&self) -> BackendKind;

    /// Apply pending schema migrations. Idempotent.
    async fn migrate(&self) -> StoreResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> StoreResult<()>;
}

/// Open and migrate the configured backend.
pub async fn open(config: &Config) -> StoreResult<Arc<dyn Store>> {
    let retry = config.retry.policy();
    let store: Arc<dyn Store> = match config.database.backend {
        BackendKind::Sqlite => {
            let path = config.database.sqlite_path.clone();
            let options = sqlite::SqliteOptions {
                max_connections: config.database.max_connections,
                busy_timeout: std::time::Duration::from_millis(config.database.busy_timeout_ms),
                retry,
            };
            let store = tokio::task::spawn_blocking(move || SqliteStore::open(&path, options))
                .await
                .map_err(|e| StoreError::Task(e.to_string()))??;
            Arc::new(store)
        }
        BackendKind::Postgres => {
            let url = config
                .database
                .postgres_url
                .as_deref()
                .ok_or_else(|| StoreError::Config("postgres_url is not set".to_string()))?;
            let store =
                PostgresStore::connect(url, config.database.max_connections, retry).await?;
            store.migrate().await?;
            Arc::new(store)
        }
    };
    info!(backend = store.backend().as_str(), "store ready");
    Ok(store)
}
