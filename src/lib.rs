//! forge-index: commit-scoped indexing queue and derived-data store.
//!
//! A source-control host enqueues one job per pushed commit. Workers claim
//! jobs, analyze the commit and persist the results as replace-on-write
//! snapshots: a searchable symbol index, a cross-reference graph and
//! per-commit entity versions tied to durable identities. Hash mappings and a
//! merge-base memo round out the per-repository bookkeeping.
//!
//! Two backends implement the same [`store::Store`] contract: SQLite for
//! single-node deployments and PostgreSQL for shared ones. Every call carries
//! a [`tenant::TenantScope`].

pub mod config;
pub mod error;
pub mod index;
pub mod query;
pub mod queue;
pub mod retry;
pub mod search;
pub mod store;
pub mod tenant;
pub mod worker;

pub use config::{BackendKind, Config};
pub use error::{StoreError, StoreResult};
pub use index::objects::{HashMapping, Repository};
pub use query::{Navigator, QueryResult};
pub use queue::{BackoffPolicy, IndexingJob, JobStatus, NewJob, QueueStats};
pub use store::{PostgresStore, SqliteStore, Store};
pub use tenant::{TenantId, TenantScope};
pub use worker::{CommitAnalysis, CommitAnalyzer, JobOutcome, Worker, WorkerConfig};
