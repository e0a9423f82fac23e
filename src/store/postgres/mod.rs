//! PostgreSQL backend.
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers skip rows another
//! transaction holds instead of waiting on them. Search uses a generated
//! `tsvector` column with a GIN index.

pub mod schema;

mod entities;
mod jobs;
mod objects;
mod repos;
mod symbols;
mod xref;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::config::BackendKind;
use crate::error::StoreResult;
use crate::retry::RetryPolicy;
use crate::store::Store;

/// Rows per multi-value INSERT; keeps bind counts well under the protocol cap.
pub(crate) const INSERT_BATCH_SIZE: usize = 1000;

/// Restricts a statement on a `repo_id`-carrying table to the tenant bound at `$n`.
pub(crate) fn tenant_clause(n: usize) -> String {
    format!(
        "(${n}::text IS NULL OR repo_id IN (SELECT id FROM repositories WHERE tenant_id = ${n}))",
        n = n
    )
}

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry: RetryPolicy,
}

impl PostgresStore {
    /// Connect a pool. Call [`Store::migrate`] before first use.
    pub async fn connect(url: &str, max_connections: u32, retry: RetryPolicy) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        info!(max_connections, "connected to PostgreSQL");
        Ok(Self::from_pool(pool, retry))
    }

    pub fn from_pool(pool: PgPool, retry: RetryPolicy) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn migrate(&self) -> StoreResult<()> {
        schema::init_schema(&self.pool).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}
