use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::{debug, info};

use super::PostgresStore;
use crate::error::{StoreError, StoreResult};
use crate::index::objects::Repository;
use crate::index::required;
use crate::retry;
use crate::store::RepositoryStore;
use crate::tenant::TenantScope;

#[derive(sqlx::FromRow)]
struct RepositoryRow {
    id: i64,
    tenant_id: Option<String>,
    owner: String,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: row.id,
            tenant_id: row.tenant_id,
            owner: row.owner,
            name: row.name,
            created_at: row.created_at,
        }
    }
}

/// Fail with not-found unless `repo_id` is visible to `tenant`.
pub(super) async fn ensure_repository(
    conn: &mut PgConnection,
    tenant: Option<&str>,
    repo_id: i64,
) -> StoreResult<()> {
    let Some(tenant) = tenant else {
        return Ok(());
    };
    let visible: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM repositories WHERE id = $1 AND tenant_id = $2)",
    )
    .bind(repo_id)
    .bind(tenant)
    .fetch_one(&mut *conn)
    .await?;
    if visible {
        Ok(())
    } else {
        debug!(repo_id, tenant, "repository not visible to tenant");
        Err(StoreError::not_found(format!("repository {}", repo_id)))
    }
}

impl PostgresStore {
    async fn reserve_number_once(
        &self,
        tenant: Option<&str>,
        repo_id: i64,
        item_kind: &str,
    ) -> StoreResult<i64> {
        let mut tx = self.pool.begin().await?;
        ensure_repository(&mut tx, tenant, repo_id).await?;

        // Allocations for one repository queue behind its row lock.
        let locked: Option<i64> =
            sqlx::query_scalar("SELECT id FROM repositories WHERE id = $1 FOR UPDATE")
                .bind(repo_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(StoreError::not_found(format!("repository {}", repo_id)));
        }

        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(number), 0) + 1 FROM repo_numbers WHERE repo_id = $1",
        )
        .bind(repo_id)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO repo_numbers (repo_id, number, item_kind, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(repo_id)
        .bind(next)
        .bind(item_kind)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next)
    }
}

#[async_trait]
impl RepositoryStore for PostgresStore {
    async fn create_repository(
        &self,
        scope: &TenantScope,
        owner: &str,
        name: &str,
    ) -> StoreResult<Repository> {
        let owner = required("owner", owner)?;
        let name = required("repository name", name)?;

        let row: RepositoryRow = sqlx::query_as(
            "INSERT INTO repositories (tenant_id, owner, name, created_at)
             VALUES ($1, $2, $3, $4)
             RETURNING id, tenant_id, owner, name, created_at",
        )
        .bind(scope.as_param())
        .bind(&owner)
        .bind(&name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!(repo_id = row.id, owner = %owner, name = %name, "created repository");
        Ok(row.into())
    }

    async fn get_repository(&self, scope: &TenantScope, repo_id: i64) -> StoreResult<Repository> {
        let row: Option<RepositoryRow> = sqlx::query_as(
            "SELECT id, tenant_id, owner, name, created_at FROM repositories
             WHERE id = $1 AND ($2::text IS NULL OR tenant_id = $2)",
        )
        .bind(repo_id)
        .bind(scope.as_param())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Repository::from)
            .ok_or_else(|| StoreError::not_found(format!("repository {}", repo_id)))
    }

    async fn delete_repository(&self, scope: &TenantScope, repo_id: i64) -> StoreResult<()> {
        let result = sqlx::query(
            "DELETE FROM repositories WHERE id = $1 AND ($2::text IS NULL OR tenant_id = $2)",
        )
        .bind(repo_id)
        .bind(scope.as_param())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("repository {}", repo_id)));
        }
        info!(repo_id, "deleted repository");
        Ok(())
    }

    async fn reserve_number(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        item_kind: &str,
    ) -> StoreResult<i64> {
        let item_kind = required("item kind", item_kind)?;
        let tenant = scope.as_param();

        let number = self
            .retry
            .run_async("reserve_number", retry::busy_or_conflict, || {
                self.reserve_number_once(tenant.as_deref(), repo_id, &item_kind)
            })
            .await?;

        debug!(repo_id, number, kind = %item_kind, "reserved number");
        Ok(number)
    }
}
