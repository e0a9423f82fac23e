use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::{from_millis, to_millis, SqliteStore};
use crate::error::{StoreError, StoreResult};
use crate::index::objects::Repository;
use crate::index::required;
use crate::retry;
use crate::store::RepositoryStore;
use crate::tenant::TenantScope;

const REPOSITORY_COLUMNS: &str = "id, tenant_id, owner, name, created_at";

/// Fail with not-found unless `repo_id` is visible to `tenant`.
///
/// Unscoped callers skip the check; the foreign keys still reject writes to a
/// repository that does not exist.
pub(super) fn ensure_repository(
    conn: &Connection,
    tenant: Option<&str>,
    repo_id: i64,
) -> StoreResult<()> {
    let Some(tenant) = tenant else {
        return Ok(());
    };
    let visible: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM repositories WHERE id = ?1 AND tenant_id = ?2)",
        params![repo_id, tenant],
        |row| row.get(0),
    )?;
    if visible {
        Ok(())
    } else {
        debug!(repo_id, tenant, "repository not visible to tenant");
        Err(StoreError::not_found(format!("repository {}", repo_id)))
    }
}

fn row_to_repository(row: &Row) -> rusqlite::Result<Repository> {
    Ok(Repository {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        owner: row.get(2)?,
        name: row.get(3)?,
        created_at: from_millis(row.get(4)?),
    })
}

fn select_repository(
    conn: &Connection,
    tenant: Option<&str>,
    repo_id: i64,
) -> StoreResult<Repository> {
    conn.query_row(
        &format!(
            "SELECT {} FROM repositories WHERE id = ?1 AND (?2 IS NULL OR tenant_id = ?2)",
            REPOSITORY_COLUMNS
        ),
        params![repo_id, tenant],
        row_to_repository,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("repository {}", repo_id)))
}

#[async_trait]
impl RepositoryStore for SqliteStore {
    async fn create_repository(
        &self,
        scope: &TenantScope,
        owner: &str,
        name: &str,
    ) -> StoreResult<Repository> {
        let owner = required("owner", owner)?;
        let name = required("repository name", name)?;
        let tenant = scope.as_param();

        let repo = self
            .write("create_repository", move |conn| {
                let sql = format!(
                    "INSERT INTO repositories (tenant_id, owner, name, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     RETURNING {}",
                    REPOSITORY_COLUMNS
                );
                Ok(conn.query_row(
                    &sql,
                    params![tenant, owner, name, to_millis(Utc::now())],
                    row_to_repository,
                )?)
            })
            .await?;

        info!(repo_id = repo.id, owner = %repo.owner, name = %repo.name, "created repository");
        Ok(repo)
    }

    async fn get_repository(&self, scope: &TenantScope, repo_id: i64) -> StoreResult<Repository> {
        let tenant = scope.as_param();
        self.read(move |conn| select_repository(conn, tenant.as_deref(), repo_id))
            .await
    }

    async fn delete_repository(&self, scope: &TenantScope, repo_id: i64) -> StoreResult<()> {
        let tenant = scope.as_param();
        let deleted = self
            .write("delete_repository", move |conn| {
                Ok(conn.execute(
                    "DELETE FROM repositories WHERE id = ?1 AND (?2 IS NULL OR tenant_id = ?2)",
                    params![repo_id, tenant],
                )?)
            })
            .await?;

        if deleted == 0 {
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

        self.write_with("reserve_number", retry::busy_or_conflict, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_repository(&tx, tenant.as_deref(), repo_id)?;

            let next: i64 = tx.query_row(
                "SELECT COALESCE(MAX(number), 0) + 1 FROM repo_numbers WHERE repo_id = ?1",
                [repo_id],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO repo_numbers (repo_id, number, item_kind, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![repo_id, next, item_kind, to_millis(Utc::now())],
            )?;
            tx.commit()?;

            debug!(repo_id, number = next, kind = %item_kind, "reserved number");
            Ok(next)
        })
        .await
    }
}
