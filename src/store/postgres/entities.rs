use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::repos::ensure_repository;
use super::PostgresStore;
use crate::error::{StoreError, StoreResult};
use crate::index::{
    commit_key, required, EntityIdentity, EntityVersion, IdentitySighting, Page, VersionFilter,
    VersionSnapshot,
};
use crate::search::clamp_limit;
use crate::store::EntityStore;
use crate::tenant::TenantScope;

const IDENTITY_COLUMNS: &str = "repo_id, stable_id, name, decl_kind, receiver,
    first_seen_commit, last_seen_commit, created_at, updated_at";

const VERSION_COLUMNS: &str = "repo_id, stable_id, commit_hash, path, entity_hash, body_hash,
    name, decl_kind, receiver, created_at";

const VERSION_FILTER: &str = "repo_id = $1
    AND ($2::text IS NULL OR stable_id = $2)
    AND ($3::text IS NULL OR name = $3)
    AND ($4::text IS NULL OR lower(body_hash) = lower($4))";

#[derive(sqlx::FromRow)]
struct IdentityRow {
    repo_id: i64,
    stable_id: String,
    name: String,
    decl_kind: String,
    receiver: String,
    first_seen_commit: String,
    last_seen_commit: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<IdentityRow> for EntityIdentity {
    fn from(row: IdentityRow) -> Self {
        EntityIdentity {
            repo_id: row.repo_id,
            stable_id: row.stable_id,
            name: row.name,
            decl_kind: row.decl_kind,
            receiver: row.receiver,
            first_seen_commit: row.first_seen_commit,
            last_seen_commit: row.last_seen_commit,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VersionRow {
    repo_id: i64,
    stable_id: String,
    commit_hash: String,
    path: String,
    entity_hash: String,
    body_hash: String,
    name: String,
    decl_kind: String,
    receiver: String,
    created_at: DateTime<Utc>,
}

impl From<VersionRow> for EntityVersion {
    fn from(row: VersionRow) -> Self {
        EntityVersion {
            repo_id: row.repo_id,
            stable_id: row.stable_id,
            commit_hash: row.commit_hash,
            path: row.path,
            entity_hash: row.entity_hash,
            body_hash: row.body_hash,
            name: row.name,
            decl_kind: row.decl_kind,
            receiver: row.receiver,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl EntityStore for PostgresStore {
    async fn upsert_identity(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        sighting: &IdentitySighting,
    ) -> StoreResult<EntityIdentity> {
        let commit = commit_key(commit_hash)?;
        let stable_id = required("stable id", &sighting.stable_id)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        // first_seen_commit only moves when it was never recorded.
        let row: IdentityRow = sqlx::query_as(&format!(
            "INSERT INTO entity_identities
                (repo_id, stable_id, name, decl_kind, receiver,
                 first_seen_commit, last_seen_commit, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $7)
             ON CONFLICT (repo_id, stable_id) DO UPDATE SET
                name = EXCLUDED.name,
                decl_kind = EXCLUDED.decl_kind,
                receiver = EXCLUDED.receiver,
                first_seen_commit = CASE WHEN entity_identities.first_seen_commit = ''
                    THEN EXCLUDED.first_seen_commit
                    ELSE entity_identities.first_seen_commit END,
                last_seen_commit = EXCLUDED.last_seen_commit,
                updated_at = EXCLUDED.updated_at
             RETURNING {}",
            IDENTITY_COLUMNS
        ))
        .bind(repo_id)
        .bind(&stable_id)
        .bind(&sighting.name)
        .bind(&sighting.decl_kind)
        .bind(&sighting.receiver)
        .bind(&commit)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;
        Ok(row.into())
    }

    async fn get_identity(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        stable_id: &str,
    ) -> StoreResult<EntityIdentity> {
        let stable_id = required("stable id", stable_id)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let row: Option<IdentityRow> = sqlx::query_as(&format!(
            "SELECT {} FROM entity_identities WHERE repo_id = $1 AND stable_id = $2",
            IDENTITY_COLUMNS
        ))
        .bind(repo_id)
        .bind(&stable_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(EntityIdentity::from)
            .ok_or_else(|| StoreError::not_found(format!("entity identity {}", stable_id)))
    }

    async fn set_version(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        version: &VersionSnapshot,
    ) -> StoreResult<()> {
        let commit = commit_key(commit_hash)?;
        let stable_id = required("stable id", &version.stable_id)?;
        let path = required("path", &version.path)?;
        let entity_hash = required("entity hash", &version.entity_hash)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        sqlx::query(
            "INSERT INTO entity_versions
                (repo_id, stable_id, commit_hash, path, entity_hash, body_hash,
                 name, decl_kind, receiver, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (repo_id, commit_hash, path, entity_hash) DO UPDATE SET
                stable_id = EXCLUDED.stable_id,
                body_hash = EXCLUDED.body_hash,
                name = EXCLUDED.name,
                decl_kind = EXCLUDED.decl_kind,
                receiver = EXCLUDED.receiver",
        )
        .bind(repo_id)
        .bind(&stable_id)
        .bind(&commit)
        .bind(&path)
        .bind(&entity_hash)
        .bind(&version.body_hash)
        .bind(&version.name)
        .bind(&version.decl_kind)
        .bind(&version.receiver)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        debug!(repo_id, commit = %commit, stable_id = %stable_id, "stored entity version");
        Ok(())
    }

    async fn list_versions_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<Vec<EntityVersion>> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM entity_versions
             WHERE repo_id = $1 AND commit_hash = $2
             ORDER BY path, entity_hash",
            VERSION_COLUMNS
        ))
        .bind(repo_id)
        .bind(&commit)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(EntityVersion::from).collect())
    }

    async fn count_versions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        filter: &VersionFilter,
    ) -> StoreResult<i64> {
        let filter = filter.normalized();
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM entity_versions WHERE {}",
            VERSION_FILTER
        ))
        .bind(repo_id)
        .bind(&filter.stable_id)
        .bind(&filter.name)
        .bind(&filter.body_hash)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count)
    }

    async fn list_versions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        filter: &VersionFilter,
        page: Page,
    ) -> StoreResult<Vec<EntityVersion>> {
        let filter = filter.normalized();
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let rows: Vec<VersionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM entity_versions
             WHERE {}
             ORDER BY created_at DESC, commit_hash, path, entity_hash
             LIMIT $5 OFFSET $6",
            VERSION_COLUMNS, VERSION_FILTER
        ))
        .bind(repo_id)
        .bind(&filter.stable_id)
        .bind(&filter.name)
        .bind(&filter.body_hash)
        .bind(clamp_limit(page.limit) as i64)
        .bind(page.offset as i64)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(EntityVersion::from).collect())
    }

    async fn has_versions_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<bool> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM entity_versions WHERE repo_id = $1 AND commit_hash = $2)",
        )
        .bind(repo_id)
        .bind(&commit)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }
}
