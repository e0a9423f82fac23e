use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

use super::repos::ensure_repository;
use super::{from_millis, to_millis, SqliteStore};
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

const VERSION_FILTER: &str = "repo_id = ?1
    AND (?2 IS NULL OR stable_id = ?2)
    AND (?3 IS NULL OR name = ?3)
    AND (?4 IS NULL OR lower(body_hash) = lower(?4))";

fn row_to_identity(row: &Row) -> rusqlite::Result<EntityIdentity> {
    Ok(EntityIdentity {
        repo_id: row.get(0)?,
        stable_id: row.get(1)?,
        name: row.get(2)?,
        decl_kind: row.get(3)?,
        receiver: row.get(4)?,
        first_seen_commit: row.get(5)?,
        last_seen_commit: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        updated_at: from_millis(row.get(8)?),
    })
}

fn row_to_version(row: &Row) -> rusqlite::Result<EntityVersion> {
    Ok(EntityVersion {
        repo_id: row.get(0)?,
        stable_id: row.get(1)?,
        commit_hash: row.get(2)?,
        path: row.get(3)?,
        entity_hash: row.get(4)?,
        body_hash: row.get(5)?,
        name: row.get(6)?,
        decl_kind: row.get(7)?,
        receiver: row.get(8)?,
        created_at: from_millis(row.get(9)?),
    })
}

#[async_trait]
impl EntityStore for SqliteStore {
    async fn upsert_identity(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        sighting: &IdentitySighting,
    ) -> StoreResult<EntityIdentity> {
        let commit = commit_key(commit_hash)?;
        let stable_id = required("stable id", &sighting.stable_id)?;
        let sighting = sighting.clone();
        let tenant = scope.as_param();

        self.write("upsert_identity", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_repository(&tx, tenant.as_deref(), repo_id)?;
            // first_seen_commit only moves when it was never recorded.
            let identity = tx.query_row(
                &format!(
                    "INSERT INTO entity_identities
                        (repo_id, stable_id, name, decl_kind, receiver,
                         first_seen_commit, last_seen_commit, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?7)
                     ON CONFLICT (repo_id, stable_id) DO UPDATE SET
                        name = excluded.name,
                        decl_kind = excluded.decl_kind,
                        receiver = excluded.receiver,
                        first_seen_commit = CASE WHEN entity_identities.first_seen_commit = ''
                            THEN excluded.first_seen_commit
                            ELSE entity_identities.first_seen_commit END,
                        last_seen_commit = excluded.last_seen_commit,
                        updated_at = excluded.updated_at
                     RETURNING {}",
                    IDENTITY_COLUMNS
                ),
                params![
                    repo_id,
                    stable_id,
                    sighting.name,
                    sighting.decl_kind,
                    sighting.receiver,
                    commit,
                    to_millis(Utc::now()),
                ],
                row_to_identity,
            )?;
            tx.commit()?;
            Ok(identity)
        })
        .await
    }

    async fn get_identity(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        stable_id: &str,
    ) -> StoreResult<EntityIdentity> {
        let stable_id = required("stable id", stable_id)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM entity_identities WHERE repo_id = ?1 AND stable_id = ?2",
                    IDENTITY_COLUMNS
                ),
                params![repo_id, stable_id],
                row_to_identity,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("entity identity {}", stable_id)))
        })
        .await
    }

    async fn set_version(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        version: &VersionSnapshot,
    ) -> StoreResult<()> {
        let commit = commit_key(commit_hash)?;
        let mut version = version.clone();
        version.stable_id = required("stable id", &version.stable_id)?;
        version.path = required("path", &version.path)?;
        version.entity_hash = required("entity hash", &version.entity_hash)?;
        let tenant = scope.as_param();

        self.write("set_version", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_repository(&tx, tenant.as_deref(), repo_id)?;
            tx.execute(
                "INSERT INTO entity_versions
                    (repo_id, stable_id, commit_hash, path, entity_hash, body_hash,
                     name, decl_kind, receiver, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (repo_id, commit_hash, path, entity_hash) DO UPDATE SET
                    stable_id = excluded.stable_id,
                    body_hash = excluded.body_hash,
                    name = excluded.name,
                    decl_kind = excluded.decl_kind,
                    receiver = excluded.receiver",
                params![
                    repo_id,
                    version.stable_id,
                    commit,
                    version.path,
                    version.entity_hash,
                    version.body_hash,
                    version.name,
                    version.decl_kind,
                    version.receiver,
                    to_millis(Utc::now()),
                ],
            )?;
            tx.commit()?;
            debug!(repo_id, commit = %commit, stable_id = %version.stable_id, "stored entity version");
            Ok(())
        })
        .await
    }

    async fn list_versions_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<Vec<EntityVersion>> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entity_versions
                 WHERE repo_id = ?1 AND commit_hash = ?2
                 ORDER BY path, entity_hash",
                VERSION_COLUMNS
            ))?;
            let versions = stmt
                .query_map(params![repo_id, commit], row_to_version)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(versions)
        })
        .await
    }

    async fn count_versions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        filter: &VersionFilter,
    ) -> StoreResult<i64> {
        let filter = filter.normalized();
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            Ok(conn.query_row(
                &format!("SELECT COUNT(*) FROM entity_versions WHERE {}", VERSION_FILTER),
                params![repo_id, filter.stable_id, filter.name, filter.body_hash],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn list_versions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        filter: &VersionFilter,
        page: Page,
    ) -> StoreResult<Vec<EntityVersion>> {
        let filter = filter.normalized();
        let limit = clamp_limit(page.limit) as i64;
        let offset = page.offset as i64;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entity_versions
                 WHERE {}
                 ORDER BY created_at DESC, commit_hash, path, entity_hash
                 LIMIT ?5 OFFSET ?6",
                VERSION_COLUMNS, VERSION_FILTER
            ))?;
            let versions = stmt
                .query_map(
                    params![
                        repo_id,
                        filter.stable_id,
                        filter.name,
                        filter.body_hash,
                        limit,
                        offset
                    ],
                    row_to_version,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(versions)
        })
        .await
    }

    async fn has_versions_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<bool> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM entity_versions WHERE repo_id = ?1 AND commit_hash = ?2)",
                params![repo_id, commit],
                |row| row.get(0),
            )?)
        })
        .await
    }
}
