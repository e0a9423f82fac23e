use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::repos::ensure_repository;
use super::{to_millis, SqliteStore};
use crate::error::{StoreError, StoreResult};
use crate::index::objects::{merge_base_pair, HashMapping};
use crate::index::required;
use crate::store::{HashMappingStore, MergeBaseCache};
use crate::tenant::TenantScope;

fn upsert_mapping(conn: &Connection, mapping: &HashMapping, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO hash_mappings (repo_id, git_hash, got_hash, object_type, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT (repo_id, git_hash) DO UPDATE SET
            got_hash = excluded.got_hash,
            object_type = excluded.object_type,
            updated_at = excluded.updated_at",
        params![
            mapping.repo_id,
            mapping.git_hash,
            mapping.got_hash,
            mapping.object_type,
            now
        ],
    )?;
    Ok(())
}

#[async_trait]
impl HashMappingStore for SqliteStore {
    async fn set_hash_mapping(&self, scope: &TenantScope, mapping: &HashMapping) -> StoreResult<()> {
        self.set_hash_mappings(scope, std::slice::from_ref(mapping)).await
    }

    async fn set_hash_mappings(
        &self,
        scope: &TenantScope,
        mappings: &[HashMapping],
    ) -> StoreResult<()> {
        let mappings = mappings
            .iter()
            .map(HashMapping::validated)
            .collect::<StoreResult<Vec<_>>>()?;
        if mappings.is_empty() {
            return Ok(());
        }
        let tenant = scope.as_param();

        let count = mappings.len();
        self.write("set_hash_mappings", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut checked = Vec::new();
            for mapping in &mappings {
                if !checked.contains(&mapping.repo_id) {
                    ensure_repository(&tx, tenant.as_deref(), mapping.repo_id)?;
                    checked.push(mapping.repo_id);
                }
            }
            let now = to_millis(Utc::now());
            for mapping in &mappings {
                upsert_mapping(&tx, mapping, now)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;

        debug!(count, "stored hash mappings");
        Ok(())
    }

    async fn get_got_hash(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        git_hash: &str,
    ) -> StoreResult<String> {
        let git_hash = required("git hash", git_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            conn.query_row(
                "SELECT got_hash FROM hash_mappings WHERE repo_id = ?1 AND git_hash = ?2",
                params![repo_id, git_hash],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("hash mapping for git {}", git_hash)))
        })
        .await
    }

    async fn get_git_hash(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        got_hash: &str,
    ) -> StoreResult<String> {
        let got_hash = required("got hash", got_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            conn.query_row(
                "SELECT git_hash FROM hash_mappings WHERE repo_id = ?1 AND got_hash = ?2",
                params![repo_id, got_hash],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("hash mapping for got {}", got_hash)))
        })
        .await
    }
}

#[async_trait]
impl MergeBaseCache for SqliteStore {
    async fn set_merge_base(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        left: &str,
        right: &str,
        base: &str,
    ) -> StoreResult<()> {
        let (left, right) = merge_base_pair(left, right)?;
        let base = required("merge base", base)?;
        let tenant = scope.as_param();

        self.write("set_merge_base", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_repository(&tx, tenant.as_deref(), repo_id)?;
            let now = to_millis(Utc::now());
            tx.execute(
                "INSERT INTO merge_base_cache (repo_id, left_hash, right_hash, base_hash, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)
                 ON CONFLICT (repo_id, left_hash, right_hash) DO UPDATE SET
                    base_hash = excluded.base_hash,
                    updated_at = excluded.updated_at",
                params![repo_id, left, right, base, now],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_merge_base(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        left: &str,
        right: &str,
    ) -> StoreResult<Option<String>> {
        let (left, right) = merge_base_pair(left, right)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            Ok(conn
                .query_row(
                    "SELECT base_hash FROM merge_base_cache
                     WHERE repo_id = ?1 AND left_hash = ?2 AND right_hash = ?3",
                    params![repo_id, left, right],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}
