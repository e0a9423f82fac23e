use async_trait::async_trait;
use chrono::Utc;
use sqlx::QueryBuilder;
use std::collections::BTreeSet;
use tracing::debug;

use super::repos::ensure_repository;
use super::{PostgresStore, INSERT_BATCH_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::index::objects::{merge_base_pair, HashMapping};
use crate::index::required;
use crate::store::{HashMappingStore, MergeBaseCache};
use crate::tenant::TenantScope;

#[async_trait]
impl HashMappingStore for PostgresStore {
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

        let mut tx = self.pool.begin().await?;
        let repos: BTreeSet<i64> = mappings.iter().map(|m| m.repo_id).collect();
        for repo_id in repos {
            ensure_repository(&mut tx, tenant.as_deref(), repo_id).await?;
        }

        let now = Utc::now();
        // One statement may not touch the same key twice; later entries win.
        let mut seen = BTreeSet::new();
        let mut deduped: Vec<&HashMapping> = mappings
            .iter()
            .rev()
            .filter(|m| seen.insert((m.repo_id, m.git_hash.clone())))
            .collect();
        deduped.reverse();

        for chunk in deduped.chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::new(
                "INSERT INTO hash_mappings
                    (repo_id, git_hash, got_hash, object_type, created_at, updated_at) ",
            );
            qb.push_values(chunk.iter().copied(), |mut b, mapping| {
                b.push_bind(mapping.repo_id)
                    .push_bind(&mapping.git_hash)
                    .push_bind(&mapping.got_hash)
                    .push_bind(&mapping.object_type)
                    .push_bind(now)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT (repo_id, git_hash) DO UPDATE SET
                    got_hash = EXCLUDED.got_hash,
                    object_type = EXCLUDED.object_type,
                    updated_at = EXCLUDED.updated_at",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(count = mappings.len(), "stored hash mappings");
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
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let got: Option<String> = sqlx::query_scalar(
            "SELECT got_hash FROM hash_mappings WHERE repo_id = $1 AND git_hash = $2",
        )
        .bind(repo_id)
        .bind(&git_hash)
        .fetch_optional(&mut *conn)
        .await?;
        got.ok_or_else(|| StoreError::not_found(format!("hash mapping for git {}", git_hash)))
    }

    async fn get_git_hash(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        got_hash: &str,
    ) -> StoreResult<String> {
        let got_hash = required("got hash", got_hash)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let git: Option<String> = sqlx::query_scalar(
            "SELECT git_hash FROM hash_mappings WHERE repo_id = $1 AND got_hash = $2",
        )
        .bind(repo_id)
        .bind(&got_hash)
        .fetch_optional(&mut *conn)
        .await?;
        git.ok_or_else(|| StoreError::not_found(format!("hash mapping for got {}", got_hash)))
    }
}

#[async_trait]
impl MergeBaseCache for PostgresStore {
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
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO merge_base_cache
                (repo_id, left_hash, right_hash, base_hash, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $5)
             ON CONFLICT (repo_id, left_hash, right_hash) DO UPDATE SET
                base_hash = EXCLUDED.base_hash,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(repo_id)
        .bind(&left)
        .bind(&right)
        .bind(&base)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        Ok(())
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
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let base: Option<String> = sqlx::query_scalar(
            "SELECT base_hash FROM merge_base_cache
             WHERE repo_id = $1 AND left_hash = $2 AND right_hash = $3",
        )
        .bind(repo_id)
        .bind(&left)
        .bind(&right)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(base)
    }
}
