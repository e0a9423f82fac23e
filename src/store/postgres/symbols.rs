use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, QueryBuilder};
use tracing::{debug, info};

use super::repos::ensure_repository;
use super::{PostgresStore, INSERT_BATCH_SIZE};
use crate::error::{StoreError, StoreResult};
use crate::index::{
    commit_key, optional_filter, prepare_entries, CommitIndexSummary, CommitRecord,
    EntityIndexEntry, IndexEntry,
};
use crate::search::{self, Fallback};
use crate::store::EntityIndex;
use crate::tenant::TenantScope;

const ENTRY_COLUMNS: &str = "repo_id, commit_hash, created_at, file_path, symbol_key, stable_id,
    kind, name, signature, receiver, language, doc_comment, start_line, end_line";

#[derive(sqlx::FromRow)]
struct EntryRow {
    repo_id: i64,
    commit_hash: String,
    created_at: DateTime<Utc>,
    file_path: String,
    symbol_key: String,
    stable_id: String,
    kind: String,
    name: String,
    signature: String,
    receiver: String,
    language: String,
    doc_comment: String,
    start_line: i64,
    end_line: i64,
}

impl From<EntryRow> for EntityIndexEntry {
    fn from(row: EntryRow) -> Self {
        CommitRecord {
            repo_id: row.repo_id,
            commit_hash: row.commit_hash,
            created_at: row.created_at,
            record: IndexEntry {
                file_path: row.file_path,
                symbol_key: row.symbol_key,
                stable_id: row.stable_id,
                kind: row.kind,
                name: row.name,
                signature: row.signature,
                receiver: row.receiver,
                language: row.language,
                doc_comment: row.doc_comment,
                start_line: row.start_line,
                end_line: row.end_line,
            },
        }
    }
}

async fn full_text_hits(
    conn: &mut PgConnection,
    repo_id: i64,
    commit: &str,
    tsquery: &str,
    query: &str,
    kind: Option<&str>,
    limit: i64,
) -> StoreResult<Vec<EntityIndexEntry>> {
    let rows: Vec<EntryRow> = sqlx::query_as(&format!(
        "SELECT {} FROM entity_index_entries
         WHERE repo_id = $1 AND commit_hash = $2
           AND ($3::text IS NULL OR kind = $3)
           AND search_vector @@ to_tsquery('simple', $4)
         ORDER BY (lower(name) = lower($5)) DESC,
                  ts_rank(search_vector, to_tsquery('simple', $4)) DESC,
                  name, file_path, start_line
         LIMIT $6",
        ENTRY_COLUMNS
    ))
    .bind(repo_id)
    .bind(commit)
    .bind(kind)
    .bind(tsquery)
    .bind(query)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(EntityIndexEntry::from).collect())
}

async fn substring_hits(
    conn: &mut PgConnection,
    repo_id: i64,
    commit: &str,
    query: &str,
    kind: Option<&str>,
    limit: i64,
) -> StoreResult<Vec<EntityIndexEntry>> {
    let rows: Vec<EntryRow> = sqlx::query_as(&format!(
        "SELECT {} FROM entity_index_entries
         WHERE repo_id = $1 AND commit_hash = $2
           AND ($3::text IS NULL OR kind = $3)
           AND (name ILIKE $4 ESCAPE '\\'
                OR signature ILIKE $4 ESCAPE '\\'
                OR doc_comment ILIKE $4 ESCAPE '\\')
         ORDER BY (lower(name) = lower($5)) DESC, name, file_path, start_line
         LIMIT $6",
        ENTRY_COLUMNS
    ))
    .bind(repo_id)
    .bind(commit)
    .bind(kind)
    .bind(search::like_pattern(query))
    .bind(query)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(EntityIndexEntry::from).collect())
}

#[async_trait]
impl EntityIndex for PostgresStore {
    async fn replace_commit_snapshot(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entries: &[IndexEntry],
    ) -> StoreResult<usize> {
        let commit = commit_key(commit_hash)?;
        let entries = prepare_entries(entries);
        let tenant = scope.as_param();

        let mut tx = self.pool.begin().await?;
        ensure_repository(&mut tx, tenant.as_deref(), repo_id).await?;
        let now = Utc::now();

        sqlx::query("DELETE FROM entity_index_entries WHERE repo_id = $1 AND commit_hash = $2")
            .bind(repo_id)
            .bind(&commit)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO entity_index_commits (repo_id, commit_hash, entry_count, indexed_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (repo_id, commit_hash) DO UPDATE SET
                entry_count = EXCLUDED.entry_count,
                indexed_at = EXCLUDED.indexed_at",
        )
        .bind(repo_id)
        .bind(&commit)
        .bind(entries.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for chunk in entries.chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::new(
                "INSERT INTO entity_index_entries
                    (repo_id, commit_hash, file_path, symbol_key, stable_id, kind, name,
                     signature, receiver, language, doc_comment, start_line, end_line, created_at) ",
            );
            qb.push_values(chunk.iter(), |mut b, entry| {
                b.push_bind(repo_id)
                    .push_bind(&commit)
                    .push_bind(&entry.file_path)
                    .push_bind(&entry.symbol_key)
                    .push_bind(&entry.stable_id)
                    .push_bind(&entry.kind)
                    .push_bind(&entry.name)
                    .push_bind(&entry.signature)
                    .push_bind(&entry.receiver)
                    .push_bind(&entry.language)
                    .push_bind(&entry.doc_comment)
                    .push_bind(entry.start_line)
                    .push_bind(entry.end_line)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT (repo_id, commit_hash, symbol_key) DO UPDATE SET
                    file_path = EXCLUDED.file_path,
                    stable_id = EXCLUDED.stable_id,
                    kind = EXCLUDED.kind,
                    name = EXCLUDED.name,
                    signature = EXCLUDED.signature,
                    receiver = EXCLUDED.receiver,
                    language = EXCLUDED.language,
                    doc_comment = EXCLUDED.doc_comment,
                    start_line = EXCLUDED.start_line,
                    end_line = EXCLUDED.end_line",
            );
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        info!(repo_id, commit = %commit, entries = entries.len(), "replaced commit snapshot");
        Ok(entries.len())
    }

    async fn list_by_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EntityIndexEntry>> {
        let commit = commit_key(commit_hash)?;
        let kind = optional_filter(kind);
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let rows: Vec<EntryRow> = sqlx::query_as(&format!(
            "SELECT {} FROM entity_index_entries
             WHERE repo_id = $1 AND commit_hash = $2 AND ($3::text IS NULL OR kind = $3)
             ORDER BY file_path, start_line, name
             LIMIT $4",
            ENTRY_COLUMNS
        ))
        .bind(repo_id)
        .bind(&commit)
        .bind(&kind)
        .bind(search::clamp_limit(limit) as i64)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(EntityIndexEntry::from).collect())
    }

    async fn search_entities(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        query: &str,
        kind: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<EntityIndexEntry>> {
        let commit = commit_key(commit_hash)?;
        let query = query.trim();
        if query.is_empty() {
            return Err(StoreError::validation("search query must not be empty"));
        }
        let kind = optional_filter(kind);
        let limit = search::clamp_limit(limit);
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let terms = search::query_terms(query);
        let full_text = if terms.is_empty() {
            search::note_fallback(Fallback::NoTokens, query, None);
            Vec::new()
        } else {
            let tsquery = search::tsquery_expr(&terms);
            match full_text_hits(
                &mut conn,
                repo_id,
                &commit,
                &tsquery,
                query,
                kind.as_deref(),
                limit as i64,
            )
            .await
            {
                Ok(hits) => hits,
                Err(err) => {
                    search::note_fallback(Fallback::BackendError, query, Some(&err.to_string()));
                    Vec::new()
                }
            }
        };

        let substring =
            substring_hits(&mut conn, repo_id, &commit, query, kind.as_deref(), limit as i64)
                .await?;
        debug!(
            repo_id,
            commit = %commit,
            full_text = full_text.len(),
            substring = substring.len(),
            "entity search"
        );
        Ok(search::merge_hits(full_text, substring, limit))
    }

    async fn has_index_for_commit(
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
            "SELECT EXISTS(SELECT 1 FROM entity_index_commits WHERE repo_id = $1 AND commit_hash = $2)",
        )
        .bind(repo_id)
        .bind(&commit)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }

    async fn index_summary(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<CommitIndexSummary> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let row: Option<(i64, String, i64, DateTime<Utc>)> = sqlx::query_as(
            "SELECT repo_id, commit_hash, entry_count, indexed_at FROM entity_index_commits
             WHERE repo_id = $1 AND commit_hash = $2",
        )
        .bind(repo_id)
        .bind(&commit)
        .fetch_optional(&mut *conn)
        .await?;

        row.map(|(repo_id, commit_hash, entry_count, indexed_at)| CommitIndexSummary {
            repo_id,
            commit_hash,
            entry_count,
            indexed_at,
        })
        .ok_or_else(|| StoreError::not_found(format!("index for {}@{}", repo_id, commit)))
    }
}
