//! Per-commit entity index over `entity_index_entries` and its FTS5 shadow.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use super::repos::ensure_repository;
use super::{from_millis, to_millis, SqliteStore};
use crate::error::{StoreError, StoreResult};
use crate::index::{
    commit_key, optional_filter, prepare_entries, CommitIndexSummary, CommitRecord,
    EntityIndexEntry, IndexEntry,
};
use crate::search::{self, Fallback};
use crate::store::EntityIndex;
use crate::tenant::TenantScope;

/// Columns of `entity_index_entries e`, in [`row_to_entry`] order.
const ENTRY_COLUMNS: &str = "e.repo_id, e.commit_hash, e.created_at, e.file_path, e.symbol_key,
    e.stable_id, e.kind, e.name, e.signature, e.receiver, e.language, e.doc_comment,
    e.start_line, e.end_line";

fn row_to_entry(row: &Row) -> rusqlite::Result<EntityIndexEntry> {
    Ok(CommitRecord {
        repo_id: row.get(0)?,
        commit_hash: row.get(1)?,
        created_at: from_millis(row.get(2)?),
        record: IndexEntry {
            file_path: row.get(3)?,
            symbol_key: row.get(4)?,
            stable_id: row.get(5)?,
            kind: row.get(6)?,
            name: row.get(7)?,
            signature: row.get(8)?,
            receiver: row.get(9)?,
            language: row.get(10)?,
            doc_comment: row.get(11)?,
            start_line: row.get(12)?,
            end_line: row.get(13)?,
        },
    })
}

fn full_text_hits(
    conn: &Connection,
    repo_id: i64,
    commit: &str,
    expr: &str,
    query: &str,
    kind: Option<&str>,
    limit: i64,
) -> rusqlite::Result<Vec<EntityIndexEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entity_index_fts
         JOIN entity_index_entries e ON e.id = entity_index_fts.rowid
         WHERE entity_index_fts MATCH ?1
           AND e.repo_id = ?2 AND e.commit_hash = ?3
           AND (?4 IS NULL OR e.kind = ?4)
         ORDER BY (lower(e.name) = lower(?5)) DESC, bm25(entity_index_fts),
                  e.name, e.file_path, e.start_line
         LIMIT ?6",
        ENTRY_COLUMNS
    ))?;
    let hits = stmt
        .query_map(params![expr, repo_id, commit, kind, query, limit], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits)
}

fn substring_hits(
    conn: &Connection,
    repo_id: i64,
    commit: &str,
    query: &str,
    kind: Option<&str>,
    limit: i64,
) -> rusqlite::Result<Vec<EntityIndexEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM entity_index_entries e
         WHERE e.repo_id = ?1 AND e.commit_hash = ?2
           AND (?3 IS NULL OR e.kind = ?3)
           AND (e.name LIKE ?4 ESCAPE '\\'
                OR e.signature LIKE ?4 ESCAPE '\\'
                OR e.doc_comment LIKE ?4 ESCAPE '\\')
         ORDER BY (lower(e.name) = lower(?5)) DESC, e.name, e.file_path, e.start_line
         LIMIT ?6",
        ENTRY_COLUMNS
    ))?;
    let hits = stmt
        .query_map(
            params![repo_id, commit, kind, search::like_pattern(query), query, limit],
            row_to_entry,
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(hits)
}

#[async_trait]
impl EntityIndex for SqliteStore {
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

        let written = self
            .write("replace_commit_snapshot", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_repository(&tx, tenant.as_deref(), repo_id)?;
                let now = to_millis(Utc::now());

                tx.execute(
                    "DELETE FROM entity_index_entries WHERE repo_id = ?1 AND commit_hash = ?2",
                    params![repo_id, commit],
                )?;
                tx.execute(
                    "INSERT INTO entity_index_commits (repo_id, commit_hash, entry_count, indexed_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (repo_id, commit_hash) DO UPDATE SET
                        entry_count = excluded.entry_count,
                        indexed_at = excluded.indexed_at",
                    params![repo_id, commit, entries.len() as i64, now],
                )?;

                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO entity_index_entries
                            (repo_id, commit_hash, file_path, symbol_key, stable_id, kind, name,
                             signature, receiver, language, doc_comment, start_line, end_line,
                             created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                         ON CONFLICT (repo_id, commit_hash, symbol_key) DO UPDATE SET
                            file_path = excluded.file_path,
                            stable_id = excluded.stable_id,
                            kind = excluded.kind,
                            name = excluded.name,
                            signature = excluded.signature,
                            receiver = excluded.receiver,
                            language = excluded.language,
                            doc_comment = excluded.doc_comment,
                            start_line = excluded.start_line,
                            end_line = excluded.end_line",
                    )?;
                    for entry in &entries {
                        stmt.execute(params![
                            repo_id,
                            commit,
                            entry.file_path,
                            entry.symbol_key,
                            entry.stable_id,
                            entry.kind,
                            entry.name,
                            entry.signature,
                            entry.receiver,
                            entry.language,
                            entry.doc_comment,
                            entry.start_line,
                            entry.end_line,
                            now,
                        ])?;
                    }
                }

                tx.commit()?;
                Ok(entries.len())
            })
            .await?;

        info!(repo_id, commit = %commit_hash.trim(), entries = written, "replaced commit snapshot");
        Ok(written)
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
        let limit = search::clamp_limit(limit) as i64;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entity_index_entries e
                 WHERE e.repo_id = ?1 AND e.commit_hash = ?2 AND (?3 IS NULL OR e.kind = ?3)
                 ORDER BY e.file_path, e.start_line, e.name
                 LIMIT ?4",
                ENTRY_COLUMNS
            ))?;
            let entries = stmt
                .query_map(params![repo_id, commit, kind, limit], row_to_entry)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
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
        let query = query.trim().to_string();
        if query.is_empty() {
            return Err(StoreError::validation("search query must not be empty"));
        }
        let kind = optional_filter(kind);
        let limit = search::clamp_limit(limit);
        let tenant = scope.as_param();

        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            let terms = search::query_terms(&query);

            let full_text = if terms.is_empty() {
                search::note_fallback(Fallback::NoTokens, &query, None);
                Vec::new()
            } else {
                let expr = search::fts5_match_expr(&terms);
                match full_text_hits(
                    conn,
                    repo_id,
                    &commit,
                    &expr,
                    &query,
                    kind.as_deref(),
                    limit as i64,
                ) {
                    Ok(hits) => hits,
                    Err(err) => {
                        search::note_fallback(
                            Fallback::BackendError,
                            &query,
                            Some(&err.to_string()),
                        );
                        Vec::new()
                    }
                }
            };

            let substring =
                substring_hits(conn, repo_id, &commit, &query, kind.as_deref(), limit as i64)?;
            debug!(
                repo_id,
                commit = %commit,
                full_text = full_text.len(),
                substring = substring.len(),
                "entity search"
            );
            Ok(search::merge_hits(full_text, substring, limit))
        })
        .await
    }

    async fn has_index_for_commit(
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
                "SELECT EXISTS(SELECT 1 FROM entity_index_commits WHERE repo_id = ?1 AND commit_hash = ?2)",
                params![repo_id, commit],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn index_summary(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<CommitIndexSummary> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            conn.query_row(
                "SELECT repo_id, commit_hash, entry_count, indexed_at FROM entity_index_commits
                 WHERE repo_id = ?1 AND commit_hash = ?2",
                params![repo_id, commit],
                |row| {
                    Ok(CommitIndexSummary {
                        repo_id: row.get(0)?,
                        commit_hash: row.get(1)?,
                        entry_count: row.get(2)?,
                        indexed_at: from_millis(row.get(3)?),
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("index for {}@{}", repo_id, commit)))
        })
        .await
    }
}
