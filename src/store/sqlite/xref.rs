use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use tracing::info;

use super::repos::ensure_repository;
use super::{from_millis, to_millis, SqliteStore};
use crate::error::{StoreError, StoreResult};
use crate::index::{
    commit_key, optional_filter, prepare_definitions, prepare_edges, required, CommitRecord,
    Definition, Edge, GraphCounts, XRefDefinition, XRefEdge,
};
use crate::search::{clamp_limit, like_pattern};
use crate::store::XRefGraph;
use crate::tenant::TenantScope;

const DEFINITION_COLUMNS: &str = "repo_id, commit_hash, created_at, entity_id, file, package_name,
    kind, name, signature, receiver, start_line, end_line, callable";

const EDGE_COLUMNS: &str = "repo_id, commit_hash, created_at, source_entity_id, target_entity_id,
    kind, source_file, source_line, resolution, count";

fn row_to_definition(row: &Row) -> rusqlite::Result<XRefDefinition> {
    Ok(CommitRecord {
        repo_id: row.get(0)?,
        commit_hash: row.get(1)?,
        created_at: from_millis(row.get(2)?),
        record: Definition {
            entity_id: row.get(3)?,
            file: row.get(4)?,
            package_name: row.get(5)?,
            kind: row.get(6)?,
            name: row.get(7)?,
            signature: row.get(8)?,
            receiver: row.get(9)?,
            start_line: row.get(10)?,
            end_line: row.get(11)?,
            callable: row.get(12)?,
        },
    })
}

fn row_to_edge(row: &Row) -> rusqlite::Result<XRefEdge> {
    Ok(CommitRecord {
        repo_id: row.get(0)?,
        commit_hash: row.get(1)?,
        created_at: from_millis(row.get(2)?),
        record: Edge {
            source_entity_id: row.get(3)?,
            target_entity_id: row.get(4)?,
            kind: row.get(5)?,
            source_file: row.get(6)?,
            source_line: row.get(7)?,
            resolution: row.get(8)?,
            count: row.get(9)?,
        },
    })
}

#[derive(Clone, Copy)]
enum Direction {
    Outgoing,
    Incoming,
}

impl SqliteStore {
    async fn edges(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
        kind: Option<&str>,
        direction: Direction,
    ) -> StoreResult<Vec<XRefEdge>> {
        let commit = commit_key(commit_hash)?;
        let entity_id = required("entity id", entity_id)?;
        let kind = optional_filter(kind);
        let tenant = scope.as_param();
        let (anchor, order) = match direction {
            Direction::Outgoing => ("source_entity_id", "target_entity_id"),
            Direction::Incoming => ("target_entity_id", "source_entity_id"),
        };

        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM xref_edges
                 WHERE repo_id = ?1 AND commit_hash = ?2 AND {} = ?3 AND (?4 IS NULL OR kind = ?4)
                 ORDER BY {}, kind",
                EDGE_COLUMNS, anchor, order
            ))?;
            let edges = stmt
                .query_map(params![repo_id, commit, entity_id, kind], row_to_edge)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(edges)
        })
        .await
    }
}

#[async_trait]
impl XRefGraph for SqliteStore {
    async fn replace_commit_graph(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        definitions: &[Definition],
        edges: &[Edge],
    ) -> StoreResult<GraphCounts> {
        let commit = commit_key(commit_hash)?;
        let definitions = prepare_definitions(definitions);
        let edges = prepare_edges(edges);
        let tenant = scope.as_param();

        let counts = self
            .write("replace_commit_graph", move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_repository(&tx, tenant.as_deref(), repo_id)?;
                let now = to_millis(Utc::now());

                tx.execute(
                    "DELETE FROM xref_edges WHERE repo_id = ?1 AND commit_hash = ?2",
                    params![repo_id, commit],
                )?;
                tx.execute(
                    "DELETE FROM xref_definitions WHERE repo_id = ?1 AND commit_hash = ?2",
                    params![repo_id, commit],
                )?;
                tx.execute(
                    "INSERT INTO xref_graph_commits
                        (repo_id, commit_hash, definition_count, edge_count, indexed_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT (repo_id, commit_hash) DO UPDATE SET
                        definition_count = excluded.definition_count,
                        edge_count = excluded.edge_count,
                        indexed_at = excluded.indexed_at",
                    params![
                        repo_id,
                        commit,
                        definitions.len() as i64,
                        edges.len() as i64,
                        now
                    ],
                )?;

                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO xref_definitions
                            (repo_id, commit_hash, entity_id, file, package_name, kind, name,
                             signature, receiver, start_line, end_line, callable, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                         ON CONFLICT (repo_id, commit_hash, entity_id) DO UPDATE SET
                            file = excluded.file,
                            package_name = excluded.package_name,
                            kind = excluded.kind,
                            name = excluded.name,
                            signature = excluded.signature,
                            receiver = excluded.receiver,
                            start_line = excluded.start_line,
                            end_line = excluded.end_line,
                            callable = excluded.callable",
                    )?;
                    for def in &definitions {
                        stmt.execute(params![
                            repo_id,
                            commit,
                            def.entity_id,
                            def.file,
                            def.package_name,
                            def.kind,
                            def.name,
                            def.signature,
                            def.receiver,
                            def.start_line,
                            def.end_line,
                            def.callable,
                            now,
                        ])?;
                    }
                }

                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO xref_edges
                            (repo_id, commit_hash, source_entity_id, target_entity_id, kind,
                             source_file, source_line, resolution, count, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                         ON CONFLICT (repo_id, commit_hash, source_entity_id, target_entity_id, kind)
                         DO UPDATE SET count = xref_edges.count + excluded.count",
                    )?;
                    for edge in &edges {
                        stmt.execute(params![
                            repo_id,
                            commit,
                            edge.source_entity_id,
                            edge.target_entity_id,
                            edge.kind,
                            edge.source_file,
                            edge.source_line,
                            edge.resolution,
                            edge.count,
                            now,
                        ])?;
                    }
                }

                tx.commit()?;
                Ok(GraphCounts {
                    definitions: definitions.len(),
                    edges: edges.len(),
                })
            })
            .await?;

        info!(
            repo_id,
            commit = %commit_hash.trim(),
            definitions = counts.definitions,
            edges = counts.edges,
            "replaced commit graph"
        );
        Ok(counts)
    }

    async fn get_definition(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
    ) -> StoreResult<XRefDefinition> {
        let commit = commit_key(commit_hash)?;
        let entity_id = required("entity id", entity_id)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            conn.query_row(
                &format!(
                    "SELECT {} FROM xref_definitions
                     WHERE repo_id = ?1 AND commit_hash = ?2 AND entity_id = ?3",
                    DEFINITION_COLUMNS
                ),
                params![repo_id, commit, entity_id],
                row_to_definition,
            )
            .optional()?
            .ok_or_else(|| StoreError::not_found(format!("definition {}", entity_id)))
        })
        .await
    }

    async fn search_definitions(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        name: &str,
        limit: usize,
    ) -> StoreResult<Vec<XRefDefinition>> {
        let commit = commit_key(commit_hash)?;
        let name = required("definition name", name)?;
        let limit = clamp_limit(limit) as i64;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM xref_definitions
                 WHERE repo_id = ?1 AND commit_hash = ?2 AND name LIKE ?3 ESCAPE '\\'
                 ORDER BY (lower(name) = lower(?4)) DESC, name, file, start_line
                 LIMIT ?5",
                DEFINITION_COLUMNS
            ))?;
            let defs = stmt
                .query_map(
                    params![repo_id, commit, like_pattern(&name), name, limit],
                    row_to_definition,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(defs)
        })
        .await
    }

    async fn outgoing_edges(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
        kind: Option<&str>,
    ) -> StoreResult<Vec<XRefEdge>> {
        self.edges(scope, repo_id, commit_hash, entity_id, kind, Direction::Outgoing)
            .await
    }

    async fn incoming_edges(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
        entity_id: &str,
        kind: Option<&str>,
    ) -> StoreResult<Vec<XRefEdge>> {
        self.edges(scope, repo_id, commit_hash, entity_id, kind, Direction::Incoming)
            .await
    }

    async fn has_graph_for_commit(
        &self,
        scope: &TenantScope,
        repo_id: i64,
        commit_hash: &str,
    ) -> StoreResult<bool> {
        let commit = commit_key(commit_hash)?;
        let tenant = scope.as_param();
        self.read(move |conn| {
            ensure_repository(conn, tenant.as_deref(), repo_id)?;
            // An analyzed commit with an empty graph still has its summary row.
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM xref_graph_commits WHERE repo_id = ?1 AND commit_hash = ?2)",
                params![repo_id, commit],
                |row| row.get(0),
            )?)
        })
        .await
    }
}
