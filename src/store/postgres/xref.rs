use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use tracing::info;

use super::repos::ensure_repository;
use super::{PostgresStore, INSERT_BATCH_SIZE};
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

#[derive(sqlx::FromRow)]
struct DefinitionRow {
    repo_id: i64,
    commit_hash: String,
    created_at: DateTime<Utc>,
    entity_id: String,
    file: String,
    package_name: String,
    kind: String,
    name: String,
    signature: String,
    receiver: String,
    start_line: i64,
    end_line: i64,
    callable: bool,
}

impl From<DefinitionRow> for XRefDefinition {
    fn from(row: DefinitionRow) -> Self {
        CommitRecord {
            repo_id: row.repo_id,
            commit_hash: row.commit_hash,
            created_at: row.created_at,
            record: Definition {
                entity_id: row.entity_id,
                file: row.file,
                package_name: row.package_name,
                kind: row.kind,
                name: row.name,
                signature: row.signature,
                receiver: row.receiver,
                start_line: row.start_line,
                end_line: row.end_line,
                callable: row.callable,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
struct EdgeRow {
    repo_id: i64,
    commit_hash: String,
    created_at: DateTime<Utc>,
    source_entity_id: String,
    target_entity_id: String,
    kind: String,
    source_file: String,
    source_line: i64,
    resolution: String,
    count: i64,
}

impl From<EdgeRow> for XRefEdge {
    fn from(row: EdgeRow) -> Self {
        CommitRecord {
            repo_id: row.repo_id,
            commit_hash: row.commit_hash,
            created_at: row.created_at,
            record: Edge {
                source_entity_id: row.source_entity_id,
                target_entity_id: row.target_entity_id,
                kind: row.kind,
                source_file: row.source_file,
                source_line: row.source_line,
                resolution: row.resolution,
                count: row.count,
            },
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Outgoing,
    Incoming,
}

impl PostgresStore {
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
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let rows: Vec<EdgeRow> = sqlx::query_as(&format!(
            "SELECT {} FROM xref_edges
             WHERE repo_id = $1 AND commit_hash = $2 AND {} = $3 AND ($4::text IS NULL OR kind = $4)
             ORDER BY {}, kind",
            EDGE_COLUMNS, anchor, order
        ))
        .bind(repo_id)
        .bind(&commit)
        .bind(&entity_id)
        .bind(&kind)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(XRefEdge::from).collect())
    }
}

#[async_trait]
impl XRefGraph for PostgresStore {
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

        let mut tx = self.pool.begin().await?;
        ensure_repository(&mut tx, tenant.as_deref(), repo_id).await?;
        let now = Utc::now();

        sqlx::query("DELETE FROM xref_edges WHERE repo_id = $1 AND commit_hash = $2")
            .bind(repo_id)
            .bind(&commit)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM xref_definitions WHERE repo_id = $1 AND commit_hash = $2")
            .bind(repo_id)
            .bind(&commit)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO xref_graph_commits
                (repo_id, commit_hash, definition_count, edge_count, indexed_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (repo_id, commit_hash) DO UPDATE SET
                definition_count = EXCLUDED.definition_count,
                edge_count = EXCLUDED.edge_count,
                indexed_at = EXCLUDED.indexed_at",
        )
        .bind(repo_id)
        .bind(&commit)
        .bind(definitions.len() as i64)
        .bind(edges.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for chunk in definitions.chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::new(
                "INSERT INTO xref_definitions
                    (repo_id, commit_hash, entity_id, file, package_name, kind, name,
                     signature, receiver, start_line, end_line, callable, created_at) ",
            );
            qb.push_values(chunk.iter(), |mut b, def| {
                b.push_bind(repo_id)
                    .push_bind(&commit)
                    .push_bind(&def.entity_id)
                    .push_bind(&def.file)
                    .push_bind(&def.package_name)
                    .push_bind(&def.kind)
                    .push_bind(&def.name)
                    .push_bind(&def.signature)
                    .push_bind(&def.receiver)
                    .push_bind(def.start_line)
                    .push_bind(def.end_line)
                    .push_bind(def.callable)
                    .push_bind(now);
            });
            qb.build().execute(&mut *tx).await?;
        }

        for chunk in edges.chunks(INSERT_BATCH_SIZE) {
            let mut qb = QueryBuilder::new(
                "INSERT INTO xref_edges
                    (repo_id, commit_hash, source_entity_id, target_entity_id, kind,
                     source_file, source_line, resolution, count, created_at) ",
            );
            qb.push_values(chunk.iter(), |mut b, edge| {
                b.push_bind(repo_id)
                    .push_bind(&commit)
                    .push_bind(&edge.source_entity_id)
                    .push_bind(&edge.target_entity_id)
                    .push_bind(&edge.kind)
                    .push_bind(&edge.source_file)
                    .push_bind(edge.source_line)
                    .push_bind(&edge.resolution)
                    .push_bind(edge.count)
                    .push_bind(now);
            });
            qb.push(
                " ON CONFLICT (repo_id, commit_hash, source_entity_id, target_entity_id, kind)
                  DO UPDATE SET count = xref_edges.count + EXCLUDED.count",
            );
            qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        let counts = GraphCounts {
            definitions: definitions.len(),
            edges: edges.len(),
        };
        info!(
            repo_id,
            commit = %commit,
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
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let row: Option<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM xref_definitions
             WHERE repo_id = $1 AND commit_hash = $2 AND entity_id = $3",
            DEFINITION_COLUMNS
        ))
        .bind(repo_id)
        .bind(&commit)
        .bind(&entity_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.map(XRefDefinition::from)
            .ok_or_else(|| StoreError::not_found(format!("definition {}", entity_id)))
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
        let tenant = scope.as_param();
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let rows: Vec<DefinitionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM xref_definitions
             WHERE repo_id = $1 AND commit_hash = $2 AND name ILIKE $3 ESCAPE '\\'
             ORDER BY (lower(name) = lower($4)) DESC, name, file, start_line
             LIMIT $5",
            DEFINITION_COLUMNS
        ))
        .bind(repo_id)
        .bind(&commit)
        .bind(like_pattern(&name))
        .bind(&name)
        .bind(clamp_limit(limit) as i64)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(XRefDefinition::from).collect())
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
        let mut conn = self.pool.acquire().await?;
        ensure_repository(&mut conn, tenant.as_deref(), repo_id).await?;

        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM xref_graph_commits WHERE repo_id = $1 AND commit_hash = $2)",
        )
        .bind(repo_id)
        .bind(&commit)
        .fetch_one(&mut *conn)
        .await?;
        Ok(exists)
    }
}
