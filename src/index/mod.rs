// Commit-scoped entity, symbol and cross-reference types

pub mod objects;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{StoreError, StoreResult};

/// Edge kind used when the indexer does not name one.
pub const DEFAULT_EDGE_KIND: &str = "call";

/// A sighting of a stable entity while indexing one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySighting {
    pub stable_id: String,
    pub name: String,
    pub decl_kind: String,
    pub receiver: String,
}

/// Durable identity of a code entity across commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityIdentity {
    pub repo_id: i64,
    pub stable_id: String,
    pub name: String,
    pub decl_kind: String,
    pub receiver: String,
    pub first_seen_commit: String,
    pub last_seen_commit: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What an identity looked like at one path in one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionSnapshot {
    pub stable_id: String,
    pub path: String,
    pub entity_hash: String,
    pub body_hash: String,
    pub name: String,
    pub decl_kind: String,
    pub receiver: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityVersion {
    pub repo_id: i64,
    pub stable_id: String,
    pub commit_hash: String,
    pub path: String,
    pub entity_hash: String,
    pub body_hash: String,
    pub name: String,
    pub decl_kind: String,
    pub receiver: String,
    pub created_at: DateTime<Utc>,
}

/// Filters for version listing; set fields combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionFilter {
    pub stable_id: Option<String>,
    pub name: Option<String>,
    /// Matched case-insensitively.
    pub body_hash: Option<String>,
}

impl VersionFilter {
    /// Blank filter values are treated as unset.
    pub fn normalized(&self) -> VersionFilter {
        fn clean(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }
        VersionFilter {
            stable_id: clean(&self.stable_id),
            name: clean(&self.name),
            body_hash: clean(&self.body_hash),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One symbol in a commit's searchable index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub file_path: String,
    pub symbol_key: String,
    pub stable_id: String,
    pub kind: String,
    pub name: String,
    pub signature: String,
    pub receiver: String,
    pub language: String,
    pub doc_comment: String,
    pub start_line: i64,
    pub end_line: i64,
}

/// A definition node in a commit's cross-reference graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    pub entity_id: String,
    pub file: String,
    pub package_name: String,
    pub kind: String,
    pub name: String,
    pub signature: String,
    pub receiver: String,
    pub start_line: i64,
    pub end_line: i64,
    pub callable: bool,
}

/// A directed relationship between two definitions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub source_entity_id: String,
    pub target_entity_id: String,
    pub kind: String,
    pub source_file: String,
    pub source_line: i64,
    pub resolution: String,
    pub count: i64,
}

/// A stored row belonging to one commit snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRecord<T> {
    pub repo_id: i64,
    pub commit_hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub record: T,
}

pub type EntityIndexEntry = CommitRecord<IndexEntry>;
pub type XRefDefinition = CommitRecord<Definition>;
pub type XRefEdge = CommitRecord<Edge>;

/// Row-count summary written with every index snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitIndexSummary {
    pub repo_id: i64,
    pub commit_hash: String,
    pub entry_count: i64,
    pub indexed_at: DateTime<Utc>,
}

/// Rows written by a graph replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphCounts {
    pub definitions: usize,
    pub edges: usize,
}

/// Validate the `(repo, commit)` key of a snapshot call.
pub fn commit_key(commit_hash: &str) -> StoreResult<String> {
    let commit = commit_hash.trim();
    if commit.is_empty() {
        return Err(StoreError::validation("commit hash must not be empty"));
    }
    Ok(commit.to_string())
}

pub fn required(field: &str, value: &str) -> StoreResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(StoreError::validation(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}

/// Optional kind/name filter; blank means unset.
pub fn optional_filter(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Drop entries without a symbol key and collapse duplicate keys (last wins).
pub fn prepare_entries(entries: &[IndexEntry]) -> Vec<IndexEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut by_key: HashMap<String, IndexEntry> = HashMap::new();
    for entry in entries {
        let key = entry.symbol_key.trim();
        if key.is_empty() {
            continue;
        }
        let mut entry = entry.clone();
        entry.symbol_key = key.to_string();
        if by_key.insert(key.to_string(), entry).is_none() {
            order.push(key.to_string());
        }
    }
    order
        .into_iter()
        .filter_map(|key| by_key.remove(&key))
        .collect()
}

/// Drop definitions without an entity id and collapse duplicates (last wins).
pub fn prepare_definitions(defs: &[Definition]) -> Vec<Definition> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Definition> = HashMap::new();
    for def in defs {
        let id = def.entity_id.trim();
        if id.is_empty() {
            continue;
        }
        let mut def = def.clone();
        def.entity_id = id.to_string();
        if by_id.insert(id.to_string(), def).is_none() {
            order.push(id.to_string());
        }
    }
    order.into_iter().filter_map(|id| by_id.remove(&id)).collect()
}

/// Apply edge defaults, drop dangling edges and aggregate repeated pairs.
///
/// The first occurrence of a `(source, target, kind)` triple keeps its call
/// site; later occurrences only add to `count`.
pub fn prepare_edges(edges: &[Edge]) -> Vec<Edge> {
    let mut merged: Vec<Edge> = Vec::new();
    let mut index: HashMap<(String, String, String), usize> = HashMap::new();
    for edge in edges {
        let source = edge.source_entity_id.trim();
        let target = edge.target_entity_id.trim();
        if source.is_empty() || target.is_empty() {
            continue;
        }
        let kind = match edge.kind.trim() {
            "" => DEFAULT_EDGE_KIND.to_string(),
            k => k.to_string(),
        };
        let count = if edge.count > 0 { edge.count } else { 1 };
        let key = (source.to_string(), target.to_string(), kind.clone());
        match index.get(&key) {
            Some(&pos) => merged[pos].count += count,
            None => {
                index.insert(key, merged.len());
                merged.push(Edge {
                    source_entity_id: source.to_string(),
                    target_entity_id: target.to_string(),
                    kind,
                    source_file: edge.source_file.clone(),
                    source_line: edge.source_line,
                    resolution: edge.resolution.clone(),
                    count,
                });
            }
        }
    }
    merged
}
