// Call-graph navigation over a commit's xref graph

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::StoreResult;
use crate::index::{XRefDefinition, XRefEdge, DEFAULT_EDGE_KIND};
use crate::store::Store;
use crate::tenant::TenantScope;

/// Query result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub entity_id: String,
    pub name: String,
    pub kind: String,
    pub file: String,
    pub line: i64,
    /// Where the call happens (caller side).
    pub call_file: String,
    pub call_line: i64,
    pub count: i64,
    /// False when the other endpoint has no definition in this commit.
    pub resolved: bool,
}

impl QueryResult {
    fn from_edge(entity_id: &str, edge: &XRefEdge, def: Option<XRefDefinition>) -> Self {
        let (name, kind, file, line, resolved) = match def {
            Some(def) => (
                def.record.name,
                def.record.kind,
                def.record.file,
                def.record.start_line,
                true,
            ),
            None => (String::new(), String::new(), String::new(), 0, false),
        };
        Self {
            entity_id: entity_id.to_string(),
            name,
            kind,
            file,
            line,
            call_file: edge.record.source_file.clone(),
            call_line: edge.record.source_line,
            count: edge.record.count,
            resolved,
        }
    }
}

/// Navigator over one store and tenant scope
pub struct Navigator {
    store: Arc<dyn Store>,
    scope: TenantScope,
}

impl Navigator {
    pub fn new(store: Arc<dyn Store>, scope: TenantScope) -> Self {
        Self { store, scope }
    }

    /// Definitions matching `symbol`: an exact entity id first, else exact
    /// (case-insensitive) name matches.
    pub async fn resolve(
        &self,
        repo_id: i64,
        commit: &str,
        symbol: &str,
    ) -> StoreResult<Vec<XRefDefinition>> {
        match self
            .store
            .get_definition(&self.scope, repo_id, commit, symbol)
            .await
        {
            Ok(def) => return Ok(vec![def]),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let candidates = self
            .store
            .search_definitions(&self.scope, repo_id, commit, symbol, 0)
            .await?;
        Ok(candidates
            .into_iter()
            .filter(|def| def.record.name.eq_ignore_ascii_case(symbol.trim()))
            .collect())
    }

    /// Find all callers of a symbol
    pub async fn callers(
        &self,
        repo_id: i64,
        commit: &str,
        symbol: &str,
    ) -> StoreResult<Vec<QueryResult>> {
        let mut results = Vec::new();
        for target in self.resolve(repo_id, commit, symbol).await? {
            let edges = self
                .store
                .incoming_edges(
                    &self.scope,
                    repo_id,
                    commit,
                    &target.record.entity_id,
                    Some(DEFAULT_EDGE_KIND),
                )
                .await?;
            for edge in edges {
                let caller = &edge.record.source_entity_id;
                let def = self.definition(repo_id, commit, caller).await?;
                results.push(QueryResult::from_edge(caller, &edge, def));
            }
        }
        Ok(results)
    }

    /// Find all callees of a symbol
    pub async fn callees(
        &self,
        repo_id: i64,
        commit: &str,
        symbol: &str,
    ) -> StoreResult<Vec<QueryResult>> {
        let mut results = Vec::new();
        for source in self.resolve(repo_id, commit, symbol).await? {
            let edges = self
                .store
                .outgoing_edges(
                    &self.scope,
                    repo_id,
                    commit,
                    &source.record.entity_id,
                    Some(DEFAULT_EDGE_KIND),
                )
                .await?;
            for edge in edges {
                let callee = &edge.record.target_entity_id;
                let def = self.definition(repo_id, commit, callee).await?;
                results.push(QueryResult::from_edge(callee, &edge, def));
            }
        }
        Ok(results)
    }

    async fn definition(
        &self,
        repo_id: i64,
        commit: &str,
        entity_id: &str,
    ) -> StoreResult<Option<XRefDefinition>> {
        match self
            .store
            .get_definition(&self.scope, repo_id, commit, entity_id)
            .await
        {
            Ok(def) => Ok(Some(def)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{CommitRecord, Definition, Edge};
    use chrono::Utc;

    fn record<T>(record: T) -> CommitRecord<T> {
        CommitRecord {
            repo_id: 1,
            commit_hash: "abc".to_string(),
            created_at: Utc::now(),
            record,
        }
    }

    #[test]
    fn test_result_from_unresolved_edge() {
        let edge = record(Edge {
            source_entity_id: "main".to_string(),
            target_entity_id: "fmt.Println".to_string(),
            kind: "call".to_string(),
            source_file: "main.go".to_string(),
            source_line: 7,
            resolution: "external".to_string(),
            count: 2,
        });

        let result = QueryResult::from_edge("fmt.Println", &edge, None);
        assert!(!result.resolved);
        assert_eq!(result.entity_id, "fmt.Println");
        assert_eq!(result.name, "");
        assert_eq!((result.call_file.as_str(), result.call_line), ("main.go", 7));
        assert_eq!(result.count, 2);

        let def = record(Definition {
            entity_id: "main".to_string(),
            file: "main.go".to_string(),
            kind: "function".to_string(),
            name: "main".to_string(),
            start_line: 3,
            ..Definition::default()
        });
        let result = QueryResult::from_edge("main", &edge, Some(def));
        assert!(result.resolved);
        assert_eq!((result.name.as_str(), result.line), ("main", 3));
    }
}
