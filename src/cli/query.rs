use anyhow::{bail, Context, Result};

use forge_index::index::EntityIndexEntry;
use forge_index::query::{Navigator, QueryResult};

use super::Session;

fn print_entries(entries: &[EntityIndexEntry], empty: &str) {
    if entries.is_empty() {
        println!("{}", empty);
        return;
    }
    println!("Found {} results:", entries.len());
    for entry in entries {
        let e = &entry.record;
        println!("  {}:{} - {} ({})", e.file_path, e.start_line, e.name, e.kind);
    }
}

pub async fn search(
    session: &Session,
    repo_id: i64,
    commit: &str,
    query: &str,
    kind: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let limit = session.config.search.limit(limit);
    let hits = session
        .store
        .search_entities(&session.scope, repo_id, commit, query, kind, limit)
        .await
        .with_context(|| format!("Search for '{}' in {}@{} failed", query, repo_id, commit))?;

    session.emit(&hits, |hits| {
        print_entries(hits, &format!("No results found for '{}'", query));
    })
}

pub async fn symbols(
    session: &Session,
    repo_id: i64,
    commit: &str,
    kind: Option<&str>,
    limit: Option<usize>,
) -> Result<()> {
    let limit = session.config.search.limit(limit);
    let entries = session
        .store
        .list_by_commit(&session.scope, repo_id, commit, kind, limit)
        .await
        .with_context(|| format!("Failed to list symbols for {}@{}", repo_id, commit))?;

    session.emit(&entries, |entries| {
        print_entries(entries, &format!("No symbols indexed for {}@{}", repo_id, commit));
    })
}

pub async fn navigate(
    session: &Session,
    query_type: &str,
    repo_id: i64,
    commit: &str,
    symbol: &str,
) -> Result<()> {
    let navigator = Navigator::new(session.store.clone(), session.scope.clone());

    let results = match query_type {
        "callers" => navigator.callers(repo_id, commit, symbol).await,
        "callees" => navigator.callees(repo_id, commit, symbol).await,
        other => bail!("Unknown query type: {}", other),
    }
    .with_context(|| format!("Failed to find {} of '{}'", query_type, symbol))?;

    session.emit(&results, |results: &Vec<QueryResult>| {
        if results.is_empty() {
            println!("No results found for {} of '{}'", query_type, symbol);
            return;
        }
        println!("Found {} results:", results.len());
        for r in results {
            if r.resolved {
                println!(
                    "  {}:{} - {} ({}) called at {}:{} x{}",
                    r.file, r.line, r.name, r.kind, r.call_file, r.call_line, r.count
                );
            } else {
                println!(
                    "  {} (unresolved) called at {}:{} x{}",
                    r.entity_id, r.call_file, r.call_line, r.count
                );
            }
        }
    })
}
