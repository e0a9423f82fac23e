//! Query preparation and result merging shared by both backends.
//!
//! Full-text matching is token-prefix based: `"Order"` matches `"order_id"` but
//! not `"ProcessOrder"`, because the latter is a single token. Search therefore
//! always runs a substring pass as well and appends its hits after the
//! full-text ones.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::index::EntityIndexEntry;

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 500;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\p{L}\p{N}]+").expect("valid token regex"));

/// Why a search skipped the full-text pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// The query had nothing the token index could match.
    NoTokens,
    /// The engine rejected or failed the full-text query.
    BackendError,
}

/// Clamp a caller-supplied limit; zero means the default.
pub fn clamp_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIMIT,
        n => n.min(MAX_LIMIT),
    }
}

/// Lower-cased indexable tokens of a free-text query.
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    TOKEN_RE
        .find_iter(query)
        .map(|m| m.as_str().to_lowercase())
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// FTS5 expression: every term as a quoted prefix phrase, implicitly ANDed.
pub fn fts5_match_expr(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"*", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// `to_tsquery` input: every term as a prefix lexeme, ANDed.
pub fn tsquery_expr(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("{}:*", t))
        .collect::<Vec<_>>()
        .join(" & ")
}

/// `%needle%` with LIKE metacharacters escaped by backslash.
pub fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for ch in query.trim().chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Identity of a hit for de-duplication across passes.
pub fn dedup_key(entry: &EntityIndexEntry) -> String {
    let record = &entry.record;
    if !record.symbol_key.trim().is_empty() {
        return record.symbol_key.clone();
    }
    format!(
        "{}\u{1f}{}\u{1f}{}\u{1f}{}",
        record.file_path, record.name, record.kind, record.start_line
    )
}

/// Full-text hits first, then substring hits not already present.
pub fn merge_hits(
    full_text: Vec<EntityIndexEntry>,
    substring: Vec<EntityIndexEntry>,
    limit: usize,
) -> Vec<EntityIndexEntry> {
    let mut seen = HashSet::new();
    full_text
        .into_iter()
        .chain(substring)
        .filter(|entry| seen.insert(dedup_key(entry)))
        .take(limit)
        .collect()
}

/// Log why the full-text pass was skipped. The two causes are kept apart so an
/// engine failure is never mistaken for an empty query.
pub fn note_fallback(reason: Fallback, query: &str, detail: Option<&str>) {
    match reason {
        Fallback::NoTokens => {
            debug!(query, "query has no indexable tokens; using substring search only")
        }
        Fallback::BackendError => warn!(
            query,
            error = detail.unwrap_or(""),
            "full-text search failed; degrading to substring search"
        ),
    }
}
