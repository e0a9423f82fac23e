use rusqlite::{Connection, Result};
use tracing::{debug, info};

/// SQLite schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    debug!("Current schema version: {}", current_version);

    if current_version < SCHEMA_VERSION {
        info!("Upgrading schema from v{} to v{}", current_version, SCHEMA_VERSION);
        apply_migrations(conn, current_version)?;
    }

    Ok(())
}

/// Apply migrations from current version to latest
fn apply_migrations(conn: &Connection, from_version: i32) -> Result<()> {
    for version in (from_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration v{}", version);
        let ddl = match version {
            1 => V1_SCHEMA,
            _ => unreachable!("Unknown schema version: {}", version),
        };

        // DDL and the version marker land together or not at all.
        conn.execute_batch(&format!(
            "BEGIN IMMEDIATE;
             {}
             INSERT OR IGNORE INTO schema_version (version) VALUES ({});
             COMMIT;",
            ddl, version
        ))?;
    }

    Ok(())
}

/// v1: repositories, job queue, hash mappings, merge-base cache, entity
/// identities/versions, entity index (+ FTS5) and the xref graph.
const V1_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repositories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (owner, name)
);
CREATE INDEX IF NOT EXISTS idx_repositories_tenant ON repositories(tenant_id);

CREATE TABLE IF NOT EXISTS repo_numbers (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    number INTEGER NOT NULL,
    item_kind TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, number)
);

CREATE TABLE IF NOT EXISTS indexing_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued', 'in_progress', 'completed', 'failed')),
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    last_error TEXT NOT NULL DEFAULT '',
    next_attempt_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER,
    UNIQUE (repo_id, commit_hash, job_type)
);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_ready
    ON indexing_jobs(status, next_attempt_at, id);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_commit
    ON indexing_jobs(repo_id, commit_hash, created_at);

CREATE TABLE IF NOT EXISTS hash_mappings (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    git_hash TEXT NOT NULL,
    got_hash TEXT NOT NULL,
    object_type TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, git_hash),
    UNIQUE (repo_id, got_hash)
);

CREATE TABLE IF NOT EXISTS merge_base_cache (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    left_hash TEXT NOT NULL,
    right_hash TEXT NOT NULL,
    base_hash TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, left_hash, right_hash),
    CHECK (left_hash <= right_hash)
);

CREATE TABLE IF NOT EXISTS entity_identities (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    stable_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    decl_kind TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    first_seen_commit TEXT NOT NULL DEFAULT '',
    last_seen_commit TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, stable_id)
);

CREATE TABLE IF NOT EXISTS entity_versions (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    stable_id TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    path TEXT NOT NULL,
    entity_hash TEXT NOT NULL,
    body_hash TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    decl_kind TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, commit_hash, path, entity_hash),
    FOREIGN KEY (repo_id, stable_id)
        REFERENCES entity_identities(repo_id, stable_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_entity_versions_stable ON entity_versions(repo_id, stable_id);
CREATE INDEX IF NOT EXISTS idx_entity_versions_name ON entity_versions(repo_id, name);

CREATE TABLE IF NOT EXISTS entity_index_commits (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    entry_count INTEGER NOT NULL,
    indexed_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, commit_hash)
);

CREATE TABLE IF NOT EXISTS entity_index_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    file_path TEXT NOT NULL,
    symbol_key TEXT NOT NULL,
    stable_id TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    language TEXT NOT NULL DEFAULT '',
    doc_comment TEXT NOT NULL DEFAULT '',
    start_line INTEGER NOT NULL DEFAULT 0,
    end_line INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    UNIQUE (repo_id, commit_hash, symbol_key)
);
CREATE INDEX IF NOT EXISTS idx_entity_index_listing
    ON entity_index_entries(repo_id, commit_hash, file_path, start_line);
CREATE INDEX IF NOT EXISTS idx_entity_index_name
    ON entity_index_entries(repo_id, commit_hash, name);

CREATE VIRTUAL TABLE IF NOT EXISTS entity_index_fts USING fts5(
    name,
    signature,
    doc_comment,
    content='entity_index_entries',
    content_rowid='id'
);

CREATE TRIGGER IF NOT EXISTS entity_index_fts_insert AFTER INSERT ON entity_index_entries
BEGIN
    INSERT INTO entity_index_fts(rowid, name, signature, doc_comment)
    VALUES (new.id, new.name, new.signature, new.doc_comment);
END;

CREATE TRIGGER IF NOT EXISTS entity_index_fts_delete AFTER DELETE ON entity_index_entries
BEGIN
    INSERT INTO entity_index_fts(entity_index_fts, rowid, name, signature, doc_comment)
    VALUES ('delete', old.id, old.name, old.signature, old.doc_comment);
END;

CREATE TRIGGER IF NOT EXISTS entity_index_fts_update AFTER UPDATE ON entity_index_entries
BEGIN
    INSERT INTO entity_index_fts(entity_index_fts, rowid, name, signature, doc_comment)
    VALUES ('delete', old.id, old.name, old.signature, old.doc_comment);
    INSERT INTO entity_index_fts(rowid, name, signature, doc_comment)
    VALUES (new.id, new.name, new.signature, new.doc_comment);
END;

CREATE TABLE IF NOT EXISTS xref_definitions (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    file TEXT NOT NULL DEFAULT '',
    package_name TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    start_line INTEGER NOT NULL DEFAULT 0,
    end_line INTEGER NOT NULL DEFAULT 0,
    callable INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, commit_hash, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_xref_definitions_name
    ON xref_definitions(repo_id, commit_hash, name);

CREATE TABLE IF NOT EXISTS xref_edges (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    source_entity_id TEXT NOT NULL,
    target_entity_id TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'call',
    source_file TEXT NOT NULL DEFAULT '',
    source_line INTEGER NOT NULL DEFAULT 0,
    resolution TEXT NOT NULL DEFAULT '',
    count INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, commit_hash, source_entity_id, target_entity_id, kind)
);
CREATE INDEX IF NOT EXISTS idx_xref_edges_target
    ON xref_edges(repo_id, commit_hash, target_entity_id, kind);

CREATE TABLE IF NOT EXISTS xref_graph_commits (
    repo_id INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    definition_count INTEGER NOT NULL,
    edge_count INTEGER NOT NULL,
    indexed_at INTEGER NOT NULL,
    PRIMARY KEY (repo_id, commit_hash)
);
";
