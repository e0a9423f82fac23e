use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::StoreResult;

/// PostgreSQL schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Serializes concurrent migrators across processes.
const MIGRATION_LOCK_KEY: i64 = 0x666f_7267_6569_6478;

/// Initialize the database schema
pub async fn init_schema(pool: &PgPool) -> StoreResult<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    )
    .execute(&mut *tx)
    .await?;

    let current_version: i32 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(&mut *tx)
            .await?;

    debug!("Current schema version: {}", current_version);

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration v{}", version);
        let ddl = match version {
            1 => V1_SCHEMA,
            _ => unreachable!("Unknown schema version: {}", version),
        };
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(ddl)).await?;
        sqlx::query("INSERT INTO schema_version (version) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(version)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

const V1_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repositories (
    id BIGSERIAL PRIMARY KEY,
    tenant_id TEXT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (owner, name)
);
CREATE INDEX IF NOT EXISTS idx_repositories_tenant ON repositories(tenant_id);

CREATE TABLE IF NOT EXISTS repo_numbers (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    number BIGINT NOT NULL,
    item_kind TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (repo_id, number)
);

CREATE TABLE IF NOT EXISTS indexing_jobs (
    id BIGSERIAL PRIMARY KEY,
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('queued', 'in_progress', 'completed', 'failed')),
    attempt_count INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    last_error TEXT NOT NULL DEFAULT '',
    next_attempt_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    UNIQUE (repo_id, commit_hash, job_type)
);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_ready
    ON indexing_jobs(status, next_attempt_at, id);
CREATE INDEX IF NOT EXISTS idx_indexing_jobs_commit
    ON indexing_jobs(repo_id, commit_hash, created_at);

CREATE TABLE IF NOT EXISTS hash_mappings (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    git_hash TEXT NOT NULL,
    got_hash TEXT NOT NULL,
    object_type TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, git_hash),
    UNIQUE (repo_id, got_hash)
);

CREATE TABLE IF NOT EXISTS merge_base_cache (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    left_hash TEXT NOT NULL,
    right_hash TEXT NOT NULL,
    base_hash TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, left_hash, right_hash),
    CHECK (left_hash <= right_hash)
);

CREATE TABLE IF NOT EXISTS entity_identities (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    stable_id TEXT NOT NULL,
    name TEXT NOT NULL DEFAULT '',
    decl_kind TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    first_seen_commit TEXT NOT NULL DEFAULT '',
    last_seen_commit TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, stable_id)
);

CREATE TABLE IF NOT EXISTS entity_versions (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    stable_id TEXT NOT NULL,
    commit_hash TEXT NOT NULL,
    path TEXT NOT NULL,
    entity_hash TEXT NOT NULL,
    body_hash TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    decl_kind TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, commit_hash, path, entity_hash),
    FOREIGN KEY (repo_id, stable_id)
        REFERENCES entity_identities(repo_id, stable_id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_entity_versions_stable ON entity_versions(repo_id, stable_id);
CREATE INDEX IF NOT EXISTS idx_entity_versions_name ON entity_versions(repo_id, name);

CREATE TABLE IF NOT EXISTS entity_index_commits (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    entry_count BIGINT NOT NULL,
    indexed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, commit_hash)
);

CREATE TABLE IF NOT EXISTS entity_index_entries (
    id BIGSERIAL PRIMARY KEY,
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
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
    start_line BIGINT NOT NULL DEFAULT 0,
    end_line BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    search_vector tsvector GENERATED ALWAYS AS (
        to_tsvector('simple', name || ' ' || signature || ' ' || doc_comment)
    ) STORED,
    UNIQUE (repo_id, commit_hash, symbol_key)
);
CREATE INDEX IF NOT EXISTS idx_entity_index_listing
    ON entity_index_entries(repo_id, commit_hash, file_path, start_line);
CREATE INDEX IF NOT EXISTS idx_entity_index_name
    ON entity_index_entries(repo_id, commit_hash, name);
CREATE INDEX IF NOT EXISTS idx_entity_index_search
    ON entity_index_entries USING GIN (search_vector);

CREATE TABLE IF NOT EXISTS xref_definitions (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    file TEXT NOT NULL DEFAULT '',
    package_name TEXT NOT NULL DEFAULT '',
    kind TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL DEFAULT '',
    signature TEXT NOT NULL DEFAULT '',
    receiver TEXT NOT NULL DEFAULT '',
    start_line BIGINT NOT NULL DEFAULT 0,
    end_line BIGINT NOT NULL DEFAULT 0,
    callable BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, commit_hash, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_xref_definitions_name
    ON xref_definitions(repo_id, commit_hash, name);

CREATE TABLE IF NOT EXISTS xref_edges (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    source_entity_id TEXT NOT NULL,
    target_entity_id TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'call',
    source_file TEXT NOT NULL DEFAULT '',
    source_line BIGINT NOT NULL DEFAULT 0,
    resolution TEXT NOT NULL DEFAULT '',
    count BIGINT NOT NULL DEFAULT 1,
    created_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, commit_hash, source_entity_id, target_entity_id, kind)
);
CREATE INDEX IF NOT EXISTS idx_xref_edges_target
    ON xref_edges(repo_id, commit_hash, target_entity_id, kind);

CREATE TABLE IF NOT EXISTS xref_graph_commits (
    repo_id BIGINT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    commit_hash TEXT NOT NULL,
    definition_count BIGINT NOT NULL,
    edge_count BIGINT NOT NULL,
    indexed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (repo_id, commit_hash)
);
";
