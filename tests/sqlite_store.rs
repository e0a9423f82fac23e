//! Store scenarios against a throwaway SQLite file.

mod common;

use std::sync::Arc;
use tempfile::TempDir;

use forge_index::store::sqlite::{SqliteOptions, SqliteStore};
use forge_index::store::Store;

fn open_store() -> (TempDir, Arc<dyn Store>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("forge.db"), SqliteOptions::default()).unwrap();
    (dir, Arc::new(store))
}

macro_rules! scenarios {
    ($($name:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $name() {
                let (_dir, store) = open_store();
                common::$name(store).await;
            }
        )*
    };
}

scenarios!(
    queue_lifecycle,
    concurrent_claims_single_winner,
    concurrent_claims_take_distinct_jobs,
    concurrent_enqueues_share_one_row,
    requeue_exhausts_attempts,
    enqueue_is_idempotent_after_completion,
    enqueue_restarts_failed_job,
    stale_transitions_are_not_found,
    future_jobs_wait,
    job_status_prefers_latest,
    merge_base_is_order_independent,
    hash_mappings_round_trip,
    snapshot_replace_keeps_latest,
    search_falls_back_to_substring,
    identities_and_versions,
    xref_graph_and_navigation,
    tenant_isolation,
    delete_repository_cascades,
    reserve_number_is_sequential,
    worker_indexes_commit,
    worker_skips_commit_with_empty_analysis,
    worker_retries_then_fails,
    worker_stops_on_shutdown,
);

#[tokio::test]
async fn reopen_keeps_data_and_migrates_idempotently() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("forge.db");
    let scope = common::unique_tenant();

    let repo_id = {
        let store: Arc<dyn Store> =
            Arc::new(SqliteStore::open(&path, SqliteOptions::default()).unwrap());
        store.migrate().await.unwrap();
        store
            .create_repository(&scope, "acme", "widgets")
            .await
            .unwrap()
            .id
    };

    let store: Arc<dyn Store> =
        Arc::new(SqliteStore::open(&path, SqliteOptions::default()).unwrap());
    store.migrate().await.unwrap();
    store.health_check().await.unwrap();
    assert_eq!(
        store.get_repository(&scope, repo_id).await.unwrap().name,
        "widgets"
    );
}

#[tokio::test]
async fn unscoped_writes_to_missing_repository_fail() {
    let (_dir, store) = open_store();
    let unscoped = forge_index::tenant::TenantScope::unscoped();
    let err = store
        .enqueue_job(&unscoped, &forge_index::queue::NewJob::commit_index(404, "abc"))
        .await
        .unwrap_err();
    assert!(!err.is_not_found());
    assert!(!err.is_validation());
}

fn open_sqlite() -> (TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("forge.db"), SqliteOptions::default()).unwrap();
    (dir, Arc::new(store))
}

#[tokio::test]
async fn worker_requeues_when_index_lookup_fails() {
    use forge_index::queue::{JobStatus, NewJob};
    use forge_index::worker::{CommitAnalysis, JobOutcome, Worker};

    let (_dir, sqlite) = open_sqlite();
    let store: Arc<dyn Store> = sqlite.clone();
    let scope = common::unique_tenant();
    let repo = store
        .create_repository(&scope, "acme", "widgets")
        .await
        .unwrap();
    let job = store
        .enqueue_job(&scope, &NewJob::commit_index(repo.id, "lost").with_max_attempts(2))
        .await
        .unwrap();

    sqlite
        .get_conn()
        .unwrap()
        .execute_batch("ALTER TABLE entity_index_commits RENAME TO entity_index_commits_moved;")
        .unwrap();

    let worker = Worker::new(
        store.clone(),
        Arc::new(common::FixedAnalyzer(CommitAnalysis::default())),
    )
    .with_scope(scope.clone())
    .with_config(common::immediate_retries());

    match worker.run_once().await.unwrap() {
        JobOutcome::Requeued(requeued) => {
            assert_eq!(requeued.id, job.id);
            assert_eq!(requeued.status, JobStatus::Queued);
            assert!(requeued.last_error.contains("entity index"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(
        store.get_job(&scope, job.id).await.unwrap().status,
        JobStatus::Queued
    );

    sqlite
        .get_conn()
        .unwrap()
        .execute_batch("ALTER TABLE entity_index_commits_moved RENAME TO entity_index_commits;")
        .unwrap();

    match worker.run_once().await.unwrap() {
        JobOutcome::Completed(done) => {
            assert_eq!(done.id, job.id);
            assert_eq!(done.attempt_count, 2);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
}

#[tokio::test]
async fn search_survives_missing_full_text_table() {
    let (_dir, sqlite) = open_sqlite();
    let store: Arc<dyn Store> = sqlite.clone();
    let scope = common::unique_tenant();
    let repo = store
        .create_repository(&scope, "acme", "widgets")
        .await
        .unwrap();

    let entries = vec![
        common::entry("po", "ProcessOrder", "function", "orders.go", 10),
        common::entry("o", "Order", "type", "model.go", 1),
        common::entry("oid", "order_id", "field", "model.go", 4),
        common::entry("u", "User", "type", "user.go", 1),
    ];
    store
        .replace_commit_snapshot(&scope, repo.id, "s1", &entries)
        .await
        .unwrap();

    sqlite
        .get_conn()
        .unwrap()
        .execute_batch(
            "DROP TRIGGER entity_index_fts_insert;
             DROP TRIGGER entity_index_fts_delete;
             DROP TRIGGER entity_index_fts_update;
             DROP TABLE entity_index_fts;",
        )
        .unwrap();

    let hits = store
        .search_entities(&scope, repo.id, "s1", "Order", None, 10)
        .await
        .unwrap();
    let mut names: Vec<&str> = hits.iter().map(|e| e.record.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Order", "ProcessOrder", "order_id"]);

    let funcs = store
        .search_entities(&scope, repo.id, "s1", "order", Some("function"), 10)
        .await
        .unwrap();
    assert_eq!(funcs.len(), 1);
    assert_eq!(funcs[0].record.name, "ProcessOrder");
}
