//! Store scenarios against PostgreSQL.
//!
//! Skipped unless `FORGE_INDEX_TEST_POSTGRES_URL` points at a disposable
//! database. Scenarios isolate themselves by tenant, so the database can be
//! reused across runs.

mod common;

use std::sync::Arc;

use forge_index::retry::RetryPolicy;
use forge_index::store::{PostgresStore, Store};

const URL_VAR: &str = "FORGE_INDEX_TEST_POSTGRES_URL";

async fn open_store() -> Option<Arc<dyn Store>> {
    let url = match std::env::var(URL_VAR) {
        Ok(url) if !url.trim().is_empty() => url,
        _ => {
            eprintln!("{} not set; skipping PostgreSQL scenario", URL_VAR);
            return None;
        }
    };
    let store = PostgresStore::connect(&url, 10, RetryPolicy::default())
        .await
        .unwrap();
    store.migrate().await.unwrap();
    Some(Arc::new(store))
}

macro_rules! scenarios {
    ($($name:ident),* $(,)?) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $name() {
                let Some(store) = open_store().await else {
                    return;
                };
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
async fn concurrent_migrations_serialize() {
    let Some(store) = open_store().await else {
        return;
    };
    let runs = (0..4).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.migrate().await })
    });
    for joined in futures::future::join_all(runs).await {
        joined.unwrap().unwrap();
    }
    store.health_check().await.unwrap();
}
