//! Backend-agnostic store scenarios.
//!
//! Each scenario runs under its own tenant so a shared PostgreSQL database can
//! host concurrent test runs without claims crossing over.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forge_index::index::objects::{HashMapping, Repository};
use forge_index::index::{
    Definition, Edge, IdentitySighting, IndexEntry, Page, VersionFilter, VersionSnapshot,
};
use forge_index::queue::{BackoffPolicy, IndexingJob, JobStatus, NewJob};
use forge_index::query::Navigator;
use forge_index::store::Store;
use forge_index::tenant::{TenantId, TenantScope};
use forge_index::worker::{CommitAnalysis, CommitAnalyzer, JobOutcome, Worker, WorkerConfig};

static TENANT_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn unique_tenant() -> TenantScope {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = TENANT_SEQ.fetch_add(1, Ordering::SeqCst);
    let id = format!("tenant-{}-{}-{}", std::process::id(), nanos, seq);
    TenantScope::tenant(TenantId::new(id).unwrap())
}

pub struct Fixture {
    pub store: Arc<dyn Store>,
    pub scope: TenantScope,
    pub repo: Repository,
}

pub async fn fixture(store: Arc<dyn Store>) -> Fixture {
    let scope = unique_tenant();
    let repo = store
        .create_repository(&scope, "acme", "widgets")
        .await
        .unwrap();
    Fixture { store, scope, repo }
}

pub fn entry(symbol_key: &str, name: &str, kind: &str, file: &str, line: i64) -> IndexEntry {
    IndexEntry {
        file_path: file.to_string(),
        symbol_key: symbol_key.to_string(),
        stable_id: format!("sid-{}", symbol_key),
        kind: kind.to_string(),
        name: name.to_string(),
        signature: format!("func {}()", name),
        receiver: String::new(),
        language: "go".to_string(),
        doc_comment: String::new(),
        start_line: line,
        end_line: line + 5,
    }
}

fn definition(entity_id: &str, name: &str, file: &str, line: i64) -> Definition {
    Definition {
        entity_id: entity_id.to_string(),
        file: file.to_string(),
        package_name: "orders".to_string(),
        kind: "function".to_string(),
        name: name.to_string(),
        signature: format!("func {}()", name),
        receiver: String::new(),
        start_line: line,
        end_line: line + 10,
        callable: true,
    }
}

fn call(source: &str, target: &str, line: i64) -> Edge {
    Edge {
        source_entity_id: source.to_string(),
        target_entity_id: target.to_string(),
        kind: String::new(),
        source_file: "orders.go".to_string(),
        source_line: line,
        resolution: "static".to_string(),
        count: 0,
    }
}

fn sighting(stable_id: &str, name: &str) -> IdentitySighting {
    IdentitySighting {
        stable_id: stable_id.to_string(),
        name: name.to_string(),
        decl_kind: "function".to_string(),
        receiver: String::new(),
    }
}

fn version(stable_id: &str, path: &str, entity_hash: &str, body_hash: &str) -> VersionSnapshot {
    VersionSnapshot {
        stable_id: stable_id.to_string(),
        path: path.to_string(),
        entity_hash: entity_hash.to_string(),
        body_hash: body_hash.to_string(),
        name: "ProcessOrder".to_string(),
        decl_kind: "function".to_string(),
        receiver: String::new(),
    }
}

pub async fn queue_lifecycle(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);

    let queued = store
        .enqueue_job(scope, &NewJob::commit_index(fx.repo.id, "c0ffee"))
        .await
        .unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.attempt_count, 0);
    assert_eq!(queued.max_attempts, 3);

    let stats = store.queue_stats(scope).await.unwrap();
    assert_eq!(stats.queued, 1);
    assert!(stats.oldest_queued_at.is_some());

    let claimed = store.claim_job(scope).await.unwrap().unwrap();
    assert_eq!(claimed.id, queued.id);
    assert_eq!(claimed.status, JobStatus::InProgress);
    assert_eq!(claimed.attempt_count, 1);
    assert!(claimed.started_at.is_some());
    assert!(store.claim_job(scope).await.unwrap().is_none());

    let done = store
        .complete_job(scope, claimed.id, JobStatus::Completed, "ignored")
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.attempt_count, 1);
    assert_eq!(done.last_error, "");
    assert!(done.completed_at.is_some());

    let status = store.job_status(scope, fx.repo.id, "c0ffee").await.unwrap();
    assert_eq!(status.id, queued.id);
    assert_eq!(status.status, JobStatus::Completed);

    let stats = store.queue_stats(scope).await.unwrap();
    assert_eq!((stats.queued, stats.in_progress, stats.failed), (0, 0, 0));
    assert!(stats.oldest_queued_at.is_none());
}

pub async fn concurrent_claims_single_winner(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    fx.store
        .enqueue_job(&fx.scope, &NewJob::commit_index(fx.repo.id, "race"))
        .await
        .unwrap();

    let claimers = (0..8).map(|_| {
        let store = fx.store.clone();
        let scope = fx.scope.clone();
        tokio::spawn(async move { store.claim_job(&scope).await })
    });
    let results = futures::future::join_all(claimers).await;

    let winners: Vec<IndexingJob> = results
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .flatten()
        .collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].attempt_count, 1);
}

pub async fn concurrent_claims_take_distinct_jobs(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);

    let mut enqueued = Vec::new();
    for i in 0..5 {
        let job = store
            .enqueue_job(scope, &NewJob::commit_index(fx.repo.id, format!("batch{}", i)))
            .await
            .unwrap();
        enqueued.push(job.id);
    }

    let claimers = (0..enqueued.len()).map(|_| {
        let store = fx.store.clone();
        let scope = fx.scope.clone();
        tokio::spawn(async move { store.claim_job(&scope).await })
    });
    let mut claimed: Vec<i64> = futures::future::join_all(claimers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().expect("every claimer gets a job").id)
        .collect();
    claimed.sort_unstable();
    enqueued.sort_unstable();
    assert_eq!(claimed, enqueued);
    assert!(store.claim_job(scope).await.unwrap().is_none());

    // Sequential claims follow next_attempt_at, then id.
    let now = Utc::now();
    let late = store
        .enqueue_job(
            scope,
            &NewJob::commit_index(fx.repo.id, "late").not_before(now - ChronoDuration::minutes(1)),
        )
        .await
        .unwrap();
    let early = store
        .enqueue_job(
            scope,
            &NewJob::commit_index(fx.repo.id, "early").not_before(now - ChronoDuration::minutes(5)),
        )
        .await
        .unwrap();
    let tied = store
        .enqueue_job(
            scope,
            &NewJob::commit_index(fx.repo.id, "tied").not_before(now - ChronoDuration::minutes(5)),
        )
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = store.claim_job(scope).await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![early.id, tied.id, late.id]);
}

pub async fn requeue_exhausts_attempts(store: Arc<dyn Store>) {
    let scope = unique_tenant();
    // Fresh databases hand out ids from 1; shared ones may already be past 7.
    let repo = loop {
        let repo = store
            .create_repository(&scope, "acme", "numbered")
            .await
            .unwrap();
        if repo.id >= 7 {
            break repo;
        }
    };

    let job = store
        .enqueue_job(
            &scope,
            &NewJob::commit_index(repo.id, "abc123").with_max_attempts(2),
        )
        .await
        .unwrap();
    assert_eq!(job.max_attempts, 2);

    let first = store.claim_job(&scope).await.unwrap().unwrap();
    assert_eq!(first.attempt_count, 1);

    let requeued = store
        .requeue_job(&scope, first.id, "parse failed", Utc::now())
        .await
        .unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.attempt_count, 1);
    assert_eq!(requeued.last_error, "parse failed");
    assert!(requeued.started_at.is_none());

    let second = store.claim_job(&scope).await.unwrap().unwrap();
    assert_eq!(second.id, job.id);
    assert_eq!(second.attempt_count, 2);

    let failed = store
        .requeue_job(&scope, second.id, "parse failed", Utc::now())
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error, "parse failed");
    assert!(failed.completed_at.is_some());
    assert!(store.claim_job(&scope).await.unwrap().is_none());

    let stats = store.queue_stats(&scope).await.unwrap();
    assert_eq!(stats.failed, 1);
}

pub async fn enqueue_is_idempotent_after_completion(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);
    let request = NewJob::commit_index(fx.repo.id, "feedface");

    store.enqueue_job(scope, &request).await.unwrap();
    let claimed = store.claim_job(scope).await.unwrap().unwrap();
    let done = store
        .complete_job(scope, claimed.id, JobStatus::Completed, "")
        .await
        .unwrap();

    let again = store.enqueue_job(scope, &request).await.unwrap();
    assert_eq!(again.id, done.id);
    assert_eq!(again.status, JobStatus::Completed);
    assert_eq!(again.attempt_count, 1);
    assert_eq!(again.completed_at, done.completed_at);
    assert!(store.claim_job(scope).await.unwrap().is_none());
}

async fn enqueue_concurrently(fx: &Fixture, request: &NewJob, n: usize) -> Vec<IndexingJob> {
    let enqueues = (0..n).map(|_| {
        let store = fx.store.clone();
        let scope = fx.scope.clone();
        let request = request.clone();
        tokio::spawn(async move { store.enqueue_job(&scope, &request).await })
    });
    futures::future::join_all(enqueues)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect()
}

pub async fn concurrent_enqueues_share_one_row(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let request = NewJob::commit_index(fx.repo.id, "d1ce");

    let first = enqueue_concurrently(&fx, &request, 8).await;
    let id = first[0].id;
    assert!(first.iter().all(|job| job.id == id));
    assert!(first.iter().all(|job| job.status == JobStatus::Queued));
    assert_eq!(fx.store.queue_stats(&fx.scope).await.unwrap().queued, 1);

    let claimed = fx.store.claim_job(&fx.scope).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);

    // Enqueues racing the completion either land before it (the claim goes
    // stale and the row is queued again) or after it (the row stays completed).
    let (racing, completion) = tokio::join!(
        enqueue_concurrently(&fx, &request, 8),
        fx.store
            .complete_job(&fx.scope, claimed.id, JobStatus::Completed, "")
    );
    assert!(racing.iter().all(|job| job.id == id));
    match completion {
        Ok(done) => assert_eq!(done.status, JobStatus::Completed),
        Err(err) => {
            assert!(err.is_not_found());
            let reclaimed = fx.store.claim_job(&fx.scope).await.unwrap().unwrap();
            assert_eq!(reclaimed.id, id);
            fx.store
                .complete_job(&fx.scope, reclaimed.id, JobStatus::Completed, "")
                .await
                .unwrap();
        }
    }

    let after = enqueue_concurrently(&fx, &request, 8).await;
    assert!(after.iter().all(|job| job.id == id));
    assert!(after.iter().all(|job| job.status == JobStatus::Completed));
    assert!(fx.store.claim_job(&fx.scope).await.unwrap().is_none());

    let stats = fx.store.queue_stats(&fx.scope).await.unwrap();
    assert_eq!((stats.queued, stats.in_progress, stats.failed), (0, 0, 0));
    assert_eq!(
        fx.store.job_status(&fx.scope, fx.repo.id, "d1ce").await.unwrap().id,
        id
    );
}

pub async fn enqueue_restarts_failed_job(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);
    let request = NewJob::commit_index(fx.repo.id, "0badf00d");

    store.enqueue_job(scope, &request).await.unwrap();
    let claimed = store.claim_job(scope).await.unwrap().unwrap();
    let failed = store
        .complete_job(scope, claimed.id, JobStatus::Failed, "  ")
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.last_error, "indexing failed");

    let restarted = store.enqueue_job(scope, &request).await.unwrap();
    assert_eq!(restarted.id, failed.id);
    assert_eq!(restarted.status, JobStatus::Queued);
    assert_eq!(restarted.last_error, "");
    assert!(restarted.completed_at.is_none());
    // Attempts accumulate across restarts.
    assert_eq!(restarted.attempt_count, 1);

    let reclaimed = store.claim_job(scope).await.unwrap().unwrap();
    assert_eq!(reclaimed.attempt_count, 2);
}

pub async fn stale_transitions_are_not_found(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);

    store
        .enqueue_job(scope, &NewJob::commit_index(fx.repo.id, "5ca1ab1e"))
        .await
        .unwrap();
    let claimed = store.claim_job(scope).await.unwrap().unwrap();
    store
        .complete_job(scope, claimed.id, JobStatus::Completed, "")
        .await
        .unwrap();

    let err = store
        .complete_job(scope, claimed.id, JobStatus::Completed, "")
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = store
        .requeue_job(scope, claimed.id, "late", Utc::now())
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = store
        .complete_job(scope, claimed.id, JobStatus::Queued, "")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

pub async fn future_jobs_wait(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);

    let later = Utc::now() + ChronoDuration::hours(1);
    store
        .enqueue_job(
            scope,
            &NewJob::commit_index(fx.repo.id, "later").not_before(later),
        )
        .await
        .unwrap();
    assert!(store.claim_job(scope).await.unwrap().is_none());

    let ready = store
        .enqueue_job(scope, &NewJob::commit_index(fx.repo.id, "now"))
        .await
        .unwrap();
    let claimed = store.claim_job(scope).await.unwrap().unwrap();
    assert_eq!(claimed.id, ready.id);

    let stats = store.queue_stats(scope).await.unwrap();
    assert_eq!(stats.queued, 1);
    assert_eq!(stats.in_progress, 1);
}

pub async fn job_status_prefers_latest(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope) = (&fx.store, &fx.scope);

    let err = store
        .job_status(scope, fx.repo.id, "1234abcd")
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    store
        .enqueue_job(scope, &NewJob::new(fx.repo.id, "1234abcd", "commit_index"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let newer = store
        .enqueue_job(scope, &NewJob::new(fx.repo.id, "1234abcd", "xref"))
        .await
        .unwrap();

    let status = store.job_status(scope, fx.repo.id, "1234abcd").await.unwrap();
    assert_eq!(status.id, newer.id);
    assert_eq!(status.job_type, "xref");
}

pub async fn merge_base_is_order_independent(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    assert_eq!(store.get_merge_base(scope, repo, "aaa", "bbb").await.unwrap(), None);

    store
        .set_merge_base(scope, repo, "bbb", "aaa", "base1")
        .await
        .unwrap();
    assert_eq!(
        store.get_merge_base(scope, repo, "aaa", "bbb").await.unwrap(),
        Some("base1".to_string())
    );

    store
        .set_merge_base(scope, repo, "aaa", "bbb", "base2")
        .await
        .unwrap();
    assert_eq!(
        store.get_merge_base(scope, repo, "bbb", "aaa").await.unwrap(),
        Some("base2".to_string())
    );

    let err = store
        .set_merge_base(scope, repo, "aaa", " ", "base")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

pub async fn hash_mappings_round_trip(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    store
        .set_hash_mapping(scope, &HashMapping::new(repo, "deadbeef", "cafef00d", "blob"))
        .await
        .unwrap();
    assert_eq!(store.get_got_hash(scope, repo, "deadbeef").await.unwrap(), "cafef00d");
    assert_eq!(store.get_git_hash(scope, repo, "cafef00d").await.unwrap(), "deadbeef");

    let err = store.get_got_hash(scope, repo, "missing").await.unwrap_err();
    assert!(err.is_not_found());

    store
        .set_hash_mappings(
            scope,
            &[
                HashMapping::new(repo, "deadbeef", "f00dcafe", "blob"),
                HashMapping::new(repo, "0ddba11", "b01dface", "tree"),
            ],
        )
        .await
        .unwrap();
    assert_eq!(store.get_got_hash(scope, repo, "deadbeef").await.unwrap(), "f00dcafe");
    assert_eq!(store.get_git_hash(scope, repo, "b01dface").await.unwrap(), "0ddba11");

    let err = store
        .set_hash_mapping(scope, &HashMapping::new(repo, "", "abc", "blob"))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

pub async fn snapshot_replace_keeps_latest(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    assert!(!store.has_index_for_commit(scope, repo, "snap").await.unwrap());

    let first = vec![
        entry("a", "Alpha", "function", "a.go", 10),
        entry("b", "Beta", "function", "b.go", 1),
    ];
    assert_eq!(store.replace_commit_snapshot(scope, repo, "snap", &first).await.unwrap(), 2);

    let second = vec![
        entry("c", "Gamma", "type", "c.go", 3),
        entry("", "Skipped", "function", "c.go", 9),
        entry("d", "Delta", "function", "a.go", 2),
        entry("d", "DeltaRenamed", "function", "a.go", 2),
    ];
    assert_eq!(store.replace_commit_snapshot(scope, repo, "snap", &second).await.unwrap(), 2);

    let listed = store.list_by_commit(scope, repo, "snap", None, 0).await.unwrap();
    let names: Vec<&str> = listed.iter().map(|e| e.record.name.as_str()).collect();
    assert_eq!(names, vec!["DeltaRenamed", "Gamma"]);

    let types = store
        .list_by_commit(scope, repo, "snap", Some("type"), 0)
        .await
        .unwrap();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].record.symbol_key, "c");

    assert!(store.has_index_for_commit(scope, repo, "snap").await.unwrap());
    let summary = store.index_summary(scope, repo, "snap").await.unwrap();
    assert_eq!(summary.entry_count, 2);

    // An empty snapshot still marks the commit as indexed.
    store.replace_commit_snapshot(scope, repo, "empty", &[]).await.unwrap();
    assert!(store.has_index_for_commit(scope, repo, "empty").await.unwrap());
    assert!(store.list_by_commit(scope, repo, "empty", None, 0).await.unwrap().is_empty());
}

pub async fn search_falls_back_to_substring(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    let entries = vec![
        entry("po", "ProcessOrder", "function", "orders.go", 10),
        entry("o", "Order", "type", "model.go", 1),
        entry("oid", "order_id", "field", "model.go", 4),
        entry("u", "User", "type", "user.go", 1),
    ];
    store.replace_commit_snapshot(scope, repo, "s1", &entries).await.unwrap();

    let hits = store
        .search_entities(scope, repo, "s1", "Order", None, 10)
        .await
        .unwrap();
    let names: Vec<&str> = hits.iter().map(|e| e.record.name.as_str()).collect();
    assert_eq!(names[0], "Order");
    assert!(names.contains(&"ProcessOrder"));
    assert!(names.contains(&"order_id"));
    assert!(!names.contains(&"User"));
    assert_eq!(hits.len(), 3);

    let funcs = store
        .search_entities(scope, repo, "s1", "Order", Some("function"), 10)
        .await
        .unwrap();
    assert_eq!(funcs.len(), 1);
    assert_eq!(funcs[0].record.name, "ProcessOrder");

    // No indexable tokens: substring pass only.
    let punct = store
        .search_entities(scope, repo, "s1", "_", None, 10)
        .await
        .unwrap();
    assert_eq!(punct.len(), 1);
    assert_eq!(punct[0].record.name, "order_id");

    let limited = store
        .search_entities(scope, repo, "s1", "order", None, 1)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    let err = store
        .search_entities(scope, repo, "s1", "   ", None, 10)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

pub async fn identities_and_versions(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    let first = store
        .upsert_identity(scope, repo, "c1", &sighting("sid-1", "ProcessOrder"))
        .await
        .unwrap();
    assert_eq!(first.first_seen_commit, "c1");
    assert_eq!(first.last_seen_commit, "c1");

    let renamed = store
        .upsert_identity(scope, repo, "c2", &sighting("sid-1", "HandleOrder"))
        .await
        .unwrap();
    assert_eq!(renamed.first_seen_commit, "c1");
    assert_eq!(renamed.last_seen_commit, "c2");
    assert_eq!(renamed.name, "HandleOrder");
    assert_eq!(store.get_identity(scope, repo, "sid-1").await.unwrap(), renamed);

    store
        .upsert_identity(scope, repo, "c2", &sighting("sid-2", "Helper"))
        .await
        .unwrap();

    store
        .set_version(scope, repo, "c1", &version("sid-1", "orders.go", "e1", "ABCDEF"))
        .await
        .unwrap();
    store
        .set_version(scope, repo, "c2", &version("sid-1", "orders.go", "e2", "abcdef"))
        .await
        .unwrap();
    store
        .set_version(scope, repo, "c2", &version("sid-2", "helper.go", "e3", "123456"))
        .await
        .unwrap();
    // Same key: overwrites.
    store
        .set_version(scope, repo, "c2", &version("sid-2", "helper.go", "e3", "654321"))
        .await
        .unwrap();

    let c2 = store.list_versions_for_commit(scope, repo, "c2").await.unwrap();
    assert_eq!(c2.len(), 2);
    assert_eq!(c2[0].path, "helper.go");
    assert_eq!(c2[0].body_hash, "654321");

    let by_body = VersionFilter {
        body_hash: Some("AbCdEf".to_string()),
        ..VersionFilter::default()
    };
    assert_eq!(store.count_versions(scope, repo, &by_body).await.unwrap(), 2);

    let combined = VersionFilter {
        stable_id: Some("sid-1".to_string()),
        name: Some(" ".to_string()),
        body_hash: Some("abcdef".to_string()),
    };
    assert_eq!(store.count_versions(scope, repo, &combined).await.unwrap(), 2);

    let page = store
        .list_versions(scope, repo, &by_body, Page { limit: 1, offset: 1 })
        .await
        .unwrap();
    assert_eq!(page.len(), 1);

    let everything = store
        .list_versions(scope, repo, &VersionFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(everything.len(), 3);

    assert!(store.has_versions_for_commit(scope, repo, "c1").await.unwrap());
    assert!(!store.has_versions_for_commit(scope, repo, "c9").await.unwrap());

    let err = store.get_identity(scope, repo, "sid-404").await.unwrap_err();
    assert!(err.is_not_found());
}

pub async fn xref_graph_and_navigation(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    assert!(!store.has_graph_for_commit(scope, repo, "g1").await.unwrap());

    let defs = vec![
        definition("main", "main", "main.go", 1),
        definition("process", "ProcessOrder", "orders.go", 10),
        definition("validate", "validate", "orders.go", 40),
        definition("", "ignored", "orders.go", 80),
    ];
    let edges = vec![
        call("main", "process", 3),
        call("process", "validate", 12),
        call("process", "validate", 15),
        call("process", "external.Log", 20),
        Edge {
            kind: "reference".to_string(),
            ..call("main", "validate", 5)
        },
        call("", "validate", 1),
    ];
    let counts = store
        .replace_commit_graph(scope, repo, "g1", &defs, &edges)
        .await
        .unwrap();
    assert_eq!(counts.definitions, 3);
    assert_eq!(counts.edges, 4);
    assert!(store.has_graph_for_commit(scope, repo, "g1").await.unwrap());

    let out = store
        .outgoing_edges(scope, repo, "g1", "process", None)
        .await
        .unwrap();
    let targets: Vec<&str> = out.iter().map(|e| e.record.target_entity_id.as_str()).collect();
    assert_eq!(targets, vec!["external.Log", "validate"]);
    assert_eq!(out[1].record.count, 2);
    assert_eq!(out[1].record.source_line, 12);
    assert_eq!(out[1].record.kind, "call");

    let into_validate = store
        .incoming_edges(scope, repo, "g1", "validate", Some("call"))
        .await
        .unwrap();
    assert_eq!(into_validate.len(), 1);
    let all_into_validate = store
        .incoming_edges(scope, repo, "g1", "validate", None)
        .await
        .unwrap();
    assert_eq!(all_into_validate.len(), 2);

    let found = store
        .search_definitions(scope, repo, "g1", "order", 0)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].record.entity_id, "process");

    let navigator = Navigator::new(fx.store.clone(), fx.scope.clone());
    let callers = navigator.callers(repo, "g1", "ProcessOrder").await.unwrap();
    assert_eq!(callers.len(), 1);
    assert_eq!(callers[0].entity_id, "main");
    assert_eq!(callers[0].name, "main");
    assert_eq!(callers[0].call_line, 3);

    let callees = navigator.callees(repo, "g1", "process").await.unwrap();
    assert_eq!(callees.len(), 2);
    assert!(!callees[0].resolved);
    assert_eq!(callees[0].entity_id, "external.Log");
    assert!(callees[1].resolved);
    assert_eq!(callees[1].name, "validate");
    assert_eq!(callees[1].count, 2);

    assert!(navigator.callers(repo, "g1", "nothing").await.unwrap().is_empty());

    // An analyzed commit with no definitions or edges still counts as indexed.
    let empty = store
        .replace_commit_graph(scope, repo, "hollow", &[], &[])
        .await
        .unwrap();
    assert_eq!((empty.definitions, empty.edges), (0, 0));
    assert!(store.has_graph_for_commit(scope, repo, "hollow").await.unwrap());

    // Replacing drops the previous graph entirely.
    store
        .replace_commit_graph(scope, repo, "g1", &defs[..1], &[])
        .await
        .unwrap();
    assert!(store
        .get_definition(scope, repo, "g1", "process")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .outgoing_edges(scope, repo, "g1", "main", None)
        .await
        .unwrap()
        .is_empty());
}

pub async fn tenant_isolation(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);
    let other = unique_tenant();

    assert_eq!(
        store.get_repository(scope, repo).await.unwrap().tenant_id.as_deref(),
        scope.tenant_id().map(|t| t.as_str())
    );
    assert!(store.get_repository(&other, repo).await.unwrap_err().is_not_found());

    let job = store
        .enqueue_job(scope, &NewJob::commit_index(repo, "t1"))
        .await
        .unwrap();
    store
        .set_hash_mapping(scope, &HashMapping::new(repo, "deadbeef", "cafef00d", "blob"))
        .await
        .unwrap();
    store
        .replace_commit_snapshot(scope, repo, "t1", &[entry("a", "Alpha", "function", "a.go", 1)])
        .await
        .unwrap();

    assert!(store.claim_job(&other).await.unwrap().is_none());
    assert!(store.get_job(&other, job.id).await.unwrap_err().is_not_found());
    assert!(store.job_status(&other, repo, "t1").await.unwrap_err().is_not_found());
    assert!(store
        .enqueue_job(&other, &NewJob::commit_index(repo, "t2"))
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .get_got_hash(&other, repo, "deadbeef")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store
        .search_entities(&other, repo, "t1", "Alpha", None, 10)
        .await
        .unwrap_err()
        .is_not_found());
    assert!(store.delete_repository(&other, repo).await.unwrap_err().is_not_found());
    assert_eq!(store.queue_stats(&other).await.unwrap().queued, 0);

    let claimed = store.claim_job(scope).await.unwrap().unwrap();
    assert!(store
        .complete_job(&other, claimed.id, JobStatus::Completed, "")
        .await
        .unwrap_err()
        .is_not_found());
    store
        .complete_job(scope, claimed.id, JobStatus::Completed, "")
        .await
        .unwrap();
}

pub async fn delete_repository_cascades(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (store, scope, repo) = (&fx.store, &fx.scope, fx.repo.id);

    let job = store
        .enqueue_job(scope, &NewJob::commit_index(repo, "gone"))
        .await
        .unwrap();
    store
        .set_hash_mapping(scope, &HashMapping::new(repo, "deadbeef", "cafef00d", "blob"))
        .await
        .unwrap();
    store
        .replace_commit_snapshot(scope, repo, "gone", &[entry("a", "Alpha", "function", "a.go", 1)])
        .await
        .unwrap();
    store
        .replace_commit_graph(scope, repo, "gone", &[definition("a", "Alpha", "a.go", 1)], &[])
        .await
        .unwrap();
    store.reserve_number(scope, repo, "issue").await.unwrap();

    store.delete_repository(scope, repo).await.unwrap();

    let unscoped = TenantScope::unscoped();
    assert!(store.get_repository(&unscoped, repo).await.unwrap_err().is_not_found());
    assert!(store.get_job(&unscoped, job.id).await.unwrap_err().is_not_found());
    assert!(store
        .get_got_hash(&unscoped, repo, "deadbeef")
        .await
        .unwrap_err()
        .is_not_found());
    assert!(!store.has_index_for_commit(&unscoped, repo, "gone").await.unwrap());
    assert!(!store.has_graph_for_commit(&unscoped, repo, "gone").await.unwrap());
    assert!(store.delete_repository(scope, repo).await.unwrap_err().is_not_found());
}

pub async fn reserve_number_is_sequential(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (scope, repo) = (&fx.scope, fx.repo.id);

    let first = fx.store.reserve_number(scope, repo, "issue").await.unwrap();
    assert_eq!(first, 1);
    let second = fx.store.reserve_number(scope, repo, "pull_request").await.unwrap();
    assert_eq!(second, 2);

    let reservations = (0..6).map(|i| {
        let store = fx.store.clone();
        let scope = fx.scope.clone();
        let kind = if i % 2 == 0 { "issue" } else { "pull_request" };
        tokio::spawn(async move { store.reserve_number(&scope, repo, kind).await })
    });
    let mut numbers: Vec<i64> = futures::future::join_all(reservations)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![3, 4, 5, 6, 7, 8]);

    let other = fx
        .store
        .create_repository(scope, "acme", "gadgets")
        .await
        .unwrap();
    assert_eq!(fx.store.reserve_number(scope, other.id, "issue").await.unwrap(), 1);
}

pub struct FixedAnalyzer(pub CommitAnalysis);

#[async_trait]
impl CommitAnalyzer for FixedAnalyzer {
    async fn analyze(&self, _job: &IndexingJob) -> anyhow::Result<CommitAnalysis> {
        Ok(self.0.clone())
    }
}

struct BrokenAnalyzer;

#[async_trait]
impl CommitAnalyzer for BrokenAnalyzer {
    async fn analyze(&self, job: &IndexingJob) -> anyhow::Result<CommitAnalysis> {
        anyhow::bail!("cannot parse {}", job.commit_hash)
    }
}

pub fn immediate_retries() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(10),
        backoff: BackoffPolicy {
            base: Duration::ZERO,
            max: Duration::ZERO,
        },
    }
}

pub async fn worker_indexes_commit(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (scope, repo) = (&fx.scope, fx.repo.id);

    let analysis = CommitAnalysis {
        identities: vec![sighting("sid-1", "ProcessOrder")],
        versions: vec![version("sid-1", "orders.go", "e1", "b1")],
        entries: vec![entry("po", "ProcessOrder", "function", "orders.go", 10)],
        definitions: vec![
            definition("main", "main", "main.go", 1),
            definition("process", "ProcessOrder", "orders.go", 10),
        ],
        edges: vec![call("main", "process", 3)],
    };
    let worker = Worker::new(fx.store.clone(), Arc::new(FixedAnalyzer(analysis)))
        .with_scope(scope.clone())
        .with_config(immediate_retries());

    assert_eq!(worker.run_once().await.unwrap(), JobOutcome::Idle);

    fx.store
        .enqueue_job(scope, &NewJob::commit_index(repo, "w1"))
        .await
        .unwrap();
    match worker.run_once().await.unwrap() {
        JobOutcome::Completed(job) => {
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.attempt_count, 1);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(fx.store.has_index_for_commit(scope, repo, "w1").await.unwrap());
    assert!(fx.store.has_graph_for_commit(scope, repo, "w1").await.unwrap());
    assert!(fx.store.has_versions_for_commit(scope, repo, "w1").await.unwrap());

    // A second job type on an indexed commit skips analysis.
    fx.store
        .enqueue_job(scope, &NewJob::new(repo, "w1", "reindex"))
        .await
        .unwrap();
    assert!(matches!(
        worker.run_once().await.unwrap(),
        JobOutcome::Skipped(_)
    ));
}

pub async fn worker_skips_commit_with_empty_analysis(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (scope, repo) = (&fx.scope, fx.repo.id);

    let worker = Worker::new(
        fx.store.clone(),
        Arc::new(FixedAnalyzer(CommitAnalysis::default())),
    )
    .with_scope(scope.clone())
    .with_config(immediate_retries());

    fx.store
        .enqueue_job(scope, &NewJob::commit_index(repo, "bare"))
        .await
        .unwrap();
    assert!(matches!(
        worker.run_once().await.unwrap(),
        JobOutcome::Completed(_)
    ));
    assert!(fx.store.has_index_for_commit(scope, repo, "bare").await.unwrap());
    assert!(fx.store.has_graph_for_commit(scope, repo, "bare").await.unwrap());

    fx.store
        .enqueue_job(scope, &NewJob::new(repo, "bare", "reindex"))
        .await
        .unwrap();
    assert!(matches!(
        worker.run_once().await.unwrap(),
        JobOutcome::Skipped(_)
    ));
}

pub async fn worker_retries_then_fails(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let (scope, repo) = (&fx.scope, fx.repo.id);

    let worker = Worker::new(fx.store.clone(), Arc::new(BrokenAnalyzer))
        .with_scope(scope.clone())
        .with_config(immediate_retries());

    fx.store
        .enqueue_job(scope, &NewJob::commit_index(repo, "bad").with_max_attempts(2))
        .await
        .unwrap();

    match worker.run_once().await.unwrap() {
        JobOutcome::Requeued(job) => {
            assert_eq!(job.status, JobStatus::Queued);
            assert_eq!(job.last_error, "cannot parse bad");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    match worker.run_once().await.unwrap() {
        JobOutcome::Failed(job) => {
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.attempt_count, 2);
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(worker.run_once().await.unwrap(), JobOutcome::Idle);
    assert!(!fx.store.has_index_for_commit(scope, repo, "bad").await.unwrap());
}

pub async fn worker_stops_on_shutdown(store: Arc<dyn Store>) {
    let fx = fixture(store).await;
    let worker = Worker::new(fx.store.clone(), Arc::new(BrokenAnalyzer))
        .with_scope(fx.scope.clone())
        .with_config(immediate_retries());

    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(async move { worker.run_until(rx).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();

    let handled = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(handled, 0);
}
