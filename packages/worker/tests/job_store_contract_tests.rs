//! Contract tests for the durable queue.
//!
//! These run against the in-memory implementation of the `JobStore` trait;
//! any implementation must satisfy the same properties.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use worker_core::kernel::jobs::testing::InMemoryJobStore;
use worker_core::kernel::jobs::{Job, JobFamily, JobKind, JobState, JobStore};

fn pending_job(priority: i32, created_offset_secs: i64) -> Job {
    Job::builder()
        .owner_id(Uuid::new_v4())
        .target_id(Uuid::new_v4())
        .kind(JobKind::Pdf)
        .priority(priority)
        .metadata(json!({}))
        .created_at(Utc::now() + Duration::seconds(created_offset_secs))
        .build()
}

#[tokio::test]
async fn concurrent_claimers_see_disjoint_jobs() {
    let store = Arc::new(InMemoryJobStore::new());
    let mut inserted = HashSet::new();
    for i in 0..20 {
        let job = pending_job(10, i);
        inserted.insert(job.id);
        store.insert(job).await.unwrap();
    }

    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{worker}");
            let mut claimed = Vec::new();
            while let Some(job) = store.claim(&worker_id, JobFamily::Export).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            // Every job id appears in at most one claimer's result.
            assert!(seen.insert(id), "job {id} was claimed twice");
            assert!(inserted.contains(&id));
        }
    }
    assert_eq!(seen.len(), 20);
}

#[tokio::test]
async fn claims_observe_priority_desc_then_fifo() {
    let store = InMemoryJobStore::new();

    let low_old = pending_job(10, 0);
    let low_new = pending_job(10, 5);
    let high_old = pending_job(100, 2);
    let high_new = pending_job(100, 8);

    let expected = vec![high_old.id, high_new.id, low_old.id, low_new.id];
    for job in [low_new.clone(), high_new.clone(), low_old.clone(), high_old.clone()] {
        store.insert(job).await.unwrap();
    }

    let mut observed = Vec::new();
    while let Some(job) = store.claim("w1", JobFamily::Export).await.unwrap() {
        observed.push(job.id);
    }
    assert_eq!(observed, expected);
}

#[tokio::test]
async fn future_available_at_gates_claims_regardless_of_priority() {
    let store = InMemoryJobStore::new();

    let mut delayed = pending_job(100, 0);
    delayed.available_at = Utc::now() + Duration::seconds(60);
    let ready = pending_job(10, 1);
    let ready_id = ready.id;

    store.insert(delayed.clone()).await.unwrap();
    store.insert(ready).await.unwrap();

    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    assert_eq!(claimed.id, ready_id);
    assert!(store.claim("w1", JobFamily::Export).await.unwrap().is_none());

    // Once the clock passes available_at, the delayed row becomes eligible.
    store.advance(Duration::seconds(61));
    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    assert_eq!(claimed.id, delayed.id);
}

#[tokio::test]
async fn families_are_claimed_independently() {
    let store = InMemoryJobStore::new();

    let mut extraction = pending_job(10, 0);
    extraction.family = JobFamily::Extraction;
    let export = pending_job(10, 1);

    store.insert(extraction.clone()).await.unwrap();
    store.insert(export.clone()).await.unwrap();

    let claimed = store.claim("w1", JobFamily::Extraction).await.unwrap().unwrap();
    assert_eq!(claimed.id, extraction.id);
    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    assert_eq!(claimed.id, export.id);
}

#[tokio::test]
async fn claim_sets_the_lease_fields() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();

    let claimed = store.claim("worker-9", JobFamily::Export).await.unwrap().unwrap();
    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.worker_id.as_deref(), Some("worker-9"));
    assert!(claimed.started_at.is_some());
}

#[tokio::test]
async fn reset_with_backoff_increments_retries_and_delays_availability() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();

    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    store
        .reset_with_backoff(claimed.id, 10, "ETIMEDOUT during render")
        .await
        .unwrap();

    let job = store.get(claimed.id).unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.worker_id.is_none());
    assert!(job.started_at.is_none());

    let delay = (job.available_at - store.now()).num_seconds();
    assert!((9..=11).contains(&delay), "unexpected backoff delay {delay}s");

    // Not claimable until the delay passes.
    assert!(store.claim("w1", JobFamily::Export).await.unwrap().is_none());
    store.advance(Duration::seconds(11));
    assert!(store.claim("w1", JobFamily::Export).await.unwrap().is_some());
}

#[tokio::test]
async fn completion_rows_are_total() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();

    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    store
        .complete(claimed.id, "owner/exports/pdf/job.pdf", "https://signed.example/x")
        .await
        .unwrap();

    let job = store.get(claimed.id).unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.storage_path.is_some());
    assert!(job.artifact_url.is_some());
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn complete_requires_the_processing_state() {
    let store = InMemoryJobStore::new();
    let job = pending_job(10, 0);
    let id = job.id;
    store.insert(job).await.unwrap();

    // Still pending: the guard must reject the transition.
    assert!(store.complete(id, "p", "u").await.is_err());
}

#[tokio::test]
async fn stale_sweep_recovers_only_rows_past_the_threshold() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();
    store.insert(pending_job(10, 1)).await.unwrap();

    let stale = store.claim("crashed", JobFamily::Export).await.unwrap().unwrap();

    // Second claim happens 2 minutes later; it must survive the sweep.
    store.advance(Duration::seconds(120));
    let fresh = store.claim("alive", JobFamily::Export).await.unwrap().unwrap();

    // 301 seconds after the first claim: only the first row is stale.
    store.advance(Duration::seconds(181));
    let found = store.find_stale().await.unwrap();
    assert_eq!(found, vec![stale.id]);

    let count = store.reset_all_stale().await.unwrap();
    assert_eq!(count, 1);

    let recovered = store.get(stale.id).unwrap();
    assert_eq!(recovered.state, JobState::Pending);
    assert_eq!(recovered.retry_count, 0, "crash recovery is not a retry");
    assert!(recovered.available_at <= store.now());
    assert!(recovered.worker_id.is_none());

    let untouched = store.get(fresh.id).unwrap();
    assert_eq!(untouched.state, JobState::Processing);
}

#[tokio::test]
async fn a_job_at_exactly_the_threshold_is_not_yet_stale() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();
    store.claim("w1", JobFamily::Export).await.unwrap().unwrap();

    store.advance(Duration::seconds(300));
    assert!(store.find_stale().await.unwrap().is_empty());

    store.advance(Duration::seconds(2));
    assert_eq!(store.find_stale().await.unwrap().len(), 1);
}

#[tokio::test]
async fn retention_removes_old_completed_rows_only() {
    let store = InMemoryJobStore::new();

    let mut old = pending_job(10, 0);
    old.created_at = Utc::now() - Duration::days(40);
    let old_id = old.id;
    store.insert(old).await.unwrap();
    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    store.complete(claimed.id, "p/old.pdf", "https://x").await.unwrap();

    let mut recent = pending_job(10, 1);
    recent.created_at = Utc::now() - Duration::days(2);
    store.insert(recent.clone()).await.unwrap();
    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    store.complete(claimed.id, "p/recent.pdf", "https://y").await.unwrap();

    let cutoff = Utc::now() - Duration::days(30);
    let rows = store.find_old_completed(cutoff).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, old_id);
    assert_eq!(rows[0].storage_path.as_deref(), Some("p/old.pdf"));

    assert_eq!(store.delete_old_completed(cutoff).await.unwrap(), 1);
    assert!(store.get(old_id).is_none());
    assert!(store.get(recent.id).is_some());
}

#[tokio::test]
async fn owner_counters_cover_rate_and_quota_gates() {
    let store = InMemoryJobStore::new();
    let owner = Uuid::new_v4();

    for i in 0..3 {
        let mut job = pending_job(10, i);
        job.owner_id = owner;
        store.insert(job).await.unwrap();
    }
    store.insert(pending_job(10, 3)).await.unwrap();

    assert_eq!(
        store
            .count_recent_for_owner(owner, Duration::hours(1))
            .await
            .unwrap(),
        3
    );
    assert_eq!(store.count_active_for_owner(owner).await.unwrap(), 3);

    // A completed job leaves the active set. FIFO makes the oldest owner
    // job the one claimed here.
    let claimed = store.claim("w1", JobFamily::Export).await.unwrap().unwrap();
    assert_eq!(claimed.owner_id, owner);
    store.complete(claimed.id, "p", "u").await.unwrap();
    assert_eq!(store.count_active_for_owner(owner).await.unwrap(), 2);
}

#[tokio::test]
async fn stats_reflect_queue_composition() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();
    store.insert(pending_job(10, 1)).await.unwrap();
    store.claim("w1", JobFamily::Export).await.unwrap().unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.processing, 1);
}

#[tokio::test]
async fn queue_depth_counts_only_eligible_rows() {
    let store = InMemoryJobStore::new();
    store.insert(pending_job(10, 0)).await.unwrap();

    let mut delayed = pending_job(10, 1);
    delayed.available_at = Utc::now() + Duration::seconds(300);
    store.insert(delayed).await.unwrap();

    assert_eq!(store.queue_depth().await.unwrap(), 1);
}
