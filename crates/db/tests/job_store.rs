use assert_matches::assert_matches;
use clipper_core::error::StoreError;
use clipper_core::job::{JobFilter, JobStatus, JobType, JobUpdate};
use clipper_core::job_store::{cancel_job, JobStore};
use clipper_core::types::new_job_id;
use clipper_db::SqliteJobStore;
use serde_json::json;

async fn store() -> SqliteJobStore {
    let pool = clipper_db::create_memory_pool().await.unwrap();
    clipper_db::run_migrations(&pool).await.unwrap();
    clipper_db::health_check(&pool).await.unwrap();
    SqliteJobStore::new(pool)
}

#[tokio::test]
async fn create_and_get_round_trip() {
    let store = store().await;
    let job = store
        .create(JobType::ImageGenerate, json!({"prompt": "a red shoe", "seed": 7}))
        .await
        .unwrap();

    let fetched = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, job.id);
    assert_eq!(fetched.job_type, JobType::ImageGenerate);
    assert_eq!(fetched.status, JobStatus::Queued);
    assert_eq!(fetched.stage, "queued");
    assert_eq!(fetched.progress_pct, 0);
    assert_eq!(fetched.params["seed"], 7);
    assert!(fetched.result.is_none());
}

#[tokio::test]
async fn get_unknown_job_is_none() {
    let store = store().await;
    assert!(store.get(new_job_id()).await.unwrap().is_none());
}

#[tokio::test]
async fn full_lifecycle_to_done() {
    let store = store().await;
    let job = store.create(JobType::CopyGenerate, json!({})).await.unwrap();

    let running = store
        .update(
            job.id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .stage("worker_0_starting")
                .progress(2)
                .clear_error()
                .only_from(&[JobStatus::Queued]),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.progress_pct, 2);

    let done = store
        .update(
            job.id,
            JobUpdate::new()
                .status(JobStatus::Done)
                .stage("completed")
                .progress(100)
                .result(json!({"asset_ids": ["a1"]}))
                .clear_error(),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert_eq!(done.result.unwrap()["asset_ids"][0], "a1");
    assert!(done.error_text.is_none());
}

#[tokio::test]
async fn progress_is_clamped_before_persistence() {
    let store = store().await;
    let job = store.create(JobType::CopyGenerate, json!({})).await.unwrap();
    store
        .update(job.id, JobUpdate::new().status(JobStatus::Running))
        .await
        .unwrap();

    let high = store
        .update(job.id, JobUpdate::new().progress(150))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(high.progress_pct, 100);

    let low = store
        .update(job.id, JobUpdate::new().progress(-5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(low.progress_pct, 0);
}

#[tokio::test]
async fn guard_conflict_reports_current_status() {
    let store = store().await;
    let job = store.create(JobType::VideoT2v, json!({})).await.unwrap();
    cancel_job(&store, job.id).await.unwrap();

    let result = store
        .update(
            job.id,
            JobUpdate::new()
                .status(JobStatus::Running)
                .only_from(&[JobStatus::Queued]),
        )
        .await;

    assert_matches!(
        result,
        Err(StoreError::StatusConflict { current: JobStatus::Cancelled, .. })
    );
    let stored = store.get(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn update_unknown_job_is_none() {
    let store = store().await;
    let result = store
        .update(new_job_id(), JobUpdate::new().stage("x"))
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn second_cancel_is_a_noop() {
    let store = store().await;
    let job = store.create(JobType::ImageInpaint, json!({})).await.unwrap();

    let first = cancel_job(&store, job.id).await.unwrap().unwrap();
    assert!(first.cancelled);
    let second = cancel_job(&store, job.id).await.unwrap().unwrap();
    assert!(!second.cancelled);
    assert_eq!(second.job.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn list_filters_and_orders_newest_first() {
    let store = store().await;
    let a = store.create(JobType::CopyGenerate, json!({})).await.unwrap();
    let b = store.create(JobType::ImageGenerate, json!({})).await.unwrap();
    let c = store.create(JobType::ImageGenerate, json!({})).await.unwrap();
    cancel_job(&store, a.id).await.unwrap();

    let queued = store
        .list(&JobFilter::with_status(JobStatus::Queued))
        .await
        .unwrap();
    let ids: Vec<_> = queued.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![c.id, b.id]);

    let copies = store
        .list(&JobFilter {
            job_type: Some(JobType::CopyGenerate),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].id, a.id);

    let limited = store
        .list(&JobFilter {
            limit: Some(1),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);

    let second_page = store
        .list(&JobFilter {
            limit: Some(1),
            offset: Some(1),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(second_page.len(), 1);
    assert_ne!(second_page[0].id, limited[0].id);
}
