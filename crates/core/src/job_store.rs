//! Persistence contract for job records.
//!
//! The worker pool and progress reporter only ever talk to a
//! [`JobStore`]. Every update on one job id is atomic; guarded updates
//! ([`JobUpdate::only_from`]) are compare-and-set operations so a
//! cancellation racing a worker can never be overwritten.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::job::{Job, JobFilter, JobStatus, JobType, JobUpdate, MAX_LIST_LIMIT, STAGE_CANCELLED};
use crate::types::{new_job_id, JobId};

/// Durable storage for jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a new queued job.
    async fn create(&self, job_type: JobType, params: serde_json::Value)
        -> Result<Job, StoreError>;

    /// Fetch a job by id.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Apply a partial update atomically.
    ///
    /// Returns `Ok(None)` when the job does not exist and
    /// [`StoreError::StatusConflict`] when the update's guard or status
    /// transition is not permitted by the current status.
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, StoreError>;

    /// List jobs newest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Result of a cancellation request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub job: Job,
    /// `false` when the job was already terminal and nothing changed.
    pub cancelled: bool,
}

/// Request cancellation of a job.
///
/// Moves a queued or running job to `cancelled`. A request against a job
/// that is already terminal is a no-op reporting `cancelled: false`.
/// Returns `Ok(None)` when the job does not exist.
pub async fn cancel_job(
    store: &dyn JobStore,
    id: JobId,
) -> Result<Option<CancelOutcome>, StoreError> {
    let update = JobUpdate::new()
        .status(JobStatus::Cancelled)
        .stage(STAGE_CANCELLED)
        .only_from(JobStatus::ACTIVE);

    match store.update(id, update).await {
        Ok(Some(job)) => {
            tracing::info!(job_id = %id, "Job cancelled");
            Ok(Some(CancelOutcome {
                job,
                cancelled: true,
            }))
        }
        Ok(None) => Ok(None),
        Err(StoreError::StatusConflict { .. }) => {
            let job = store.get(id).await?;
            Ok(job.map(|job| CancelOutcome {
                job,
                cancelled: false,
            }))
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Every job matching `filter`, fetched page by page.
///
/// `filter.limit` sets the page size; `filter.offset` is ignored. Rows
/// inserted while paging may shift later pages.
pub async fn list_all(store: &dyn JobStore, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
    let page_size = filter.limit.unwrap_or(MAX_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let mut jobs = Vec::new();
    loop {
        let page = store
            .list(&JobFilter {
                limit: Some(page_size),
                offset: Some(jobs.len() as u32),
                ..filter.clone()
            })
            .await?;
        let short = page.len() < page_size as usize;
        jobs.extend(page);
        if short {
            return Ok(jobs);
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local [`JobStore`] backed by a `RwLock<HashMap>`.
///
/// Each update runs inside one write-lock section, which is what makes
/// guarded updates atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(
        &self,
        job_type: JobType,
        params: serde_json::Value,
    ) -> Result<Job, StoreError> {
        let job = Job::new(new_job_id(), job_type, params, Utc::now());
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };
        if !update.permits(job.status) {
            return Err(StoreError::StatusConflict {
                id,
                current: job.status,
            });
        }
        update.apply_to(job, Utc::now());
        Ok(Some(job.clone()))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();
        // UUIDv7 ids break ties between jobs created in the same instant.
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(filter.effective_offset() as usize)
            .take(filter.effective_limit() as usize)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
