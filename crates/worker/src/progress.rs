//! Progress reporting from a running handler back to its job record.
//!
//! Every report re-reads the job first. A job that has been cancelled turns
//! the report into [`HandlerError::Cancelled`], which the handler propagates
//! with `?` to stop at its next checkpoint.

use std::sync::Arc;

use clipper_core::error::StoreError;
use clipper_core::job::{JobStatus, JobType, JobUpdate};
use clipper_core::job_store::JobStore;
use clipper_core::types::JobId;
use clipper_events::{EventBus, JobEvent, JobEventKind};

use crate::registry::HandlerError;

/// Handle a handler uses to publish `(stage, percent)` checkpoints.
#[derive(Clone)]
pub struct ProgressReporter {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    job_type: JobType,
    events: Option<Arc<EventBus>>,
}

impl ProgressReporter {
    pub fn new(store: Arc<dyn JobStore>, job_id: JobId, job_type: JobType) -> Self {
        Self {
            store,
            job_id,
            job_type,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Option<Arc<EventBus>>) -> Self {
        self.events = events;
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Record a checkpoint. `percent` is clamped into `0..=100`.
    ///
    /// Returns [`HandlerError::Cancelled`] once the job has been cancelled.
    pub async fn report(&self, stage: &str, percent: i32) -> Result<(), HandlerError> {
        let Some(job) = self.store.get(self.job_id).await? else {
            return Ok(());
        };
        if job.status == JobStatus::Cancelled {
            return Err(HandlerError::Cancelled);
        }

        let update = JobUpdate::new()
            .stage(stage)
            .progress(i64::from(percent))
            .only_from(&[JobStatus::Running]);

        match self.store.update(self.job_id, update).await {
            Ok(Some(job)) => {
                tracing::debug!(
                    job_id = %self.job_id,
                    stage,
                    percent = job.progress_pct,
                    "Job progress",
                );
                if let Some(events) = &self.events {
                    events.publish(JobEvent::new(
                        self.job_id,
                        self.job_type,
                        JobEventKind::Progress {
                            stage: job.stage,
                            percent: job.progress_pct,
                        },
                    ));
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(StoreError::StatusConflict {
                current: JobStatus::Cancelled,
                ..
            }) => Err(HandlerError::Cancelled),
            Err(StoreError::StatusConflict { current, .. }) => {
                tracing::debug!(
                    job_id = %self.job_id,
                    status = %current,
                    stage,
                    "Progress ignored; job is not running",
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the job has been cancelled. Does not write anything.
    pub async fn is_cancelled(&self) -> Result<bool, HandlerError> {
        let job = self.store.get(self.job_id).await?;
        Ok(job.is_some_and(|j| j.status == JobStatus::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clipper_core::job_store::{cancel_job, MemoryJobStore};
    use clipper_core::types::new_job_id;
    use serde_json::json;

    use super::*;

    async fn running_job(store: &Arc<dyn JobStore>) -> JobId {
        let job = store.create(JobType::ImageGenerate, json!({})).await.unwrap();
        store
            .update(job.id, JobUpdate::new().status(JobStatus::Running))
            .await
            .unwrap();
        job.id
    }

    // -- clamping --

    #[tokio::test]
    async fn out_of_range_percentages_are_clamped() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = running_job(&store).await;
        let reporter = ProgressReporter::new(store.clone(), id, JobType::ImageGenerate);

        reporter.report("image_generating", 150).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.progress_pct, 100);
        assert_eq!(job.stage, "image_generating");

        reporter.report("image_saving", -5).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.progress_pct, 0);
        assert_eq!(job.stage, "image_saving");
    }

    // -- cancellation --

    #[tokio::test]
    async fn report_after_cancel_signals_abort() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = running_job(&store).await;
        let reporter = ProgressReporter::new(store.clone(), id, JobType::ImageGenerate);

        assert!(!reporter.is_cancelled().await.unwrap());
        cancel_job(store.as_ref(), id).await.unwrap();
        assert!(reporter.is_cancelled().await.unwrap());

        assert_matches!(
            reporter.report("image_saving", 85).await,
            Err(HandlerError::Cancelled)
        );
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.stage, "cancelled");
    }

    #[tokio::test]
    async fn report_for_missing_job_is_ignored() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let reporter = ProgressReporter::new(store, new_job_id(), JobType::CopyGenerate);
        assert!(reporter.report("copy_generating", 20).await.is_ok());
    }

    // -- events --

    #[tokio::test]
    async fn progress_is_published() {
        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let id = running_job(&store).await;
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let reporter =
            ProgressReporter::new(store, id, JobType::ImageGenerate).with_events(Some(bus));

        reporter.report("image_generating", 30).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id, id);
        assert_eq!(
            event.kind,
            JobEventKind::Progress {
                stage: "image_generating".into(),
                percent: 30
            }
        );
    }
}
