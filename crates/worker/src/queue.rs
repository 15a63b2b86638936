//! Fixed-size worker pool draining a FIFO queue of job ids.
//!
//! All workers share one receiver, so jobs are dispatched in enqueue order
//! across the whole pool. Every status write a worker makes is guarded
//! (`JobUpdate::only_from`), which keeps a cancellation that lands between
//! a read and a write from ever being overwritten.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use clipper_core::error::{CoreError, StoreError};
use clipper_core::job::{
    Job, JobStatus, JobType, JobUpdate, STAGE_CANCELLED, STAGE_COMPLETED, STAGE_FAILED,
};
use clipper_core::job_store::JobStore;
use clipper_core::types::JobId;
use clipper_events::{EventBus, JobEvent, JobEventKind};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::progress::ProgressReporter;
use crate::registry::{HandlerError, HandlerRegistry};

/// Progress recorded when a worker picks a job up.
const STARTING_PROGRESS: i64 = 2;

/// Local job queue with a pool of `max_concurrent_jobs` workers.
pub struct JobQueue {
    inner: Arc<Inner>,
    worker_count: usize,
    workers: Mutex<Option<Workers>>,
}

struct Workers {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    events: Option<Arc<EventBus>>,
    sender: mpsc::UnboundedSender<JobId>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<JobId>>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<HandlerRegistry>,
        config: &WorkerConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                events: None,
                sender,
                receiver: tokio::sync::Mutex::new(receiver),
            }),
            worker_count: config.max_concurrent_jobs.max(1),
            workers: Mutex::new(None),
        }
    }

    /// Startup constructor: refuse to build a pool whose registry leaves
    /// any job type without a handler.
    ///
    /// [`new`](Self::new) accepts a partial registry; jobs of unregistered
    /// types then fail when dequeued.
    pub fn try_new(
        store: Arc<dyn JobStore>,
        registry: HandlerRegistry,
        config: &WorkerConfig,
    ) -> Result<Self, CoreError> {
        registry.ensure_complete()?;
        Ok(Self::new(store, Arc::new(registry), config))
    }

    /// Publish lifecycle events on `events`. Call before [`start`](Self::start).
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = Some(events);
        } else {
            tracing::warn!("Event bus attached after workers started; ignoring");
        }
        self
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Append a job id to the queue. Returns immediately.
    pub fn enqueue(&self, job_id: JobId) {
        // The receiver lives as long as `inner`, so sending cannot fail.
        let _ = self.inner.sender.send(job_id);
        tracing::debug!(job_id = %job_id, "Job enqueued");
    }

    /// Spawn the worker tasks. Calling it on a running pool does nothing.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if workers.is_some() {
            return;
        }

        let cancel = CancellationToken::new();
        let handles = (0..self.worker_count)
            .map(|idx| tokio::spawn(worker_loop(self.inner.clone(), idx, cancel.clone())))
            .collect();

        tracing::info!(workers = self.worker_count, "Job queue started");
        *workers = Some(Workers { cancel, handles });
    }

    /// Stop every worker and wait until all of them have exited.
    ///
    /// Jobs that were mid-execution are abandoned and may stay `running`.
    /// Ids still waiting in the queue are kept for the next [`start`](Self::start).
    pub async fn stop(&self) {
        let taken = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Workers { cancel, handles }) = taken else {
            return;
        };

        cancel.cancel();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "Job worker panicked");
                }
            }
        }
        tracing::info!("Job queue stopped");
    }

    pub fn is_running(&self) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        let workers = self
            .workers
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(workers) = workers.take() {
            workers.cancel.cancel();
            for handle in workers.handles {
                handle.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn worker_loop(inner: Arc<Inner>, idx: usize, cancel: CancellationToken) {
    tracing::debug!(worker = idx, "Job worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inner.next_job_id() => next,
        };
        let Some(job_id) = next else {
            break;
        };
        inner.process(idx, job_id).await;
    }

    tracing::debug!(worker = idx, "Job worker exiting");
}

impl Inner {
    async fn next_job_id(&self) -> Option<JobId> {
        self.receiver.lock().await.recv().await
    }

    fn publish(&self, job_id: JobId, job_type: JobType, kind: JobEventKind) {
        if let Some(events) = &self.events {
            events.publish(JobEvent::new(job_id, job_type, kind));
        }
    }

    async fn process(&self, idx: usize, job_id: JobId) {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Dequeued job no longer exists; skipping");
                return;
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load dequeued job");
                self.fail_start(job_id, &e).await;
                return;
            }
        };

        match job.status {
            JobStatus::Queued => {}
            JobStatus::Cancelled => {
                tracing::debug!(job_id = %job_id, "Job cancelled before start; skipping");
                return;
            }
            other => {
                tracing::debug!(job_id = %job_id, status = %other, "Job is not queued; skipping");
                return;
            }
        }

        let job_type = job.job_type;
        let Some(handler) = self.registry.get(job_type) else {
            let message = format!("No handler registered for '{job_type}'.");
            tracing::error!(job_id = %job_id, job_type = %job_type, "{message}");
            let update = JobUpdate::new()
                .status(JobStatus::Error)
                .stage(STAGE_FAILED)
                .progress(100)
                .error(message.clone())
                .only_from(&[JobStatus::Queued]);
            if let Finalized::Applied = self.finish(job_id, update).await {
                self.publish(job_id, job_type, JobEventKind::Failed { error: message });
            }
            return;
        };

        let Some(job) = self.mark_running(idx, job_id).await else {
            return;
        };
        tracing::info!(worker = idx, job_id = %job_id, job_type = %job_type, "Job started");
        self.publish(job_id, job_type, JobEventKind::Started { worker: idx });

        let reporter = ProgressReporter::new(self.store.clone(), job_id, job_type)
            .with_events(self.events.clone());
        let outcome = AssertUnwindSafe(handler.handle(job, reporter))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(HandlerError::Failed(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        match outcome {
            Ok(result) => {
                let update = JobUpdate::new()
                    .status(JobStatus::Done)
                    .stage(STAGE_COMPLETED)
                    .progress(100)
                    .result(result)
                    .clear_error()
                    .only_from(&[JobStatus::Running]);
                match self.finish(job_id, update).await {
                    Finalized::Applied => {
                        tracing::info!(worker = idx, job_id = %job_id, "Job completed");
                        self.publish(job_id, job_type, JobEventKind::Completed);
                    }
                    Finalized::Superseded(JobStatus::Cancelled) => {
                        self.publish(job_id, job_type, JobEventKind::Cancelled);
                    }
                    _ => {}
                }
            }
            Err(HandlerError::Cancelled) => {
                let update = JobUpdate::new()
                    .status(JobStatus::Cancelled)
                    .stage(STAGE_CANCELLED)
                    .only_from(&[JobStatus::Running]);
                match self.finish(job_id, update).await {
                    Finalized::Applied | Finalized::Superseded(JobStatus::Cancelled) => {
                        tracing::info!(worker = idx, job_id = %job_id, "Job cancelled during execution");
                        self.publish(job_id, job_type, JobEventKind::Cancelled);
                    }
                    _ => {}
                }
            }
            Err(HandlerError::Failed(message)) => {
                let update = JobUpdate::new()
                    .status(JobStatus::Error)
                    .stage(STAGE_FAILED)
                    .progress(100)
                    .error(message.clone())
                    .only_from(&[JobStatus::Running]);
                match self.finish(job_id, update).await {
                    Finalized::Applied => {
                        tracing::warn!(worker = idx, job_id = %job_id, error = %message, "Job failed");
                        self.publish(job_id, job_type, JobEventKind::Failed { error: message });
                    }
                    Finalized::Superseded(JobStatus::Cancelled) => {
                        self.publish(job_id, job_type, JobEventKind::Cancelled);
                    }
                    _ => {}
                }
            }
        }
    }

    /// Guarded queued → running. `None` when the job moved on in between.
    async fn mark_running(&self, idx: usize, job_id: JobId) -> Option<Job> {
        let update = JobUpdate::new()
            .status(JobStatus::Running)
            .stage(format!("worker_{idx}_starting"))
            .progress(STARTING_PROGRESS)
            .clear_error()
            .only_from(&[JobStatus::Queued]);

        match self.store.update(job_id, update).await {
            Ok(job) => job,
            Err(StoreError::StatusConflict { current, .. }) => {
                tracing::debug!(job_id = %job_id, status = %current, "Job left the queue before start");
                None
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark job running");
                self.fail_start(job_id, &e).await;
                None
            }
        }
    }

    /// Best-effort `error` record for a dequeued job the store could not
    /// start, so it does not sit in `queued` forever.
    async fn fail_start(&self, job_id: JobId, cause: &StoreError) {
        let message = format!("failed to start: {cause}");
        let update = JobUpdate::new()
            .status(JobStatus::Error)
            .stage(STAGE_FAILED)
            .progress(100)
            .error(message.clone())
            .only_from(&[JobStatus::Queued]);
        match self.store.update(job_id, update).await {
            Ok(Some(job)) => {
                self.publish(job_id, job.job_type, JobEventKind::Failed { error: message });
            }
            Ok(None) | Err(StoreError::StatusConflict { .. }) => {}
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Could not record start failure");
            }
        }
    }

    /// Apply a terminal update guarded by the expected current status.
    async fn finish(&self, job_id: JobId, update: JobUpdate) -> Finalized {
        match self.store.update(job_id, update).await {
            Ok(Some(_)) => Finalized::Applied,
            Ok(None) => {
                tracing::warn!(job_id = %job_id, "Job disappeared before finalization");
                Finalized::Lost
            }
            Err(StoreError::StatusConflict { current, .. }) => {
                tracing::info!(
                    job_id = %job_id,
                    status = %current,
                    "Job already finished elsewhere; outcome discarded",
                );
                Finalized::Superseded(current)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to finalize job");
                Finalized::Lost
            }
        }
    }
}

/// What happened to a terminal update.
enum Finalized {
    Applied,
    /// The guard rejected the write; the stored status is kept.
    Superseded(JobStatus),
    Lost,
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
