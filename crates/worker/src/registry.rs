//! Job type → handler mapping.
//!
//! The registry is filled once at startup and then shared read-only with
//! the worker pool through an `Arc`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use clipper_core::error::{CoreError, StoreError};
use clipper_core::job::{Job, JobType};
use clipper_core::retry_ladder::LadderError;

use crate::progress::ProgressReporter;

/// Why a handler did not produce a result.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The job was cancelled while the handler was running.
    #[error("job was cancelled")]
    Cancelled,

    /// The work failed. The message is recorded verbatim on the job.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<LadderError> for HandlerError {
    fn from(err: LadderError) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(
        &self,
        job: Job,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError>;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job, ProgressReporter) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        job: Job,
        progress: ProgressReporter,
    ) -> Result<serde_json::Value, HandlerError> {
        (self)(job, progress).await
    }
}

/// Handlers keyed by job type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `job_type`, replacing any earlier one.
    pub fn register(&mut self, job_type: JobType, handler: impl JobHandler + 'static) {
        if self.handlers.insert(job_type, Arc::new(handler)).is_some() {
            tracing::warn!(job_type = %job_type, "Replacing registered job handler");
        }
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Registered job types in declaration order.
    pub fn registered_types(&self) -> Vec<JobType> {
        JobType::ALL
            .iter()
            .copied()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    /// Fail unless every job type has a handler.
    pub fn ensure_complete(&self) -> Result<(), CoreError> {
        let missing: Vec<&str> = JobType::ALL
            .iter()
            .filter(|t| !self.handlers.contains_key(t))
            .map(|t| t.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(format!(
                "No handler registered for job types: {}",
                missing.join(", ")
            )))
        }
    }
}
