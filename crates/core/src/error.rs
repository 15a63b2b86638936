use crate::job::JobStatus;
use crate::types::JobId;

/// Invalid input or setup detected before any job runs.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Errors surfaced by a [`JobStore`](crate::job_store::JobStore) implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The update carried a status guard (or an illegal status change) that
    /// the row's current status does not satisfy.
    #[error("Job {id} is {current}; update rejected")]
    StatusConflict { id: JobId, current: JobStatus },

    /// A stored payload could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The underlying storage engine failed.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Wrap any displayable backend failure.
    pub fn backend(err: impl std::fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
