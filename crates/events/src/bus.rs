//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is the central publish/subscribe hub for [`JobEvent`]s.
//! It is designed to be shared via `Arc<EventBus>` across the worker pool
//! and whatever surfaces job updates to clients.

use chrono::{DateTime, Utc};
use clipper_core::job::JobType;
use clipper_core::types::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// A worker picked the job up.
pub const MSG_TYPE_JOB_STARTED: &str = "job_started";

/// Progress update during job execution (percentage + stage).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed with an error.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Job was cancelled.
pub const MSG_TYPE_JOB_CANCELLED: &str = "job_cancelled";

// ---------------------------------------------------------------------------
// JobEvent
// ---------------------------------------------------------------------------

/// What happened to the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobEventKind {
    Started { worker: usize },
    Progress { stage: String, percent: u8 },
    Completed,
    Failed { error: String },
    Cancelled,
}

impl JobEventKind {
    /// The wire message type for this kind.
    pub fn message_type(&self) -> &'static str {
        match self {
            JobEventKind::Started { .. } => MSG_TYPE_JOB_STARTED,
            JobEventKind::Progress { .. } => MSG_TYPE_JOB_PROGRESS,
            JobEventKind::Completed => MSG_TYPE_JOB_COMPLETED,
            JobEventKind::Failed { .. } => MSG_TYPE_JOB_FAILED,
            JobEventKind::Cancelled => MSG_TYPE_JOB_CANCELLED,
        }
    }
}

/// A job lifecycle change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub job_type: JobType,
    #[serde(flatten)]
    pub kind: JobEventKind,
    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job_id: JobId, job_type: JobType, kind: JobEventKind) -> Self {
        Self {
            job_id,
            job_type,
            kind,
            timestamp: Utc::now(),
        }
    }

    /// Render the event as a JSON message with a `type` field.
    pub fn to_message(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(obj) = value.as_object_mut() {
            obj.insert(
                "type".to_string(),
                serde_json::Value::from(self.kind.message_type()),
            );
        }
        value
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`JobEvent`].
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers and return how many
    /// received it.
    ///
    /// With no active subscribers the event is dropped; the job store
    /// remains the source of truth.
    pub fn publish(&self, event: JobEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(
                    job_id = %event.job_id,
                    kind = event.kind.message_type(),
                    "No subscribers; event dropped",
                );
                0
            }
        }
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
