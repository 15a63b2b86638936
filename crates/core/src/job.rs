//! Job model, type tags, and the status state machine.
//!
//! A job moves `queued -> running -> {done, error, cancelled}`. The three
//! right-hand states are terminal: once a job reaches one, no update may
//! move it anywhere else.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Tag enums
// ---------------------------------------------------------------------------

/// Define a closed enum whose variants map to stable string tags.
///
/// The tags are what the store persists and what clients send; the enum is
/// what the rest of the code matches on.
macro_rules! define_tag_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $tag:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $tag)] $variant ),+
        }

        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Return the persisted string tag.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $tag ),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $tag => Ok($name::$variant), )+
                    other => Err(CoreError::Validation(format!(
                        "Unknown {} '{other}'", stringify!($name)
                    ))),
                }
            }
        }
    };
}

define_tag_enum! {
    /// Routing tag for a job. The engine is agnostic to what each one does.
    JobType {
        CopyGenerate = "copy_generate",
        ImageGenerate = "image_generate",
        ImageInpaint = "image_inpaint",
        VideoStoryboard = "video_storyboard",
        VideoT2v = "video_t2v",
    }
}

define_tag_enum! {
    /// Job execution status.
    JobStatus {
        Queued = "queued",
        Running = "running",
        Done = "done",
        Error = "error",
        Cancelled = "cancelled",
    }
}

impl JobStatus {
    /// Statuses a job can still leave.
    pub const ACTIVE: &'static [JobStatus] = &[JobStatus::Queued, JobStatus::Running];

    /// `done`, `error`, and `cancelled` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `queued -> error` exists only for dispatch-time configuration errors
    /// (no handler registered), which never pass through `running`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Error)
                | (Queued, Cancelled)
                | (Running, Done)
                | (Running, Error)
                | (Running, Cancelled)
        )
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Lowest persisted progress value.
pub const PROGRESS_MIN: u8 = 0;

/// Highest persisted progress value.
pub const PROGRESS_MAX: u8 = 100;

/// Clamp an arbitrary progress value into `0..=100`.
pub fn clamp_progress(pct: i64) -> u8 {
    pct.clamp(PROGRESS_MIN as i64, PROGRESS_MAX as i64) as u8
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Stage label given to freshly created jobs.
pub const STAGE_QUEUED: &str = "queued";

/// Stage label for a successfully finished job.
pub const STAGE_COMPLETED: &str = "completed";

/// Stage label for a failed job.
pub const STAGE_FAILED: &str = "failed";

/// Stage label written by a cancellation request.
pub const STAGE_CANCELLED: &str = "cancelled";

/// A unit of asynchronous generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress_pct: u8,
    pub stage: String,
    pub params: serde_json::Value,
    /// Present only when `status == done`.
    pub result: Option<serde_json::Value>,
    /// Present only when `status == error`.
    pub error_text: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Build a new queued job record.
    pub fn new(id: JobId, job_type: JobType, params: serde_json::Value, now: Timestamp) -> Self {
        Self {
            id,
            job_type,
            status: JobStatus::Queued,
            progress_pct: PROGRESS_MIN,
            stage: STAGE_QUEUED.to_string(),
            params,
            result: None,
            error_text: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// A partial, atomic job update. Unset fields are left unchanged.
///
/// `only_from` turns the update into a compare-and-set: it applies only
/// while the stored status is one of the listed statuses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub stage: Option<String>,
    pub progress_pct: Option<u8>,
    pub result: Option<serde_json::Value>,
    /// `Some(None)` clears the error text; `Some(Some(_))` sets it.
    pub error_text: Option<Option<String>>,
    pub only_from: Option<Vec<JobStatus>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Set progress; the value is clamped into `0..=100` here so no caller
    /// can persist an out-of-range percentage.
    pub fn progress(mut self, pct: i64) -> Self {
        self.progress_pct = Some(clamp_progress(pct));
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, text: impl Into<String>) -> Self {
        self.error_text = Some(Some(text.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_text = Some(None);
        self
    }

    pub fn only_from(mut self, statuses: &[JobStatus]) -> Self {
        self.only_from = Some(statuses.to_vec());
        self
    }

    /// Check this update against the stored status.
    ///
    /// Returns `false` when the guard is not satisfied or the status change
    /// is not a legal state-machine transition.
    pub fn permits(&self, current: JobStatus) -> bool {
        if let Some(allowed) = &self.only_from {
            if !allowed.contains(&current) {
                return false;
            }
        }
        match self.status {
            Some(next) => current.can_transition_to(next),
            // Field-only updates may not touch a finished job.
            None => !current.is_terminal(),
        }
    }

    /// Apply the update to an in-memory record. Callers check
    /// [`permits`](Self::permits) first.
    pub fn apply_to(&self, job: &mut Job, now: Timestamp) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(stage) = &self.stage {
            job.stage = stage.clone();
        }
        if let Some(pct) = self.progress_pct {
            job.progress_pct = pct;
        }
        if let Some(result) = &self.result {
            job.result = Some(result.clone());
        }
        if let Some(error_text) = &self.error_text {
            job.error_text = error_text.clone();
        }
        job.updated_at = now;
    }
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

/// Default page size for job listing.
pub const DEFAULT_LIST_LIMIT: u32 = 50;

/// Maximum page size for job listing.
pub const MAX_LIST_LIMIT: u32 = 100;

/// Filter for [`JobStore::list`](crate::job_store::JobStore::list).
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    /// Defaults to 50, capped at 100.
    pub limit: Option<u32>,
    /// Rows to skip before the page starts.
    pub offset: Option<u32>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// The effective page size.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.map_or(true, |t| job.job_type == t)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
