//! Row model for the `jobs` table.

use chrono::{DateTime, Utc};
use clipper_core::error::StoreError;
use clipper_core::job::{clamp_progress, Job};
use sqlx::FromRow;

/// A row from the `jobs` table, as stored.
///
/// Enum tags, ids, and JSON payloads are kept as text; conversion into the
/// domain [`Job`] validates each of them.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    #[sqlx(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub progress_pct: i64,
    pub stage: String,
    pub params_json: String,
    pub result_json: Option<String>,
    pub error_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row
            .id
            .parse()
            .map_err(|e| StoreError::Serialization(format!("job id '{}': {e}", row.id)))?;
        let job_type = row
            .job_type
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;
        let status = row
            .status
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;
        let params = serde_json::from_str(&row.params_json)?;
        let result = row
            .result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(Job {
            id,
            job_type,
            status,
            progress_pct: clamp_progress(row.progress_pct),
            stage: row.stage,
            params,
            result,
            error_text: row.error_text,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
