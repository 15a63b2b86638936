//! Repository for the `jobs` table.
//!
//! Status changes go through guarded `UPDATE ... WHERE status IN (...)`
//! statements, so a transition is one atomic statement and a terminal row
//! can never be rewritten.

use async_trait::async_trait;
use chrono::Utc;
use clipper_core::error::StoreError;
use clipper_core::job::{Job, JobFilter, JobStatus, JobType, JobUpdate};
use clipper_core::job_store::JobStore;
use clipper_core::types::{new_job_id, JobId};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::models::job::JobRow;

/// Column list for `jobs` queries.
const COLUMNS: &str = "\
    id, type, status, progress_pct, stage, \
    params_json, result_json, error_text, \
    created_at, updated_at";

/// Provides CRUD operations for background jobs.
pub struct JobRepo;

impl JobRepo {
    /// Insert a new queued job and return it.
    pub async fn create(
        pool: &SqlitePool,
        job_type: JobType,
        params: &serde_json::Value,
    ) -> Result<Job, StoreError> {
        let job = Job::new(new_job_id(), job_type, params.clone(), Utc::now());
        let params_json = serde_json::to_string(params)?;

        sqlx::query(
            "INSERT INTO jobs \
                 (id, type, status, progress_pct, stage, params_json, \
                  result_json, error_text, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.job_type.as_str())
        .bind(job.status.as_str())
        .bind(i64::from(job.progress_pct))
        .bind(&job.stage)
        .bind(params_json)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(pool)
        .await
        .map_err(StoreError::backend)?;

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job created");
        Ok(job)
    }

    /// Find a job by its ID.
    pub async fn find_by_id(pool: &SqlitePool, id: JobId) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {COLUMNS} FROM jobs WHERE id = ?");
        let row = sqlx::query_as::<_, JobRow>(&query)
            .bind(id.to_string())
            .fetch_optional(pool)
            .await
            .map_err(StoreError::backend)?;
        row.map(Job::try_from).transpose()
    }

    /// Apply a partial update in one guarded statement.
    ///
    /// The `WHERE` clause admits only the statuses from which `update` is
    /// legal. When no row matches, the job is re-read to tell "missing"
    /// apart from "status conflict".
    pub async fn update(
        pool: &SqlitePool,
        id: JobId,
        update: &JobUpdate,
    ) -> Result<Option<Job>, StoreError> {
        let allowed: Vec<JobStatus> = JobStatus::ALL
            .iter()
            .copied()
            .filter(|s| update.permits(*s))
            .collect();

        let rows_affected = if allowed.is_empty() {
            0
        } else {
            let result_json = update.result.as_ref().map(serde_json::to_string).transpose()?;

            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE jobs SET updated_at = ");
            qb.push_bind(Utc::now());
            if let Some(status) = update.status {
                qb.push(", status = ").push_bind(status.as_str());
            }
            if let Some(stage) = &update.stage {
                qb.push(", stage = ").push_bind(stage.clone());
            }
            if let Some(pct) = update.progress_pct {
                qb.push(", progress_pct = ").push_bind(i64::from(pct));
            }
            if let Some(result_json) = result_json {
                qb.push(", result_json = ").push_bind(result_json);
            }
            if let Some(error_text) = &update.error_text {
                qb.push(", error_text = ").push_bind(error_text.clone());
            }
            qb.push(" WHERE id = ").push_bind(id.to_string());
            qb.push(" AND status IN (");
            let mut statuses = qb.separated(", ");
            for status in &allowed {
                statuses.push_bind(status.as_str());
            }
            statuses.push_unseparated(")");

            qb.build()
                .execute(pool)
                .await
                .map_err(StoreError::backend)?
                .rows_affected()
        };

        match Self::find_by_id(pool, id).await? {
            None => Ok(None),
            Some(job) if rows_affected > 0 => Ok(Some(job)),
            Some(job) => Err(StoreError::StatusConflict {
                id,
                current: job.status,
            }),
        }
    }

    /// List jobs newest first with optional status/type filters.
    pub async fn list(pool: &SqlitePool, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM jobs WHERE 1 = 1"));
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(job_type) = filter.job_type {
            qb.push(" AND type = ").push_bind(job_type.as_str());
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(i64::from(filter.effective_limit()))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.effective_offset()));

        let rows = qb
            .build_query_as::<JobRow>()
            .fetch_all(pool)
            .await
            .map_err(StoreError::backend)?;
        rows.into_iter().map(Job::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// JobStore adapter
// ---------------------------------------------------------------------------

/// [`JobStore`] backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(
        &self,
        job_type: JobType,
        params: serde_json::Value,
    ) -> Result<Job, StoreError> {
        JobRepo::create(&self.pool, job_type, &params).await
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        JobRepo::find_by_id(&self.pool, id).await
    }

    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, StoreError> {
        JobRepo::update(&self.pool, id, &update).await
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        JobRepo::list(&self.pool, filter).await
    }
}
