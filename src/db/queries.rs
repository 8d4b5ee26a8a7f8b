use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use super::{JobStore, StoreError};
use crate::models::job::{JobRecord, JobStatus, JobUpdate, ProcessingStep};
use crate::models::page::{Page, PageRequest, Pagination};

const JOB_COLUMNS: &str =
    "job_id, image_url, status, progress, step, error, result_url, created_at, updated_at";

/// Job record store over the `jobs` table.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &PgRow) -> Result<JobRecord, StoreError> {
    let job_id: String = row.try_get("job_id")?;
    let corrupt = |reason: String| StoreError::Corrupt {
        job_id: job_id.clone(),
        reason,
    };

    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|_| corrupt(format!("unknown status '{status_str}'")))?;

    let step = match row.try_get::<Option<String>, _>("step")? {
        Some(s) => Some(
            ProcessingStep::from_str(&s).map_err(|_| corrupt(format!("unknown step '{s}'")))?,
        ),
        None => None,
    };

    let progress: i16 = row.try_get("progress")?;
    let progress =
        u8::try_from(progress).map_err(|_| corrupt(format!("progress out of range: {progress}")))?;

    Ok(JobRecord {
        job_id: job_id.clone(),
        image_url: row.try_get("image_url")?,
        status,
        progress,
        step,
        error: row.try_get("error")?,
        result_url: row.try_get("result_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn create(&self, job_id: &str, image_url: &str) -> Result<JobRecord, StoreError> {
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (job_id, image_url, status, progress)
            VALUES ($1, $2, 'pending', 0)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(image_url)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => row_to_record(&row),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::Duplicate(job_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, job_id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                progress = $3,
                step = CASE WHEN $4 THEN $5 ELSE step END,
                error = CASE WHEN $6 THEN $7 ELSE error END,
                result_url = CASE WHEN $8 THEN $9 ELSE result_url END,
                updated_at = NOW()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(update.status.to_string())
        .bind(i16::from(update.progress))
        .bind(update.step.is_touched())
        .bind(update.step.value().map(|s| s.to_string()))
        .bind(update.error.is_touched())
        .bind(update.error.value().cloned())
        .bind(update.result_url.is_touched())
        .bind(update.result_url.value().cloned())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE job_id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn list(&self, request: PageRequest) -> Result<Page<JobRecord>, StoreError> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM jobs")
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            ORDER BY created_at DESC
            OFFSET $1
            LIMIT $2
            "#
        ))
        .bind(request.offset() as i64)
        .bind(i64::from(request.limit))
        .fetch_all(&self.pool)
        .await?;

        let data = rows.iter().map(row_to_record).collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            data,
            pagination: Pagination::new(request, total.max(0) as u64),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
