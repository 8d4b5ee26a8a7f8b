use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::AppError;
use crate::models::job::{JobRecord, JobStatus, JobUpdate};
use crate::models::page::{Page, PageRequest};
use crate::models::submission::{CreateJobRequest, CreateJobResponse, ListJobsQuery};
use crate::services::queue::{EnqueueOutcome, QueuedJob};

/// POST /api/jobs — submit an image URL for processing.
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<CreateJobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateJobResponse>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    request.validate()?;

    let job_id = Uuid::new_v4().to_string();
    state.store.create(&job_id, &request.image_url).await?;

    let job = QueuedJob {
        job_id: job_id.clone(),
        image_url: request.image_url,
    };
    match state.queue.enqueue(&job).await {
        Ok(EnqueueOutcome::Added) => {}
        Ok(EnqueueOutcome::Duplicate) => {
            tracing::warn!(job_id = %job_id, "Queue already held an entry for new job");
        }
        Err(err) => {
            let message = format!("Failed to enqueue job: {err}");
            tracing::error!(job_id = %job_id, error = %err, "Failed to enqueue job");
            let update = JobUpdate::failed(&message);
            if let Err(store_err) = state.store.update(&job_id, &update).await {
                tracing::error!(
                    job_id = %job_id,
                    error = %store_err,
                    "Failed to record enqueue failure"
                );
            }
            return Err(AppError::QueueUnavailable(message));
        }
    }

    metrics::counter!("image_jobs_submitted_total").increment(1);
    tracing::info!(job_id = %job_id, image_url = %job.image_url, "Job submitted");

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            status: JobStatus::Pending,
            message: "Job created successfully".to_string(),
        }),
    ))
}

/// GET /api/jobs/{job_id} — current state of one job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    Uuid::parse_str(&job_id)
        .map_err(|_| AppError::Validation(format!("Invalid job ID format: {job_id}")))?;

    let record = state.store.get(&job_id).await?;
    record.map(Json).ok_or(AppError::JobNotFound(job_id))
}

/// GET /api/jobs?page&limit — newest jobs first.
pub async fn list_jobs(
    State(state): State<AppState>,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<Page<JobRecord>>, AppError> {
    let Query(query) = query.map_err(|e| AppError::Validation(e.body_text()))?;
    query.validate()?;

    let page = state
        .store
        .list(PageRequest::new(query.page, query.limit))
        .await?;
    Ok(Json(page))
}
