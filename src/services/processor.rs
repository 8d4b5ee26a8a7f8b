use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{self, progress, UPLOAD_TIMEOUT};
use crate::db::{JobStore, StoreError};
use crate::models::job::{JobStatus, JobUpdate, ProcessingStep};
use crate::services::download::{DownloadError, ImageDownloader};
use crate::services::queue::QueuedJob;
use crate::services::storage::{BlobStore, StorageError};
use crate::services::transform::{self, TransformError, TransformOptions};
use crate::worker::{HandlerError, JobHandler};

/// Runs one job through download, transform and upload, recording
/// progress on the job record at each stage boundary.
pub struct Processor {
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
    downloader: ImageDownloader,
    options: TransformOptions,
    upload_timeout: Duration,
}

impl Processor {
    pub fn new(
        store: Arc<dyn JobStore>,
        blobs: Arc<dyn BlobStore>,
        downloader: ImageDownloader,
        options: TransformOptions,
    ) -> Self {
        Self {
            store,
            blobs,
            downloader,
            options,
            upload_timeout: UPLOAD_TIMEOUT,
        }
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Process a job and return the public URL of the artifact.
    ///
    /// On failure the record is written FAILED exactly once before the
    /// error is returned, so the queue can decide whether to retry.
    pub async fn process(&self, job_id: &str, image_url: &str) -> Result<String, ProcessingError> {
        let start = Instant::now();
        tracing::info!(job_id = %job_id, image_url = %image_url, "Processing image job");

        match self.run(job_id, image_url).await {
            Ok(url) => {
                let elapsed = start.elapsed();
                metrics::counter!("image_jobs_completed_total").increment(1);
                metrics::histogram!("image_job_processing_seconds").record(elapsed.as_secs_f64());
                tracing::info!(
                    job_id = %job_id,
                    result_url = %url,
                    duration_ms = elapsed.as_millis() as u64,
                    "Image job completed"
                );
                Ok(url)
            }
            Err(err) => {
                metrics::counter!("image_jobs_failed_total").increment(1);
                tracing::error!(job_id = %job_id, error = %err, "Image job failed");

                let update = JobUpdate::failed(err.to_string());
                if let Err(store_err) = self.store.update(job_id, &update).await {
                    tracing::error!(
                        job_id = %job_id,
                        error = %store_err,
                        "Failed to record job failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run(&self, job_id: &str, image_url: &str) -> Result<String, ProcessingError> {
        self.mark(
            job_id,
            JobUpdate::stage(JobStatus::Processing, progress::DOWNLOAD, ProcessingStep::Download),
        )
        .await?;
        let original = self.downloader.fetch(image_url).await?;
        tracing::debug!(job_id = %job_id, bytes = original.len(), "Downloaded source image");

        self.mark(
            job_id,
            JobUpdate::stage(JobStatus::Processing, progress::TRANSFORM, ProcessingStep::Transform),
        )
        .await?;
        let options = self.options.clone();
        let processed =
            match tokio::task::spawn_blocking(move || transform::transform(&original, &options)).await {
                Ok(result) => result?,
                Err(join_err) => return Err(TransformError::Aborted(join_err.to_string()).into()),
            };
        tracing::debug!(job_id = %job_id, bytes = processed.len(), "Transformed image");

        self.mark(
            job_id,
            JobUpdate::stage(JobStatus::Uploading, progress::UPLOAD, ProcessingStep::Upload),
        )
        .await?;
        let key = format!(
            "{}/{}{}",
            constants::storage::PROCESSED_FOLDER,
            job_id,
            constants::storage::FILE_EXTENSION
        );
        tokio::time::timeout(self.upload_timeout, self.upload(job_id, &key, &processed))
            .await
            .map_err(|_| StorageError::Timeout(self.upload_timeout))??;

        let url = self.blobs.public_url(&key);
        self.mark(job_id, JobUpdate::completed(url.clone())).await?;
        Ok(url)
    }

    async fn upload(&self, job_id: &str, key: &str, data: &[u8]) -> Result<(), StorageError> {
        let metadata = vec![
            ("jobId".to_string(), job_id.to_string()),
            ("processedAt".to_string(), Utc::now().to_rfc3339()),
        ];
        self.blobs
            .save(key, data, constants::image::CONTENT_TYPE, &metadata)
            .await?;
        self.blobs.make_public(key).await
    }

    async fn mark(&self, job_id: &str, update: JobUpdate) -> Result<(), ProcessingError> {
        tracing::debug!(
            job_id = %job_id,
            status = %update.status,
            progress = update.progress,
            "Updating job record"
        );
        self.store.update(job_id, &update).await?;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for Processor {
    async fn handle(&self, job: &QueuedJob) -> Result<String, HandlerError> {
        Ok(self.process(&job.job_id, &job.image_url).await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Failed to download image: {0}")]
    Download(#[from] DownloadError),

    #[error("Failed to transform image: {0}")]
    Transform(#[from] TransformError),

    #[error("Failed to upload to storage: {0}")]
    Upload(#[from] StorageError),

    #[error("Failed to update job record: {0}")]
    Store(#[from] StoreError),
}
