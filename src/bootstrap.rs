//! Startup wiring shared by the API server and the worker binary.

use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, ConfigError, QueueBackend, StorageBackend, StoreBackend};
use crate::constants::DOWNLOAD_TIMEOUT;
use crate::db::{self, JobStore, MemoryJobStore, PgJobStore};
use crate::services::download::{DownloadError, ImageDownloader};
use crate::services::processor::Processor;
use crate::services::queue::{JobQueue, MemoryJobQueue, QueueError, RedisJobQueue};
use crate::services::storage::{BlobStore, MemoryBlobStore, S3BlobStore, StorageError};
use crate::services::transform::TransformOptions;

/// Structured JSON logs, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

pub async fn job_store(config: &AppConfig) -> Result<Arc<dyn JobStore>, StartupError> {
    match config.store_backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to PostgreSQL");
            let pool = db::init_pool(config.database_url()?).await?;
            tracing::info!("Running database migrations");
            db::run_migrations(&pool).await?;
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory job store; records are lost on exit");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

pub fn job_queue(config: &AppConfig) -> Result<Arc<dyn JobQueue>, StartupError> {
    let options = config.queue_options();
    match config.queue_backend {
        QueueBackend::Redis => {
            tracing::info!(queue = %options.name, "Connecting to Redis job queue");
            Ok(Arc::new(RedisJobQueue::new(&config.redis_url, options)?))
        }
        QueueBackend::Memory => {
            tracing::warn!(queue = %options.name, "Using in-memory job queue");
            Ok(Arc::new(MemoryJobQueue::new(options)))
        }
    }
}

pub fn blob_store(config: &AppConfig) -> Result<Arc<dyn BlobStore>, StartupError> {
    match config.storage_backend {
        StorageBackend::S3 => {
            let s3 = config.s3()?;
            tracing::info!(bucket = %s3.bucket, endpoint = %s3.endpoint, "Initializing S3 storage client");
            Ok(Arc::new(S3BlobStore::new(
                s3.bucket,
                s3.endpoint,
                s3.region,
                s3.access_key,
                s3.secret_key,
                &config.storage_public_url,
            )?
            .with_public_acl(config.s3_public_acl)))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory blob store");
            Ok(Arc::new(MemoryBlobStore::new(
                config.bucket_name(),
                &config.storage_public_url,
            )))
        }
    }
}

pub fn processor(
    config: &AppConfig,
    store: Arc<dyn JobStore>,
    blobs: Arc<dyn BlobStore>,
) -> Result<Processor, StartupError> {
    Ok(Processor::new(
        store,
        blobs,
        ImageDownloader::new(DOWNLOAD_TIMEOUT)?,
        TransformOptions::with_brand(&config.watermark_brand),
    ))
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

/// Exit the process if graceful shutdown has not finished within `timeout`.
pub fn force_exit_after(timeout: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tracing::error!(timeout_ms = timeout.as_millis() as u64, "Graceful shutdown timed out, forcing exit");
        std::process::exit(1);
    });
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database setup failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue setup failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Storage setup failed: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP client setup failed: {0}")]
    Http(#[from] DownloadError),
}
