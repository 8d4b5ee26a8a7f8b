use std::sync::Arc;

use image_jobs::bootstrap;
use image_jobs::config::{AppConfig, QueueBackend, StoreBackend};
use image_jobs::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use image_jobs::routes;
use image_jobs::worker::{log_events, WorkerPool};
use metrics_exporter_prometheus::PrometheusBuilder;

#[tokio::main]
async fn main() {
    bootstrap::init_tracing();

    tracing::info!("Starting image processing worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    if config.queue_backend == QueueBackend::Memory || config.store_backend == StoreBackend::Memory {
        tracing::error!("Standalone worker needs shared backends; use EMBEDDED_WORKER with in-memory ones");
        std::process::exit(2);
    }

    // Metrics are recorded for the process but only exposed by the API server.
    if let Err(err) = PrometheusBuilder::new().install_recorder() {
        tracing::warn!(error = %err, "Failed to install metrics recorder");
    }
    routes::metrics::describe();

    let store = bootstrap::job_store(&config)
        .await
        .expect("Failed to initialize job store");
    let queue = bootstrap::job_queue(&config).expect("Failed to initialize job queue");
    let blobs = bootstrap::blob_store(&config).expect("Failed to initialize blob store");
    let processor =
        bootstrap::processor(&config, store, blobs).expect("Failed to initialize processor");

    let pool = WorkerPool::start(queue, Arc::new(processor), config.pool_config());
    let logger = tokio::spawn(log_events(pool.subscribe()));

    tracing::info!(
        queue = %config.queue_name,
        concurrency = config.worker_concurrency,
        "Worker ready"
    );

    bootstrap::shutdown_signal().await;
    bootstrap::force_exit_after(GRACEFUL_SHUTDOWN_TIMEOUT);

    pool.close().await;
    drop(pool);
    let _ = logger.await;

    tracing::info!("Worker stopped");
}
