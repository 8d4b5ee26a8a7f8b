use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;

use image_jobs::app_state::AppState;
use image_jobs::bootstrap;
use image_jobs::config::{AppConfig, QueueBackend};
use image_jobs::constants::GRACEFUL_SHUTDOWN_TIMEOUT;
use image_jobs::routes;
use image_jobs::worker::{log_events, WorkerPool};

#[tokio::main]
async fn main() {
    bootstrap::init_tracing();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing image-jobs API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    routes::metrics::describe();

    let store = bootstrap::job_store(&config)
        .await
        .expect("Failed to initialize job store");
    let queue = bootstrap::job_queue(&config).expect("Failed to initialize job queue");

    let pool = if config.embedded_worker {
        let blobs = bootstrap::blob_store(&config).expect("Failed to initialize blob store");
        let processor = bootstrap::processor(&config, store.clone(), blobs)
            .expect("Failed to initialize processor");
        let pool = WorkerPool::start(queue.clone(), Arc::new(processor), config.pool_config());
        tokio::spawn(log_events(pool.subscribe()));
        Some(pool)
    } else {
        if config.queue_backend == QueueBackend::Memory {
            tracing::warn!("In-memory queue without EMBEDDED_WORKER: submitted jobs will never run");
        }
        None
    };

    let state = AppState::new(store, queue.clone());
    let app = image_jobs::router(state, Arc::new(prometheus_handle));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            bootstrap::shutdown_signal().await;
            bootstrap::force_exit_after(GRACEFUL_SHUTDOWN_TIMEOUT);
        })
        .await
        .expect("Server error");

    match pool {
        Some(pool) => pool.close().await,
        None => queue.close().await,
    }

    tracing::info!("Server stopped");
}
