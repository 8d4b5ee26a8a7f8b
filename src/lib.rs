//! Image processing jobs
//!
//! Clients submit an image URL over HTTP; the job is recorded, queued, and
//! picked up by a pool of workers that download, resize, grayscale and
//! watermark the image before uploading it to S3-compatible storage.

pub mod app_state;
pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod worker;

use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use app_state::AppState;

const MAX_BODY_BYTES: usize = 64 * 1024;

/// Build the HTTP API.
pub fn router(state: AppState, metrics: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/jobs",
            get(routes::jobs::list_jobs).post(routes::jobs::create_job),
        )
        .route("/api/jobs/{job_id}", get(routes::jobs::get_job))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(metrics),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}
