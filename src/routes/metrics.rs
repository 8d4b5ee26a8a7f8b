use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the job metrics.
pub fn describe() {
    metrics::describe_counter!("image_jobs_submitted_total", "Jobs accepted by the API");
    metrics::describe_counter!("image_jobs_completed_total", "Jobs that produced an artifact");
    metrics::describe_counter!("image_jobs_failed_total", "Failed processing attempts");
    metrics::describe_histogram!(
        "image_job_processing_seconds",
        "Time to process an image job end to end"
    );
    metrics::describe_gauge!(
        "image_jobs_queue_depth",
        "Jobs waiting or delayed in the queue"
    );
}
