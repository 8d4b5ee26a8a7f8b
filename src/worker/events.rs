use tokio::sync::broadcast;

use crate::services::queue::FailOutcome;

/// Lifecycle notifications published by a [`WorkerPool`](super::WorkerPool).
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    Completed {
        job_id: String,
        attempt: u32,
        result_url: String,
    },
    Failed {
        job_id: String,
        attempt: u32,
        error: String,
        outcome: FailOutcome,
    },
    /// Lease expired without a heartbeat; the entry went back to waiting.
    Stalled { job_id: String },
    Error {
        job_id: Option<String>,
        message: String,
    },
}

/// Drain pool events into the log until the pool is dropped.
pub async fn log_events(mut events: broadcast::Receiver<PoolEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event logger fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &PoolEvent) {
    match event {
        PoolEvent::Completed {
            job_id,
            attempt,
            result_url,
        } => {
            tracing::info!(job_id = %job_id, attempt, result_url = %result_url, "Job completed");
        }
        PoolEvent::Failed {
            job_id,
            attempt,
            error,
            outcome: FailOutcome::Retrying { delay, .. },
        } => {
            tracing::warn!(
                job_id = %job_id,
                attempt,
                error = %error,
                retry_in_ms = delay.as_millis() as u64,
                "Job failed, retry scheduled"
            );
        }
        PoolEvent::Failed {
            job_id,
            attempt,
            error,
            outcome: FailOutcome::Exhausted { attempts },
        } => {
            tracing::error!(
                job_id = %job_id,
                attempt,
                attempts,
                error = %error,
                "Job failed permanently"
            );
        }
        PoolEvent::Stalled { job_id } => {
            tracing::warn!(job_id = %job_id, "Job stalled, returned to queue");
        }
        PoolEvent::Error { job_id, message } => {
            tracing::error!(job_id = ?job_id, error = %message, "Worker error");
        }
    }
}
