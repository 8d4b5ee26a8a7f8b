use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::db::StoreError;

/// Errors surfaced by the HTTP API.
///
/// Rendered as `{ "error": { "code", "message" }, "timestamp" }`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("{0}")]
    QueueUnavailable(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::JobNotFound(_) => StatusCode::NOT_FOUND,
            AppError::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::JobNotFound(_) => "JOB_NOT_FOUND",
            AppError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            AppError::Store(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<garde::Report> for AppError {
    fn from(report: garde::Report) -> Self {
        AppError::Validation(report.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self {
            AppError::Store(err) => {
                tracing::error!(error = %err, "Store error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = json!({
            "error": { "code": self.code(), "message": message },
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        (self.status(), Json(body)).into_response()
    }
}
