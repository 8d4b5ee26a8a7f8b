use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::JobStatus;

/// Request to submit an image for processing.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobRequest {
    #[garde(url, length(min = 1, max = 2048))]
    pub image_url: String,
}

/// Response after submitting an image.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// Query parameters for listing jobs.
#[derive(Debug, Default, Deserialize, Validate)]
pub struct ListJobsQuery {
    #[garde(range(min = 1))]
    pub page: Option<u32>,

    #[garde(range(min = 1, max = 100))]
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_and_garbage_urls() {
        let bad = CreateJobRequest { image_url: "not a url".to_string() };
        assert!(bad.validate().is_err());

        let empty = CreateJobRequest { image_url: String::new() };
        assert!(empty.validate().is_err());

        let good = CreateJobRequest { image_url: "https://example.com/image.png".to_string() };
        assert!(good.validate().is_ok());
    }

    #[test]
    fn list_query_bounds() {
        assert!(ListJobsQuery { page: Some(0), limit: None }.validate().is_err());
        assert!(ListJobsQuery { page: None, limit: Some(101) }.validate().is_err());
        assert!(ListJobsQuery { page: Some(2), limit: Some(100) }.validate().is_ok());
        assert!(ListJobsQuery::default().validate().is_ok());
    }
}
