use reqwest::{Client, Url};
use std::time::Duration;

use crate::constants::MAX_DOWNLOAD_BYTES;

/// HTTP client for fetching source images.
pub struct ImageDownloader {
    http: Client,
    timeout: Duration,
    max_bytes: usize,
}

impl ImageDownloader {
    pub fn new(timeout: Duration) -> Result<Self, DownloadError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(DownloadError::Http)?;
        Ok(Self {
            http,
            timeout,
            max_bytes: MAX_DOWNLOAD_BYTES,
        })
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Fetch the full body of `url`. Any non-2xx response is an error, as is
    /// a body larger than the configured limit.
    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, DownloadError> {
        let url = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let mut response = self.http.get(url).send().await.map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(DownloadError::TooLarge(self.max_bytes));
            }
        }

        // Content-Length may be absent or wrong; count what actually arrives.
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.classify(e))? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(DownloadError::TooLarge(self.max_bytes));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn classify(&self, err: reqwest::Error) -> DownloadError {
        if err.is_timeout() {
            DownloadError::Timeout(self.timeout)
        } else {
            DownloadError::Http(err)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Request failed with status code {0}")]
    Status(u16),

    #[error("timeout of {}ms exceeded", .0.as_millis())]
    Timeout(Duration),

    #[error("response body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("{0}")]
    Http(#[from] reqwest::Error),
}
