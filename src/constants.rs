//! Tunables shared by the API, the queue and the worker.

use std::time::Duration;

/// Stage timeouts.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest source image body accepted from a download.
pub const MAX_DOWNLOAD_BYTES: usize = 25 * 1024 * 1024;
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Progress checkpoints written at each stage boundary.
pub mod progress {
    pub const PENDING: u8 = 0;
    pub const DOWNLOAD: u8 = 25;
    pub const TRANSFORM: u8 = 50;
    pub const UPLOAD: u8 = 75;
    pub const COMPLETE: u8 = 100;
}

pub mod queue {
    use std::time::Duration;

    pub const DEFAULT_NAME: &str = "imageProcessing";

    /// Total tries per entry, first attempt included.
    pub const RETRY_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(2000);

    pub const COMPLETED_KEEP_COUNT: usize = 100;
    pub const COMPLETED_KEEP_AGE: Duration = Duration::from_secs(24 * 3600);
    pub const FAILED_KEEP_COUNT: usize = 1000;
    pub const FAILED_KEEP_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

    pub const LEASE_DURATION: Duration = Duration::from_secs(30);
    pub const STALLED_CHECK_INTERVAL: Duration = Duration::from_secs(30);
    pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

    /// Transport reconnect backoff (unbounded attempts).
    pub const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);
    pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
}

pub mod pagination {
    pub const DEFAULT_PAGE: u32 = 1;
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;
}

pub mod image {
    pub const MAX_WIDTH: u32 = 1200;
    pub const QUALITY: u8 = 85;
    pub const CONTENT_TYPE: &str = "image/jpeg";
    pub const DEFAULT_BRAND: &str = "coGrader";
    pub const WATERMARK_WIDTH: u32 = 300;
    pub const WATERMARK_HEIGHT: u32 = 50;
}

pub mod storage {
    pub const PROCESSED_FOLDER: &str = "processed";
    pub const FILE_EXTENSION: &str = ".jpg";
}

pub const DEFAULT_WORKER_CONCURRENCY: usize = 5;
