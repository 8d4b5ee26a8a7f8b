//! Durable work queue between the submission API and the worker pool.
//!
//! Entries are keyed by job id, which doubles as the de-duplication key.
//! A worker holds an exclusive, time-bounded lease on an entry while it
//! runs; failures are retried with exponential backoff until the entry's
//! attempt budget is spent, and finished entries are trimmed by the
//! retention policies.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::queue as defaults;

pub mod memory;
pub mod policy;
pub mod redis_backend;
pub mod transport;

pub use memory::MemoryJobQueue;
pub use policy::{RetentionPolicy, RetryPolicy};
pub use redis_backend::RedisJobQueue;

/// Job payload serialized into the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedJob {
    pub job_id: String,
    pub image_url: String,
}

/// An entry leased to a single worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job: QueuedJob,
    /// 1-based try number.
    pub attempt: u32,
    pub token: String,
}

impl Lease {
    pub fn job_id(&self) -> &str {
        &self.job.job_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Added,
    /// An entry with the same job id already exists; nothing was scheduled.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Entry is delayed and will be offered again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Attempt budget spent; entry moved to the failed set.
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Settings common to all backends.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub name: String,
    pub retry: RetryPolicy,
    pub keep_completed: RetentionPolicy,
    pub keep_failed: RetentionPolicy,
    pub lease_duration: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: defaults::DEFAULT_NAME.to_string(),
            retry: RetryPolicy::default(),
            keep_completed: RetentionPolicy::completed(),
            keep_failed: RetentionPolicy::failed(),
            lease_duration: defaults::LEASE_DURATION,
        }
    }
}

impl QueueOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Schedule a job. Idempotent on `job.job_id`.
    async fn enqueue(&self, job: &QueuedJob) -> Result<EnqueueOutcome, QueueError>;

    /// Claim the next ready entry, if any.
    async fn lease(&self) -> Result<Option<Lease>, QueueError>;

    /// Push the lease deadline forward while the entry is still running.
    async fn extend(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Mark a leased entry as completed.
    async fn ack(&self, lease: &Lease) -> Result<(), QueueError>;

    /// Record a failed try; the queue decides whether to retry.
    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError>;

    /// Return entries with expired leases to the waiting list. Yields their job ids.
    async fn reclaim_stalled(&self) -> Result<Vec<String>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<(), QueueError>;

    /// Stop accepting work and release the connection. Active leases are abandoned.
    async fn close(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Queue is closed")]
    Closed,

    #[error("Lease on job {0} is no longer held")]
    LeaseLost(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
