use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{JobStore, StoreError};
use crate::models::job::{JobRecord, JobUpdate};
use crate::models::page::{Page, PageRequest, Pagination};

#[derive(Default)]
struct Inner {
    records: HashMap<String, StoredJob>,
    next_seq: u64,
}

struct StoredJob {
    seq: u64,
    record: JobRecord,
    updates: Vec<JobUpdate>,
}

/// Process-local job store for tests and single-process deployments.
///
/// Keeps every update applied to a record so callers can inspect the
/// exact sequence of status writes.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates applied to `job_id`, oldest first.
    pub async fn updates(&self, job_id: &str) -> Vec<JobUpdate> {
        self.inner
            .read()
            .await
            .records
            .get(job_id)
            .map(|stored| stored.updates.clone())
            .unwrap_or_default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, job_id: &str, image_url: &str) -> Result<JobRecord, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.records.contains_key(job_id) {
            return Err(StoreError::Duplicate(job_id.to_string()));
        }

        let record = JobRecord::pending(job_id, image_url);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            job_id.to_string(),
            StoredJob {
                seq,
                record: record.clone(),
                updates: Vec::new(),
            },
        );
        Ok(record)
    }

    async fn update(&self, job_id: &str, update: &JobUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let stored = inner
            .records
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;

        stored.record.apply(update, Utc::now());
        stored.updates.push(update.clone());
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .records
            .get(job_id)
            .map(|stored| stored.record.clone()))
    }

    async fn list(&self, request: PageRequest) -> Result<Page<JobRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut all: Vec<&StoredJob> = inner.records.values().collect();
        all.sort_by(|a, b| {
            b.record
                .created_at
                .cmp(&a.record.created_at)
                .then(b.seq.cmp(&a.seq))
        });

        let data = all
            .into_iter()
            .skip(request.offset() as usize)
            .take(request.limit as usize)
            .map(|stored| stored.record.clone())
            .collect();

        Ok(Page {
            data,
            pagination: Pagination::new(request, inner.records.len() as u64),
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
