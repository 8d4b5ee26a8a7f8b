use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    EnqueueOutcome, FailOutcome, JobQueue, Lease, QueueCounts, QueueError, QueueOptions,
    QueuedJob,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Waiting,
    Delayed(Instant),
    Active(Instant),
    Completed,
    Failed,
}

#[derive(Debug)]
struct Entry {
    job: QueuedJob,
    attempts_made: u32,
    state: EntryState,
    token: Option<String>,
    last_error: Option<String>,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    waiting: VecDeque<String>,
    completed: VecDeque<(String, DateTime<Utc>)>,
    failed: VecDeque<(String, DateTime<Utc>)>,
    closed: bool,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let mut due: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                EntryState::Delayed(ready_at) if ready_at <= now => Some((ready_at, id.clone())),
                _ => None,
            })
            .collect();
        due.sort();

        for (_, id) in due {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.state = EntryState::Waiting;
            }
            self.waiting.push_back(id);
        }
    }

    fn held<'a>(&'a mut self, lease: &Lease) -> Result<&'a mut Entry, QueueError> {
        match self.entries.get_mut(lease.job_id()) {
            Some(entry)
                if matches!(entry.state, EntryState::Active(_))
                    && entry.token.as_deref() == Some(lease.token.as_str()) =>
            {
                Ok(entry)
            }
            _ => Err(QueueError::LeaseLost(lease.job_id().to_string())),
        }
    }
}

/// Process-local queue with the same semantics as the Redis backend.
///
/// Deadlines use tokio's clock, so tests can drive backoff and lease
/// expiry with paused time.
pub struct MemoryJobQueue {
    options: QueueOptions,
    state: Mutex<State>,
}

impl MemoryJobQueue {
    pub fn new(options: QueueOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State::default()),
        }
    }

    /// Last recorded failure for a job, if its entry is still retained.
    pub async fn last_error(&self, job_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .entries
            .get(job_id)
            .and_then(|entry| entry.last_error.clone())
    }

    /// Whether an entry for `job_id` is still held (in any state).
    pub async fn contains(&self, job_id: &str) -> bool {
        self.state.lock().await.entries.contains_key(job_id)
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueOptions::default())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }
        if state.entries.contains_key(&job.job_id) {
            tracing::debug!(job_id = %job.job_id, "Duplicate enqueue ignored");
            return Ok(EnqueueOutcome::Duplicate);
        }

        state.entries.insert(
            job.job_id.clone(),
            Entry {
                job: job.clone(),
                attempts_made: 0,
                state: EntryState::Waiting,
                token: None,
                last_error: None,
            },
        );
        state.waiting.push_back(job.job_id.clone());
        Ok(EnqueueOutcome::Added)
    }

    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(QueueError::Closed);
        }

        let now = Instant::now();
        state.promote_due(now);

        let Some(id) = state.waiting.pop_front() else {
            return Ok(None);
        };
        let Some(entry) = state.entries.get_mut(&id) else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        entry.state = EntryState::Active(now + self.options.lease_duration);
        entry.token = Some(token.clone());

        Ok(Some(Lease {
            job: entry.job.clone(),
            attempt: entry.attempts_made + 1,
            token,
        }))
    }

    async fn extend(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.held(lease)?;
        entry.state = EntryState::Active(Instant::now() + self.options.lease_duration);
        Ok(())
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.held(lease)?;
        entry.state = EntryState::Completed;
        entry.token = None;

        let now = Utc::now();
        state.completed.push_back((lease.job_id().to_string(), now));
        let evicted = self.options.keep_completed.evict(&mut state.completed, now);
        for id in evicted {
            state.entries.remove(&id);
        }
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError> {
        let mut state = self.state.lock().await;
        let entry = state.held(lease)?;
        entry.attempts_made += 1;
        entry.token = None;
        entry.last_error = Some(error.to_string());
        let attempt = entry.attempts_made;

        match self.options.retry.next_delay(attempt) {
            Some(delay) => {
                entry.state = EntryState::Delayed(Instant::now() + delay);
                Ok(FailOutcome::Retrying { attempt, delay })
            }
            None => {
                entry.state = EntryState::Failed;
                let now = Utc::now();
                state.failed.push_back((lease.job_id().to_string(), now));
                let evicted = self.options.keep_failed.evict(&mut state.failed, now);
                for id in evicted {
                    state.entries.remove(&id);
                }
                Ok(FailOutcome::Exhausted { attempts: attempt })
            }
        }
    }

    async fn reclaim_stalled(&self) -> Result<Vec<String>, QueueError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        let mut stalled: Vec<(Instant, String)> = state
            .entries
            .iter()
            .filter_map(|(id, entry)| match entry.state {
                EntryState::Active(deadline) if deadline <= now => Some((deadline, id.clone())),
                _ => None,
            })
            .collect();
        stalled.sort();

        // Front of the line, oldest deadline first.
        for (_, id) in stalled.iter().rev() {
            if let Some(entry) = state.entries.get_mut(id) {
                entry.state = EntryState::Waiting;
                entry.token = None;
            }
            state.waiting.push_front(id.clone());
        }

        Ok(stalled.into_iter().map(|(_, id)| id).collect())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for entry in state.entries.values() {
            match entry.state {
                EntryState::Waiting => counts.waiting += 1,
                EntryState::Delayed(_) => counts.delayed += 1,
                EntryState::Active(_) => counts.active += 1,
                EntryState::Completed => counts.completed += 1,
                EntryState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        if self.state.lock().await.closed {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().await.closed = true;
        tracing::info!(queue = %self.options.name, "Queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::queue::{RetentionPolicy, RetryPolicy};
    use std::time::Duration;

    fn job(id: &str) -> QueuedJob {
        QueuedJob {
            job_id: id.to_string(),
            image_url: format!("https://example.com/{id}.png"),
        }
    }

    #[tokio::test]
    async fn leases_in_fifo_order() {
        let queue = MemoryJobQueue::default();
        queue.enqueue(&job("a")).await.unwrap();
        queue.enqueue(&job("b")).await.unwrap();

        let first = queue.lease().await.unwrap().unwrap();
        let second = queue.lease().await.unwrap().unwrap();
        assert_eq!(first.job_id(), "a");
        assert_eq!(second.job_id(), "b");
        assert_eq!(first.attempt, 1);
        assert!(queue.lease().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_ignored_while_outstanding() {
        let queue = MemoryJobQueue::default();
        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), EnqueueOutcome::Added);
        let lease = queue.lease().await.unwrap().unwrap();

        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), EnqueueOutcome::Duplicate);
        assert!(queue.lease().await.unwrap().is_none());

        queue.ack(&lease).await.unwrap();
        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), EnqueueOutcome::Duplicate);
        assert_eq!(queue.counts().await.unwrap().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_then_exhaust() {
        let queue = MemoryJobQueue::default();
        queue.enqueue(&job("a")).await.unwrap();

        let lease = queue.lease().await.unwrap().unwrap();
        let outcome = queue.fail(&lease, "boom").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying { attempt: 1, delay: Duration::from_millis(2000) }
        );

        // Not offered before the backoff elapses.
        tokio::time::advance(Duration::from_millis(1999)).await;
        assert!(queue.lease().await.unwrap().is_none());
        tokio::time::advance(Duration::from_millis(1)).await;
        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 2);

        let outcome = queue.fail(&lease, "boom").await.unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying { attempt: 2, delay: Duration::from_millis(4000) }
        );

        tokio::time::advance(Duration::from_millis(4000)).await;
        let lease = queue.lease().await.unwrap().unwrap();
        assert_eq!(lease.attempt, 3);
        let outcome = queue.fail(&lease, "still broken").await.unwrap();
        assert_eq!(outcome, FailOutcome::Exhausted { attempts: 3 });

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(queue.lease().await.unwrap().is_none());
        assert_eq!(queue.counts().await.unwrap().failed, 1);
        assert_eq!(queue.last_error("a").await.as_deref(), Some("still broken"));
    }

    #[tokio::test(start_paused = true)]
    async fn four_try_budget_observes_full_schedule() {
        let queue = MemoryJobQueue::new(QueueOptions {
            retry: RetryPolicy { max_attempts: 4, ..RetryPolicy::default() },
            ..QueueOptions::default()
        });
        queue.enqueue(&job("a")).await.unwrap();

        let mut delays = Vec::new();
        loop {
            let lease = loop {
                if let Some(lease) = queue.lease().await.unwrap() {
                    break lease;
                }
                tokio::time::advance(Duration::from_millis(100)).await;
            };
            match queue.fail(&lease, "boom").await.unwrap() {
                FailOutcome::Retrying { delay, .. } => delays.push(delay.as_millis()),
                FailOutcome::Exhausted { attempts } => {
                    assert_eq!(attempts, 4);
                    break;
                }
            }
        }
        assert_eq!(delays, vec![2000, 4000, 8000]);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reclaimed_without_spending_an_attempt() {
        let queue = MemoryJobQueue::default();
        queue.enqueue(&job("a")).await.unwrap();
        let stale = queue.lease().await.unwrap().unwrap();

        assert!(queue.reclaim_stalled().await.unwrap().is_empty());
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(queue.reclaim_stalled().await.unwrap(), vec!["a".to_string()]);

        let fresh = queue.lease().await.unwrap().unwrap();
        assert_eq!(fresh.attempt, 1);
        assert_ne!(fresh.token, stale.token);

        // The original holder lost its claim.
        assert!(matches!(queue.ack(&stale).await, Err(QueueError::LeaseLost(_))));
        queue.ack(&fresh).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn extend_keeps_a_long_lease_alive() {
        let queue = MemoryJobQueue::default();
        queue.enqueue(&job("a")).await.unwrap();
        let lease = queue.lease().await.unwrap().unwrap();

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            queue.extend(&lease).await.unwrap();
            assert!(queue.reclaim_stalled().await.unwrap().is_empty());
        }
        queue.ack(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn completed_entries_are_trimmed_to_retention() {
        let queue = MemoryJobQueue::new(QueueOptions {
            keep_completed: RetentionPolicy { max_count: 2, max_age: Duration::from_secs(3600) },
            ..QueueOptions::default()
        });
        for id in ["a", "b", "c"] {
            queue.enqueue(&job(id)).await.unwrap();
            let lease = queue.lease().await.unwrap().unwrap();
            queue.ack(&lease).await.unwrap();
        }

        assert!(!queue.contains("a").await);
        assert!(queue.contains("b").await);
        assert_eq!(queue.counts().await.unwrap().completed, 2);
        // Evicted ids can be submitted again.
        assert_eq!(queue.enqueue(&job("a")).await.unwrap(), EnqueueOutcome::Added);
    }

    #[tokio::test]
    async fn close_rejects_new_work() {
        let queue = MemoryJobQueue::default();
        queue.enqueue(&job("a")).await.unwrap();
        let _abandoned = queue.lease().await.unwrap().unwrap();

        queue.close().await;
        assert!(matches!(queue.enqueue(&job("b")).await, Err(QueueError::Closed)));
        assert!(matches!(queue.lease().await, Err(QueueError::Closed)));
    }
}
