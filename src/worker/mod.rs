//! Bounded pool of job executors fed from a [`JobQueue`].
//!
//! A single dispatcher task holds one semaphore permit per in-flight job
//! and only leases from the queue when a permit is free. Every job runs in
//! its own task so a panicking handler is reported as a failed attempt
//! instead of taking the pool down.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::constants::{queue as defaults, DEFAULT_WORKER_CONCURRENCY};
use crate::services::queue::{JobQueue, Lease, QueueError, QueuedJob};

mod events;

pub use events::{log_events, PoolEvent};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

const EVENT_CAPACITY: usize = 256;
const PANIC_MESSAGE: &str = "job handler panicked";

/// Work executed for each leased job. Returns the result URL.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &QueuedJob) -> Result<String, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    /// Idle wait when the queue is empty or unreachable.
    pub poll_interval: Duration,
    pub stalled_interval: Duration,
    /// Must match the queue's lease duration; heartbeats go out at half of it.
    pub lease_duration: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            poll_interval: defaults::POLL_INTERVAL,
            stalled_interval: defaults::STALLED_CHECK_INTERVAL,
            lease_duration: defaults::LEASE_DURATION,
        }
    }
}

impl PoolConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PoolState {
    Running,
    Closing,
    Closed,
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    events: broadcast::Sender<PoolEvent>,
    state: watch::Sender<PoolState>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, config: PoolConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(PoolState::Running);
        let (shutdown, _) = watch::channel(false);
        let concurrency = config.concurrency.max(1);

        let dispatcher = tokio::spawn(dispatch(
            queue.clone(),
            handler,
            PoolConfig {
                concurrency,
                ..config.clone()
            },
            events.clone(),
            shutdown.subscribe(),
        ));
        let stall_checker = tokio::spawn(check_stalled(
            queue.clone(),
            config.stalled_interval,
            events.clone(),
            shutdown.subscribe(),
        ));

        tracing::info!(concurrency, "Worker pool started");

        Self {
            queue,
            events,
            state,
            shutdown,
            tasks: Mutex::new(vec![dispatcher, stall_checker]),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    /// Stop leasing, wait for in-flight jobs, then close the queue.
    /// Safe to call more than once; later callers wait for the first.
    pub async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        if tasks.is_empty() {
            let mut state = self.state.subscribe();
            let _ = state.wait_for(|s| *s == PoolState::Closed).await;
            return;
        }

        self.state.send_replace(PoolState::Closing);
        self.shutdown.send_replace(true);
        tracing::info!("Worker pool closing, waiting for active jobs");

        for task in tasks {
            if let Err(err) = task.await {
                tracing::error!(error = %err, "Worker pool task ended abnormally");
            }
        }

        self.queue.close().await;
        self.state.send_replace(PoolState::Closed);
        tracing::info!("Worker pool closed");
    }
}

/// Resolves once shutdown has been requested or the pool is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn dispatch(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    config: PoolConfig,
    events: broadcast::Sender<PoolEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let permits = Arc::new(Semaphore::new(config.concurrency));
    let mut running = JoinSet::new();

    loop {
        while running.try_join_next().is_some() {}

        let permit = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        // A lease abandoned here is picked up again by the stall check.
        let leased = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            leased = queue.lease() => leased,
        };

        match leased {
            Ok(Some(lease)) => {
                tracing::debug!(job_id = %lease.job_id(), attempt = lease.attempt, "Leased job");
                running.spawn(execute(
                    queue.clone(),
                    handler.clone(),
                    lease,
                    config.lease_duration,
                    events.clone(),
                    permit,
                ));
                continue;
            }
            Ok(None) => drop(permit),
            Err(QueueError::Closed) => break,
            Err(err) => {
                drop(permit);
                let _ = events.send(PoolEvent::Error {
                    job_id: None,
                    message: format!("Failed to lease job: {err}"),
                });
            }
        }

        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = tokio::time::sleep(config.poll_interval) => {}
        }
    }

    while running.join_next().await.is_some() {}
}

async fn execute(
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    lease: Lease,
    lease_duration: Duration,
    events: broadcast::Sender<PoolEvent>,
    _permit: OwnedSemaphorePermit,
) {
    let job = lease.job.clone();
    let mut run = tokio::spawn(async move { handler.handle(&job).await });

    let period = (lease_duration / 2).max(Duration::from_millis(1));
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    let outcome = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = heartbeat.tick() => {
                if let Err(err) = queue.extend(&lease).await {
                    tracing::warn!(job_id = %lease.job_id(), error = %err, "Failed to extend lease");
                }
            }
        }
    };

    match outcome {
        Ok(Ok(result_url)) => match queue.ack(&lease).await {
            Ok(()) => {
                let _ = events.send(PoolEvent::Completed {
                    job_id: lease.job_id().to_string(),
                    attempt: lease.attempt,
                    result_url,
                });
            }
            Err(err) => {
                let _ = events.send(PoolEvent::Error {
                    job_id: Some(lease.job_id().to_string()),
                    message: format!("Failed to acknowledge job: {err}"),
                });
            }
        },
        Ok(Err(err)) => record_failure(&*queue, &lease, &err.to_string(), &events).await,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                PANIC_MESSAGE.to_string()
            } else {
                format!("job handler aborted: {join_err}")
            };
            record_failure(&*queue, &lease, &message, &events).await;
        }
    }
}

async fn record_failure(
    queue: &dyn JobQueue,
    lease: &Lease,
    error: &str,
    events: &broadcast::Sender<PoolEvent>,
) {
    let event = match queue.fail(lease, error).await {
        Ok(outcome) => PoolEvent::Failed {
            job_id: lease.job_id().to_string(),
            attempt: lease.attempt,
            error: error.to_string(),
            outcome,
        },
        Err(err) => PoolEvent::Error {
            job_id: Some(lease.job_id().to_string()),
            message: format!("Failed to record job failure: {err}"),
        },
    };
    let _ = events.send(event);
}

async fn check_stalled(
    queue: Arc<dyn JobQueue>,
    interval: Duration,
    events: broadcast::Sender<PoolEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));

    loop {
        tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let reclaimed = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            reclaimed = queue.reclaim_stalled() => reclaimed,
        };

        match reclaimed {
            Ok(stalled) => {
                for job_id in stalled {
                    let _ = events.send(PoolEvent::Stalled { job_id });
                }
            }
            Err(QueueError::Closed) => break,
            Err(err) => {
                let _ = events.send(PoolEvent::Error {
                    job_id: None,
                    message: format!("Stalled job check failed: {err}"),
                });
            }
        }

        let counts = tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown) => break,
            counts = queue.counts() => counts,
        };
        if let Ok(counts) = counts {
            metrics::gauge!("image_jobs_queue_depth").set((counts.waiting + counts.delayed) as f64);
        }
    }
}
