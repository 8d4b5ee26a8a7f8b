//! Redis connection handling for the queue.
//!
//! Connection failures are retried here with unbounded exponential
//! backoff. None of this touches a job's attempt counter.

use redis::aio::MultiplexedConnection;
use redis::{RedisError, RedisResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

use super::QueueError;
use crate::constants::queue::{RECONNECT_BASE_DELAY, RECONNECT_MAX_DELAY};

/// Capped exponential delay between reconnect attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: RECONNECT_BASE_DELAY,
            max: RECONNECT_MAX_DELAY,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before reconnect attempt `n` (0-based).
    pub fn delay(&self, n: u32) -> Duration {
        self.base.saturating_mul(1u32 << n.min(16)).min(self.max)
    }
}

/// Errors that mean the connection itself is gone, as opposed to a bad command.
pub fn is_connection_error(err: &RedisError) -> bool {
    err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout()
}

pub struct RedisTransport {
    client: redis::Client,
    /// Held only to read or replace the cached connection.
    conn: Mutex<Option<MultiplexedConnection>>,
    /// Held for the whole of a reconnect, backoff sleeps included.
    reconnect: Mutex<()>,
    backoff: ReconnectBackoff,
    closed_tx: watch::Sender<bool>,
}

impl RedisTransport {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            client,
            conn: Mutex::new(None),
            reconnect: Mutex::new(()),
            backoff: ReconnectBackoff::default(),
            closed_tx,
        })
    }

    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    async fn cached(&self) -> Option<MultiplexedConnection> {
        self.conn.lock().await.clone()
    }

    async fn store(&self, conn: &MultiplexedConnection) {
        *self.conn.lock().await = Some(conn.clone());
    }

    /// One connection attempt. Used on the producer path, where callers
    /// want a prompt `Unavailable` instead of waiting out an outage.
    /// Fails immediately while another caller is reconnecting.
    pub async fn try_connection(&self) -> Result<MultiplexedConnection, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if let Some(conn) = self.cached().await {
            return Ok(conn);
        }

        let Ok(_reconnecting) = self.reconnect.try_lock() else {
            return Err(QueueError::Unavailable(
                "Redis reconnect in progress".to_string(),
            ));
        };

        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                tracing::info!("Redis connected successfully");
                self.store(&conn).await;
                Ok(conn)
            }
            Err(e) => {
                tracing::error!(error = %e, "Redis connection error");
                Err(QueueError::Unavailable(e.to_string()))
            }
        }
    }

    /// Connection that waits through outages, reconnecting with backoff
    /// until it succeeds or the transport is closed.
    pub async fn connection(&self) -> Result<MultiplexedConnection, QueueError> {
        let mut closed_rx = self.closed_tx.subscribe();
        if let Some(conn) = self.cached().await {
            return Ok(conn);
        }

        let _reconnecting = tokio::select! {
            guard = self.reconnect.lock() => guard,
            _ = closed_rx.wait_for(|closed| *closed) => return Err(QueueError::Closed),
        };
        // Another caller may have reconnected while this one waited.
        if let Some(conn) = self.cached().await {
            return Ok(conn);
        }

        let mut attempt: u32 = 0;
        loop {
            if *closed_rx.borrow() {
                return Err(QueueError::Closed);
            }

            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    tracing::info!(attempt, "Redis connected successfully");
                    self.store(&conn).await;
                    return Ok(conn);
                }
                Err(e) => {
                    let delay = self.backoff.delay(attempt);
                    tracing::error!(error = %e, "Redis connection error");
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Redis reconnecting"
                    );
                    attempt = attempt.saturating_add(1);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = closed_rx.changed() => {}
                    }
                }
            }
        }
    }

    /// Drop the cached connection so the next call reconnects.
    pub async fn invalidate(&self) {
        *self.conn.lock().await = None;
    }

    /// Run `op`, reconnecting and retrying for as long as the failure is a
    /// connection failure. Command errors are returned as-is.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T, QueueError>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        loop {
            let conn = self.connection().await?;
            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(e) if is_connection_error(&e) => {
                    tracing::warn!(error = %e, "Redis connection lost, retrying command");
                    self.invalidate().await;
                }
                Err(e) => return Err(QueueError::Redis(e)),
            }
        }
    }

    /// Run `op` on a single connection attempt, mapping connection failures
    /// to [`QueueError::Unavailable`].
    pub async fn run_once<T, F, Fut>(&self, op: F) -> Result<T, QueueError>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        let conn = self.try_connection().await?;
        match op(conn).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_error(&e) => {
                self.invalidate().await;
                Err(QueueError::Unavailable(e.to_string()))
            }
            Err(e) => Err(QueueError::Redis(e)),
        }
    }

    /// Refuse further work and release the connection.
    pub async fn close(&self) {
        self.closed_tx.send_replace(true);
        self.invalidate().await;
    }
}
