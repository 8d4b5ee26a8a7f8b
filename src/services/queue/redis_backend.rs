use async_trait::async_trait;
use chrono::Utc;
use redis::Script;
use uuid::Uuid;

use super::policy::RetentionPolicy;
use super::transport::RedisTransport;
use super::{
    EnqueueOutcome, FailOutcome, JobQueue, Lease, QueueCounts, QueueError, QueueOptions,
    QueuedJob,
};

/// Keys: wait (list, LPUSH in / RPOP out), delayed, active, completed and
/// failed (sorted sets scored by ready-at, lease deadline and finish time,
/// in epoch ms), plus one hash per entry.
struct Keys {
    wait: String,
    delayed: String,
    active: String,
    completed: String,
    failed: String,
    job_prefix: String,
}

impl Keys {
    fn new(queue_name: &str) -> Self {
        let base = format!("image_jobs:{queue_name}");
        Self {
            wait: format!("{base}:wait"),
            delayed: format!("{base}:delayed"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            job_prefix: format!("{base}:job:"),
        }
    }

    fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix, job_id)
    }
}

const ENQUEUE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'attempts', 0, 'max_attempts', ARGV[3],
           'state', 'waiting', 'created_at', ARGV[4])
redis.call('LPUSH', KEYS[2], ARGV[1])
return 1
"#;

const LEASE_LUA: &str = r#"
local now = tonumber(ARGV[1])
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('LPUSH', KEYS[1], id)
  redis.call('HSET', ARGV[4] .. id, 'state', 'waiting')
end
while true do
  local id = redis.call('RPOP', KEYS[1])
  if not id then
    return false
  end
  local key = ARGV[4] .. id
  if redis.call('EXISTS', key) == 1 then
    redis.call('HSET', key, 'state', 'active', 'token', ARGV[3])
    redis.call('ZADD', KEYS[3], now + tonumber(ARGV[2]), id)
    return {id, redis.call('HGET', key, 'data'), tonumber(redis.call('HGET', key, 'attempts'))}
  end
end
"#;

const EXTEND_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] or redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return 0
end
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return 1
"#;

/// Shared by ack and fail: drop finished entries older than the cutoff,
/// then the oldest beyond the count bound.
const TRIM_LUA: &str = r#"
local function trim(set, prefix, cutoff, max_count)
  local removed = 0
  local stale = redis.call('ZRANGEBYSCORE', set, '-inf', '(' .. cutoff)
  for _, id in ipairs(stale) do
    redis.call('ZREM', set, id)
    redis.call('DEL', prefix .. id)
    removed = removed + 1
  end
  local overflow = redis.call('ZCARD', set) - max_count
  if overflow > 0 then
    local oldest = redis.call('ZRANGE', set, 0, overflow - 1)
    for _, id in ipairs(oldest) do
      redis.call('ZREM', set, id)
      redis.call('DEL', prefix .. id)
      removed = removed + 1
    end
  end
  return removed
end
"#;

const ACK_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] or redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return -1
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'state', 'completed', 'token', '', 'finished_at', ARGV[3])
redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
return trim(KEYS[3], ARGV[6], ARGV[4], tonumber(ARGV[5]))
"#;

const FAIL_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'token') ~= ARGV[2] or redis.call('HGET', KEYS[1], 'state') ~= 'active' then
  return {-1, 0}
end
local made = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HSET', KEYS[1], 'token', '', 'error', ARGV[4])
if made < max then
  redis.call('HSET', KEYS[1], 'state', 'delayed')
  redis.call('ZADD', KEYS[3], tonumber(ARGV[3]) + tonumber(ARGV[5]), ARGV[1])
  return {made, 1}
end
redis.call('HSET', KEYS[1], 'state', 'failed', 'finished_at', ARGV[3])
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[1])
trim(KEYS[4], ARGV[8], ARGV[6], tonumber(ARGV[7]))
return {made, 0}
"#;

const RECLAIM_LUA: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for i = #expired, 1, -1 do
  local id = expired[i]
  redis.call('ZREM', KEYS[1], id)
  redis.call('RPUSH', KEYS[2], id)
  redis.call('HSET', ARGV[2] .. id, 'state', 'waiting', 'token', '')
end
return expired
"#;

/// Redis-backed job queue with leasing, retry and retention.
pub struct RedisJobQueue {
    transport: RedisTransport,
    options: QueueOptions,
    keys: Keys,
    enqueue_script: Script,
    lease_script: Script,
    extend_script: Script,
    ack_script: Script,
    fail_script: Script,
    reclaim_script: Script,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, options: QueueOptions) -> Result<Self, QueueError> {
        let transport = RedisTransport::new(redis_url)?;
        Ok(Self::with_transport(transport, options))
    }

    pub fn with_transport(transport: RedisTransport, options: QueueOptions) -> Self {
        let keys = Keys::new(&options.name);
        Self {
            transport,
            options,
            keys,
            enqueue_script: Script::new(ENQUEUE_LUA),
            lease_script: Script::new(LEASE_LUA),
            extend_script: Script::new(EXTEND_LUA),
            ack_script: Script::new(&format!("{TRIM_LUA}\n{ACK_LUA}")),
            fail_script: Script::new(&format!("{TRIM_LUA}\n{FAIL_LUA}")),
            reclaim_script: Script::new(RECLAIM_LUA),
        }
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn cutoff_ms(policy: &RetentionPolicy) -> i64 {
        policy.cutoff(Utc::now()).timestamp_millis()
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<EnqueueOutcome, QueueError> {
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        let job_key = self.keys.job(&job.job_id);
        let wait = &self.keys.wait;
        let script = &self.enqueue_script;
        let max_attempts = self.options.retry.max_attempts;

        let added: i64 = self
            .transport
            .run_once(|mut conn| async move {
                script
                    .key(&job_key)
                    .key(wait)
                    .arg(&job.job_id)
                    .arg(&payload)
                    .arg(max_attempts)
                    .arg(Self::now_ms())
                    .invoke_async(&mut conn)
                    .await
            })
            .await?;

        if added == 1 {
            tracing::info!(job_id = %job.job_id, queue = %self.options.name, "Job added to queue");
            Ok(EnqueueOutcome::Added)
        } else {
            tracing::debug!(job_id = %job.job_id, "Duplicate enqueue ignored");
            Ok(EnqueueOutcome::Duplicate)
        }
    }

    async fn lease(&self) -> Result<Option<Lease>, QueueError> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = self.options.lease_duration.as_millis() as u64;

        let leased: Option<(String, String, u32)> = self
            .transport
            .run(|mut conn| {
                let keys = &self.keys;
                let script = &self.lease_script;
                let token = token.clone();
                async move {
                    script
                        .key(&keys.wait)
                        .key(&keys.delayed)
                        .key(&keys.active)
                        .arg(Self::now_ms())
                        .arg(lease_ms)
                        .arg(token)
                        .arg(&keys.job_prefix)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        match leased {
            Some((_, data, attempts_made)) => {
                let job: QueuedJob = serde_json::from_str(&data).map_err(QueueError::Serialize)?;
                Ok(Some(Lease {
                    job,
                    attempt: attempts_made + 1,
                    token,
                }))
            }
            None => Ok(None),
        }
    }

    async fn extend(&self, lease: &Lease) -> Result<(), QueueError> {
        let job_key = self.keys.job(lease.job_id());
        let deadline = Self::now_ms() + self.options.lease_duration.as_millis() as i64;

        let held: i64 = self
            .transport
            .run(|mut conn| {
                let job_key = &job_key;
                let active = &self.keys.active;
                let script = &self.extend_script;
                async move {
                    script
                        .key(job_key)
                        .key(active)
                        .arg(lease.job_id())
                        .arg(&lease.token)
                        .arg(deadline)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if held == 1 {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(lease.job_id().to_string()))
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<(), QueueError> {
        let job_key = self.keys.job(lease.job_id());
        let retention = self.options.keep_completed;

        let removed: i64 = self
            .transport
            .run(|mut conn| {
                let job_key = &job_key;
                let keys = &self.keys;
                let script = &self.ack_script;
                async move {
                    script
                        .key(job_key)
                        .key(&keys.active)
                        .key(&keys.completed)
                        .arg(lease.job_id())
                        .arg(&lease.token)
                        .arg(Self::now_ms())
                        .arg(Self::cutoff_ms(&retention))
                        .arg(retention.max_count)
                        .arg(&keys.job_prefix)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if removed < 0 {
            return Err(QueueError::LeaseLost(lease.job_id().to_string()));
        }
        if removed > 0 {
            tracing::debug!(removed, "Trimmed completed entries");
        }
        Ok(())
    }

    async fn fail(&self, lease: &Lease, error: &str) -> Result<FailOutcome, QueueError> {
        let job_key = self.keys.job(lease.job_id());
        let retry = self.options.retry;
        let delay = retry.delay_for(lease.attempt);
        let retention = self.options.keep_failed;

        let (made, retrying): (i64, i64) = self
            .transport
            .run(|mut conn| {
                let job_key = &job_key;
                let keys = &self.keys;
                let script = &self.fail_script;
                async move {
                    script
                        .key(job_key)
                        .key(&keys.active)
                        .key(&keys.delayed)
                        .key(&keys.failed)
                        .arg(lease.job_id())
                        .arg(&lease.token)
                        .arg(Self::now_ms())
                        .arg(error)
                        .arg(delay.as_millis() as u64)
                        .arg(Self::cutoff_ms(&retention))
                        .arg(retention.max_count)
                        .arg(&keys.job_prefix)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await?;

        if made < 0 {
            return Err(QueueError::LeaseLost(lease.job_id().to_string()));
        }
        let attempt = made as u32;
        if retrying == 1 {
            Ok(FailOutcome::Retrying {
                attempt,
                delay: retry.delay_for(attempt),
            })
        } else {
            Ok(FailOutcome::Exhausted { attempts: attempt })
        }
    }

    async fn reclaim_stalled(&self) -> Result<Vec<String>, QueueError> {
        self.transport
            .run(|mut conn| {
                let keys = &self.keys;
                let script = &self.reclaim_script;
                async move {
                    script
                        .key(&keys.active)
                        .key(&keys.wait)
                        .arg(Self::now_ms())
                        .arg(&keys.job_prefix)
                        .invoke_async(&mut conn)
                        .await
                }
            })
            .await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) = self
            .transport
            .run(|mut conn| {
                let keys = &self.keys;
                async move {
                    redis::pipe()
                        .llen(&keys.wait)
                        .zcard(&keys.delayed)
                        .zcard(&keys.active)
                        .zcard(&keys.completed)
                        .zcard(&keys.failed)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.transport
            .run_once(|mut conn| async move {
                redis::cmd("PING").query_async::<String>(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn close(&self) {
        self.transport.close().await;
        tracing::info!(queue = %self.options.name, "Queue closed");
    }
}
