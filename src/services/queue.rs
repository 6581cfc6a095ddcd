//! Durable at-least-once work queue for invitation jobs.
//!
//! Redis layout (all under `vayam:invites`):
//! - `:wait`      list of job ids ready to run
//! - `:active`    zset of claimed job ids scored by their lease deadline (unix ms)
//! - `:delayed`   zset of job ids scored by the unix-ms time they become ready
//! - `:completed` / `:failed` lists of finished job ids, trimmed to retention
//! - `:job:{id}`  hash with `name`, `data`, `opts`, `attempts_made`, `state`
//!   and, while claimed, the `lease` token of the current holder
//!
//! A claim whose lease runs out (crashed or stuck worker) goes back to the
//! head of `:wait` on the next claim, so every job runs at least once.

use async_trait::async_trait;
use redis::{AsyncCommands, Script};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::invite::{InvitationJob, JobOptions};
use crate::services::redis_conn::RedisHandle;

const QUEUE_PREFIX: &str = "vayam:invites";

/// Lease a claimed job for this long before another worker may take it over.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

// KEYS: delayed, wait, active
// ARGV: now ms, lease deadline ms, job key prefix, lease token
const CLAIM_NEXT_LUA: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
  redis.call('HSET', ARGV[3] .. id, 'state', 'waiting')
end
local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', ARGV[1])
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[3], id)
  redis.call('RPUSH', KEYS[2], id)
  redis.call('HSET', ARGV[3] .. id, 'state', 'waiting')
  redis.call('HDEL', ARGV[3] .. id, 'lease')
end
local id = redis.call('RPOP', KEYS[2])
if not id then
  return {'', #due, #expired}
end
redis.call('ZADD', KEYS[3], ARGV[2], id)
redis.call('HSET', ARGV[3] .. id, 'state', 'active', 'lease', ARGV[4])
return {id, #due, #expired}
"#;

// KEYS: active, job hash, destination (finished list, or delayed zset when retrying)
// ARGV: job id, lease token, state, attempts made, failure reason, finished at, retry at ms
const SETTLE_LUA: &str = r#"
if redis.call('HGET', KEYS[2], 'lease') ~= ARGV[2] then
  return 0
end
if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HDEL', KEYS[2], 'lease')
redis.call('HSET', KEYS[2], 'state', ARGV[3], 'attempts_made', ARGV[4])
if ARGV[5] ~= '' then
  redis.call('HSET', KEYS[2], 'failed_reason', ARGV[5])
end
if ARGV[7] ~= '' then
  redis.call('ZADD', KEYS[3], ARGV[7], ARGV[1])
else
  redis.call('HSET', KEYS[2], 'finished_at', ARGV[6])
  redis.call('LPUSH', KEYS[3], ARGV[1])
end
return 1
"#;

const TRIM_FINISHED_LUA: &str = r#"
local keep = tonumber(ARGV[1])
local evicted = redis.call('LRANGE', KEYS[1], keep, -1)
if keep == 0 then
  redis.call('DEL', KEYS[1])
elseif #evicted > 0 then
  redis.call('LTRIM', KEYS[1], 0, keep - 1)
end
for _, id in ipairs(evicted) do
  redis.call('DEL', ARGV[2] .. id)
end
return #evicted
"#;

/// Lifecycle state of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

/// A job handed to exactly one worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub name: String,
    pub data: InvitationJob,
    pub opts: JobOptions,
    /// Failed attempts before the current one.
    pub attempts_made: u32,
    /// Token identifying this claim. Settling with a stale token is refused.
    pub lease: Uuid,
}

impl ClaimedJob {
    /// Whether a failure of the current run exhausts the retry budget.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.opts.attempts
    }
}

/// What the queue did with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { delay: Duration },
    Exhausted,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        name: &str,
        job: &InvitationJob,
        opts: &JobOptions,
    ) -> Result<Uuid, QueueError>;

    /// Claim the next ready job, promoting delayed jobs whose backoff elapsed
    /// and reclaiming jobs whose lease ran out.
    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError>;

    /// Returns [`QueueError::LeaseLost`] if the lease expired and the job was
    /// handed to someone else.
    async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError>;

    /// Record a failed run. Schedules a retry while attempts remain.
    /// Subject to the same lease check as [`JobQueue::complete`].
    async fn fail(&self, job: &ClaimedJob, reason: &str) -> Result<FailOutcome, QueueError>;

    /// Jobs waiting or delayed.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

fn key(suffix: &str) -> String {
    format!("{}:{}", QUEUE_PREFIX, suffix)
}

fn job_key_prefix() -> String {
    key("job:")
}

fn job_key(id: Uuid) -> String {
    format!("{}{}", job_key_prefix(), id)
}

/// Redis-backed job queue.
pub struct RedisJobQueue {
    redis: RedisHandle,
    lease: Duration,
    claim_next: Script,
    settle: Script,
    trim_finished: Script,
}

/// Where a settled job goes next.
enum Settlement<'a> {
    Finished { state: JobState, list: &'a str, keep: usize },
    Retry { ready_at_ms: i64 },
}

impl RedisJobQueue {
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            redis,
            lease: DEFAULT_LEASE,
            claim_next: Script::new(CLAIM_NEXT_LUA),
            settle: Script::new(SETTLE_LUA),
            trim_finished: Script::new(TRIM_FINISHED_LUA),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Release the lease and move the job on, in one script.
    async fn settle(
        &self,
        job: &ClaimedJob,
        attempts_made: u32,
        reason: &str,
        settlement: Settlement<'_>,
    ) -> Result<(), QueueError> {
        let mut conn = self.redis.connection().await?;
        let (state, destination, retry_at) = match &settlement {
            Settlement::Finished { state, list, .. } => (*state, key(list), String::new()),
            Settlement::Retry { ready_at_ms } => {
                (JobState::Delayed, key("delayed"), ready_at_ms.to_string())
            }
        };

        let settled: i64 = self
            .settle
            .key(key("active"))
            .key(job_key(job.id))
            .key(&destination)
            .arg(job.id.to_string())
            .arg(job.lease.to_string())
            .arg(state.to_string())
            .arg(attempts_made)
            .arg(reason)
            .arg(chrono::Utc::now().to_rfc3339())
            .arg(retry_at)
            .invoke_async(&mut conn)
            .await?;
        if settled == 0 {
            return Err(QueueError::LeaseLost(job.id));
        }

        if let Settlement::Finished { keep, .. } = settlement {
            let evicted: i64 = self
                .trim_finished
                .key(&destination)
                .arg(keep)
                .arg(job_key_prefix())
                .invoke_async(&mut conn)
                .await?;
            if evicted > 0 {
                tracing::debug!(list = %destination, evicted, "Trimmed finished job records");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        job: &InvitationJob,
        opts: &JobOptions,
    ) -> Result<Uuid, QueueError> {
        let mut conn = self.redis.connection().await?;
        let id = Uuid::new_v4();
        let fields = [
            ("name", name.to_string()),
            ("data", serde_json::to_string(job)?),
            ("opts", serde_json::to_string(opts)?),
            ("attempts_made", "0".to_string()),
            ("state", JobState::Waiting.to_string()),
            ("created_at", chrono::Utc::now().to_rfc3339()),
        ];

        redis::pipe()
            .atomic()
            .hset_multiple(job_key(id), &fields)
            .ignore()
            .lpush(key("wait"), id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let mut conn = self.redis.connection().await?;
        let now = chrono::Utc::now().timestamp_millis();
        let lease = Uuid::new_v4();

        let (raw_id, promoted, reclaimed): (String, i64, i64) = self
            .claim_next
            .key(key("delayed"))
            .key(key("wait"))
            .key(key("active"))
            .arg(now)
            .arg(now + self.lease.as_millis() as i64)
            .arg(job_key_prefix())
            .arg(lease.to_string())
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            tracing::debug!(promoted, "Promoted delayed jobs");
        }
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Reclaimed jobs whose lease expired");
        }
        if raw_id.is_empty() {
            return Ok(None);
        }

        let id = Uuid::parse_str(&raw_id)
            .map_err(|_| QueueError::Corrupt(format!("invalid job id {}", raw_id)))?;
        let fields: HashMap<String, String> = conn.hgetall(job_key(id)).await?;

        match parse_claimed(id, lease, &fields) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                // Drop the unusable entry so it is not claimed again.
                tracing::warn!(job_id = %id, error = %e, "Discarding malformed job");
                redis::pipe()
                    .atomic()
                    .zrem(key("active"), &raw_id)
                    .ignore()
                    .lpush(key("failed"), &raw_id)
                    .ignore()
                    .hset(job_key(id), "state", JobState::Failed.to_string())
                    .ignore()
                    .hdel(job_key(id), "lease")
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let settlement = Settlement::Finished {
            state: JobState::Completed,
            list: "completed",
            keep: job.opts.retention.completed,
        };
        self.settle(job, job.attempts_made, "", settlement).await
    }

    async fn fail(&self, job: &ClaimedJob, reason: &str) -> Result<FailOutcome, QueueError> {
        let attempts_made = job.attempts_made + 1;

        if attempts_made < job.opts.attempts {
            let delay = job.opts.backoff.delay_for(attempts_made);
            let ready_at_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
            self.settle(job, attempts_made, reason, Settlement::Retry { ready_at_ms })
                .await?;
            return Ok(FailOutcome::Retrying { delay });
        }

        let settlement = Settlement::Finished {
            state: JobState::Failed,
            list: "failed",
            keep: job.opts.retention.failed,
        };
        self.settle(job, attempts_made, reason, settlement).await?;
        Ok(FailOutcome::Exhausted)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.redis.connection().await?;
        let (waiting, delayed): (u64, u64) = redis::pipe()
            .llen(key("wait"))
            .zcard(key("delayed"))
            .query_async(&mut conn)
            .await?;
        Ok(waiting + delayed)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        self.redis.ping().await?;
        Ok(())
    }
}

fn parse_claimed(
    id: Uuid,
    lease: Uuid,
    fields: &HashMap<String, String>,
) -> Result<ClaimedJob, QueueError> {
    let get = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| QueueError::Corrupt(format!("job {} missing {}", id, name)))
    };

    Ok(ClaimedJob {
        id,
        name: get("name")?.clone(),
        data: serde_json::from_str(get("data")?)?,
        opts: serde_json::from_str(get("opts")?)?,
        attempts_made: get("attempts_made")?
            .parse()
            .map_err(|_| QueueError::Corrupt(format!("job {} has bad attempts_made", id)))?,
        lease,
    })
}

struct StoredJob {
    name: String,
    data: InvitationJob,
    opts: JobOptions,
    attempts_made: u32,
    state: JobState,
}

struct Lease {
    token: Uuid,
    deadline: Instant,
}

#[derive(Default)]
struct MemoryQueueState {
    jobs: HashMap<Uuid, StoredJob>,
    wait: VecDeque<Uuid>,
    active: HashMap<Uuid, Lease>,
    delayed: Vec<(Instant, Uuid)>,
    completed: VecDeque<Uuid>,
    failed: VecDeque<Uuid>,
}

impl MemoryQueueState {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;
        for (_, id) in due {
            if let Some(job) = self.jobs.get_mut(&id) {
                job.state = JobState::Waiting;
            }
            self.wait.push_back(id);
        }
    }

    /// Put jobs with lapsed leases back at the head of the wait queue.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<Uuid> = self
            .active
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.active.remove(id);
            if let Some(job) = self.jobs.get_mut(id) {
                job.state = JobState::Waiting;
            }
            self.wait.push_front(*id);
        }
        expired.len()
    }

    /// Drop the caller's lease, refusing if it is no longer the holder.
    fn release(&mut self, job: &ClaimedJob) -> Result<(), QueueError> {
        match self.active.get(&job.id) {
            Some(lease) if lease.token == job.lease => {
                self.active.remove(&job.id);
                Ok(())
            }
            _ => Err(QueueError::LeaseLost(job.id)),
        }
    }

    fn finish(&mut self, id: Uuid, state: JobState, keep: usize) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.state = state;
        }
        let list = match state {
            JobState::Completed => &mut self.completed,
            _ => &mut self.failed,
        };
        list.push_front(id);
        let keep = keep.min(list.len());
        let evicted: Vec<Uuid> = list.drain(keep..).collect();
        for id in evicted {
            self.jobs.remove(&id);
        }
    }
}

/// In-process job queue with the same claim, lease, retry and retention rules
/// as [`RedisJobQueue`]. Not durable.
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    lease: Duration,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            lease: DEFAULT_LEASE,
        }
    }
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// State of a job still retained by the queue.
    pub fn job_state(&self, id: Uuid) -> Option<JobState> {
        self.lock().jobs.get(&id).map(|job| job.state)
    }

    /// Number of retained completed and failed job records.
    pub fn retained(&self) -> (usize, usize) {
        let state = self.lock();
        (state.completed.len(), state.failed.len())
    }

    /// True once nothing is waiting, delayed or claimed.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.wait.is_empty() && state.delayed.is_empty() && state.active.is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        name: &str,
        job: &InvitationJob,
        opts: &JobOptions,
    ) -> Result<Uuid, QueueError> {
        let id = Uuid::new_v4();
        let mut state = self.lock();
        state.jobs.insert(
            id,
            StoredJob {
                name: name.to_string(),
                data: job.clone(),
                opts: *opts,
                attempts_made: 0,
                state: JobState::Waiting,
            },
        );
        state.wait.push_back(id);
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.promote_due(now);
        let reclaimed = state.reclaim_expired(now);
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "Reclaimed jobs whose lease expired");
        }

        let Some(id) = state.wait.pop_front() else {
            return Ok(None);
        };
        let token = Uuid::new_v4();
        state.active.insert(
            id,
            Lease {
                token,
                deadline: now + self.lease,
            },
        );
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| QueueError::Corrupt(format!("job {} has no record", id)))?;
        job.state = JobState::Active;

        Ok(Some(ClaimedJob {
            id,
            name: job.name.clone(),
            data: job.data.clone(),
            opts: job.opts,
            attempts_made: job.attempts_made,
            lease: token,
        }))
    }

    async fn complete(&self, job: &ClaimedJob) -> Result<(), QueueError> {
        let mut state = self.lock();
        state.release(job)?;
        state.finish(job.id, JobState::Completed, job.opts.retention.completed);
        Ok(())
    }

    async fn fail(&self, job: &ClaimedJob, _reason: &str) -> Result<FailOutcome, QueueError> {
        let mut state = self.lock();
        state.release(job)?;
        let attempts_made = job.attempts_made + 1;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| QueueError::Corrupt(format!("job {} has no record", job.id)))?;
        stored.attempts_made = attempts_made;

        if attempts_made < job.opts.attempts {
            let delay = job.opts.backoff.delay_for(attempts_made);
            stored.state = JobState::Delayed;
            state.delayed.push((Instant::now() + delay, job.id));
            return Ok(FailOutcome::Retrying { delay });
        }

        state.finish(job.id, JobState::Failed, job.opts.retention.failed);
        Ok(FailOutcome::Exhausted)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.lock();
        Ok((state.wait.len() + state.delayed.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),

    #[error("Lease on job {0} expired before it was settled")]
    LeaseLost(Uuid),
}
