//! Shared counter store for invitation batches.
//!
//! A batch is a Redis hash holding the counters plus a companion list with
//! the addresses that failed terminally. Both expire after
//! [`BATCH_TTL_SECS`]. Counter mutations run server-side so concurrent
//! workers never lose an update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::batch::{BatchRecord, BATCH_TTL_SECS};
use crate::services::redis_conn::RedisHandle;

const BATCH_KEY_PREFIX: &str = "vayam:batch";

// Returns -1 when the record is gone, -2 when every job is already accounted for.
const RECORD_SUCCESS_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local c = redis.call('HMGET', KEYS[1], 'total', 'completed', 'failed')
if tonumber(c[2]) + tonumber(c[3]) >= tonumber(c[1]) then return -2 end
return redis.call('HINCRBY', KEYS[1], 'completed', 1)
"#;

const RECORD_FAILURE_LUA: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
local c = redis.call('HMGET', KEYS[1], 'total', 'completed', 'failed')
if tonumber(c[2]) + tonumber(c[3]) >= tonumber(c[1]) then return -2 end
local failed = redis.call('HINCRBY', KEYS[1], 'failed', 1)
redis.call('RPUSH', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[2], ARGV[2])
return failed
"#;

/// Result of a counter mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterUpdate {
    /// Counter moved to the contained value.
    Recorded(u64),
    /// Batch record expired or never existed; nothing was written.
    Expired,
    /// `completed + failed` already equals `total`; nothing was written.
    Saturated,
}

impl CounterUpdate {
    fn from_script(value: i64) -> Self {
        match value {
            -1 => CounterUpdate::Expired,
            -2 => CounterUpdate::Saturated,
            n => CounterUpdate::Recorded(n as u64),
        }
    }
}

#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Create a batch of `total` jobs. Empty batches are rejected.
    async fn create(&self, question_id: Uuid, total: u64) -> Result<BatchRecord, BatchStoreError>;

    /// Atomically add one successful send.
    async fn record_success(&self, batch_id: Uuid) -> Result<CounterUpdate, BatchStoreError>;

    /// Atomically add one terminal failure and append the address to the
    /// failed-email list.
    async fn record_failure(
        &self,
        batch_id: Uuid,
        email: &str,
    ) -> Result<CounterUpdate, BatchStoreError>;

    /// `None` when the batch never existed or its TTL elapsed.
    async fn fetch(&self, batch_id: Uuid) -> Result<Option<BatchRecord>, BatchStoreError>;
}

pub fn batch_key(batch_id: Uuid) -> String {
    format!("{}:{}", BATCH_KEY_PREFIX, batch_id)
}

pub fn failed_emails_key(batch_id: Uuid) -> String {
    format!("{}:{}:failed", BATCH_KEY_PREFIX, batch_id)
}

/// Redis-backed batch counters.
pub struct RedisBatchStore {
    redis: RedisHandle,
    record_success: Script,
    record_failure: Script,
}

impl RedisBatchStore {
    pub fn new(redis: RedisHandle) -> Self {
        Self {
            redis,
            record_success: Script::new(RECORD_SUCCESS_LUA),
            record_failure: Script::new(RECORD_FAILURE_LUA),
        }
    }
}

#[async_trait]
impl BatchStore for RedisBatchStore {
    async fn create(&self, question_id: Uuid, total: u64) -> Result<BatchRecord, BatchStoreError> {
        if total == 0 {
            return Err(BatchStoreError::EmptyBatch);
        }

        let record = BatchRecord::new(question_id, total);
        let key = batch_key(record.batch_id);
        let fields = [
            ("batchId", record.batch_id.to_string()),
            ("total", record.total.to_string()),
            ("completed", "0".to_string()),
            ("failed", "0".to_string()),
            ("startedAt", record.started_at.to_rfc3339()),
            ("questionId", record.question_id.to_string()),
        ];

        let mut conn = self.redis.connection().await?;
        redis::pipe()
            .atomic()
            .hset_multiple(&key, &fields)
            .ignore()
            .expire(&key, BATCH_TTL_SECS as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::debug!(batch_id = %record.batch_id, total, "Created invitation batch");
        Ok(record)
    }

    async fn record_success(&self, batch_id: Uuid) -> Result<CounterUpdate, BatchStoreError> {
        let mut conn = self.redis.connection().await?;
        let value: i64 = self
            .record_success
            .key(batch_key(batch_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(CounterUpdate::from_script(value))
    }

    async fn record_failure(
        &self,
        batch_id: Uuid,
        email: &str,
    ) -> Result<CounterUpdate, BatchStoreError> {
        let mut conn = self.redis.connection().await?;
        let value: i64 = self
            .record_failure
            .key(batch_key(batch_id))
            .key(failed_emails_key(batch_id))
            .arg(email)
            .arg(BATCH_TTL_SECS)
            .invoke_async(&mut conn)
            .await?;
        Ok(CounterUpdate::from_script(value))
    }

    async fn fetch(&self, batch_id: Uuid) -> Result<Option<BatchRecord>, BatchStoreError> {
        let mut conn = self.redis.connection().await?;
        let (fields, failed_emails): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(batch_key(batch_id))
            .lrange(failed_emails_key(batch_id), 0, -1)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        parse_record(&fields, failed_emails).map(Some)
    }
}

fn parse_record(
    fields: &HashMap<String, String>,
    failed_emails: Vec<String>,
) -> Result<BatchRecord, BatchStoreError> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> Result<&'a str, BatchStoreError> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| BatchStoreError::Corrupt(format!("missing field {}", name)))
    }
    fn counter(fields: &HashMap<String, String>, name: &str) -> Result<u64, BatchStoreError> {
        field(fields, name)?
            .parse()
            .map_err(|_| BatchStoreError::Corrupt(format!("non-numeric {}", name)))
    }
    fn id(fields: &HashMap<String, String>, name: &str) -> Result<Uuid, BatchStoreError> {
        Uuid::parse_str(field(fields, name)?)
            .map_err(|_| BatchStoreError::Corrupt(format!("invalid {}", name)))
    }

    let started_at = DateTime::parse_from_rfc3339(field(fields, "startedAt")?)
        .map_err(|_| BatchStoreError::Corrupt("invalid startedAt".to_string()))?
        .with_timezone(&Utc);

    Ok(BatchRecord {
        batch_id: id(fields, "batchId")?,
        total: counter(fields, "total")?,
        completed: counter(fields, "completed")?,
        failed: counter(fields, "failed")?,
        failed_emails,
        started_at,
        question_id: id(fields, "questionId")?,
    })
}

/// In-process batch counters with the same expiry and saturation rules as
/// the Redis store. Used by tests and single-process runs.
pub struct MemoryBatchStore {
    ttl: Duration,
    batches: Mutex<HashMap<Uuid, (BatchRecord, Instant)>>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(BATCH_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            batches: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live batch records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|(_, expires_at)| *expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, (BatchRecord, Instant)>> {
        self.batches.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn update(&self, batch_id: Uuid, apply: impl FnOnce(&mut BatchRecord) -> u64) -> CounterUpdate {
        let mut batches = self.lock();
        let now = Instant::now();
        if batches
            .get(&batch_id)
            .is_some_and(|(_, expires_at)| *expires_at <= now)
        {
            batches.remove(&batch_id);
        }

        match batches.get_mut(&batch_id) {
            None => CounterUpdate::Expired,
            Some((record, _)) if record.is_done() => CounterUpdate::Saturated,
            Some((record, _)) => CounterUpdate::Recorded(apply(record)),
        }
    }
}

impl Default for MemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn create(&self, question_id: Uuid, total: u64) -> Result<BatchRecord, BatchStoreError> {
        if total == 0 {
            return Err(BatchStoreError::EmptyBatch);
        }
        let record = BatchRecord::new(question_id, total);
        self.lock()
            .insert(record.batch_id, (record.clone(), Instant::now() + self.ttl));
        Ok(record)
    }

    async fn record_success(&self, batch_id: Uuid) -> Result<CounterUpdate, BatchStoreError> {
        Ok(self.update(batch_id, |record| {
            record.completed += 1;
            record.completed
        }))
    }

    async fn record_failure(
        &self,
        batch_id: Uuid,
        email: &str,
    ) -> Result<CounterUpdate, BatchStoreError> {
        Ok(self.update(batch_id, |record| {
            record.failed += 1;
            record.failed_emails.push(email.to_string());
            record.failed
        }))
    }

    async fn fetch(&self, batch_id: Uuid) -> Result<Option<BatchRecord>, BatchStoreError> {
        let batches = self.lock();
        Ok(batches
            .get(&batch_id)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(record, _)| record.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchStoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Refusing to create a batch with no recipients")]
    EmptyBatch,

    #[error("Corrupt batch record: {0}")]
    Corrupt(String),
}
