//! Redis-backed broker: per-priority pending lists, scheduled/retry sorted
//! sets, task envelopes in hashes, and the `task_status:<id>` sidecar cache.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::config::QueueConfig;
use crate::model::{Task, TaskState, TaskStatus};

use super::{
    projection, BrokerState, QueueError, QueueName, RetryPolicy, TaskEnvelope, TaskQueue,
};

/// Delay before a freshly enqueued task becomes visible, giving the intake
/// transaction time to settle.
const PROCESS_DEFER_MS: i64 = 1_000;
/// Sidecar status TTL.
const STATUS_TTL_SECS: u64 = 24 * 60 * 60;
/// How long a pop blocks before yielding to the worker loop.
const POP_BLOCK_SECS: f64 = 1.0;
/// Upper bound on promotions per sweep.
const PROMOTE_BATCH: isize = 128;

const FIELD_PAYLOAD: &str = "payload";
const FIELD_QUEUE: &str = "queue";
const FIELD_STATE: &str = "state";
const FIELD_RETRIED: &str = "retried";
const FIELD_LAST_ERR: &str = "last_err";
const FIELD_RESULT: &str = "result";
const FIELD_ENQUEUED_AT: &str = "enqueued_at";

#[derive(Debug, Clone)]
pub(crate) struct StoredTask {
    pub envelope: TaskEnvelope,
    pub state: BrokerState,
}

/// Process-wide queue client. `ConnectionManager` multiplexes and reconnects,
/// so clones are cheap and shared freely across tasks.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    namespace: String,
    retry: RetryPolicy,
}

impl RedisQueue {
    pub async fn connect(cfg: &QueueConfig) -> Result<Self, QueueError> {
        let client = redis::Client::open(cfg.redis_url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            namespace: cfg.namespace.clone(),
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                base_delay: std::time::Duration::from_secs(cfg.retry_delay_secs),
            },
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn task_key(&self, task_id: &str) -> String {
        format!("{}:task:{task_id}", self.namespace)
    }

    fn pending_key(&self, queue: QueueName) -> String {
        format!("{}:queue:{queue}", self.namespace)
    }

    fn scheduled_key(&self) -> String {
        format!("{}:scheduled", self.namespace)
    }

    fn retry_key(&self) -> String {
        format!("{}:retry", self.namespace)
    }

    fn status_key(task_id: &str) -> String {
        format!("task_status:{task_id}")
    }

    async fn load_stored(&self, task_id: &str) -> Result<Option<StoredTask>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(self.task_key(task_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let payload = fields
            .get(FIELD_PAYLOAD)
            .ok_or_else(|| QueueError::Corrupt(format!("task `{task_id}` has no payload")))?;
        let task: Task = serde_json::from_str(payload)?;

        let queue = fields
            .get(FIELD_QUEUE)
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or(QueueName::Default);
        let state = fields
            .get(FIELD_STATE)
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or(BrokerState::Pending);
        let retried = fields
            .get(FIELD_RETRIED)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let last_error = fields.get(FIELD_LAST_ERR).cloned().filter(|e| !e.is_empty());
        let enqueued_at = fields
            .get(FIELD_ENQUEUED_AT)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Ok(Some(StoredTask {
            envelope: TaskEnvelope {
                task,
                queue,
                retried,
                last_error,
                enqueued_at,
            },
            state,
        }))
    }

    async fn set_state(&self, task_id: &str, state: BrokerState) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(self.task_key(task_id), FIELD_STATE, state.as_str()).await?;
        Ok(())
    }

    /// Move due members of the scheduled and retry sets into their pending
    /// lists. Called periodically by the worker; losing a race with `cancel`
    /// simply skips the member.
    pub async fn promote_due(&self) -> Result<usize, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.conn.clone();
        let mut promoted = 0usize;

        for zset in [self.scheduled_key(), self.retry_key()] {
            let due: Vec<String> = conn
                .zrangebyscore_limit(&zset, "-inf", now_ms, 0, PROMOTE_BATCH)
                .await?;
            for task_id in due {
                let removed: i64 = conn.zrem(&zset, &task_id).await?;
                if removed == 0 {
                    continue;
                }
                let queue: Option<String> = conn.hget(self.task_key(&task_id), FIELD_QUEUE).await?;
                let queue = queue
                    .as_deref()
                    .and_then(|raw| raw.parse().ok())
                    .unwrap_or(QueueName::Default);
                let _: () = conn.lpush(self.pending_key(queue), &task_id).await?;
                self.set_state(&task_id, BrokerState::Pending).await?;
                promoted += 1;
            }
        }

        Ok(promoted)
    }

    /// Pop the next ready task from the given queues, blocking briefly.
    /// Key order encodes dispatch priority: the first non-empty queue wins.
    pub async fn pop(&self, queues: &[QueueName]) -> Result<Option<TaskEnvelope>, QueueError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let keys: Vec<String> = queues.iter().map(|q| self.pending_key(*q)).collect();
        let mut conn = self.conn.clone();
        let popped: Option<(String, String)> = conn.brpop(keys, POP_BLOCK_SECS).await?;
        let Some((_, task_id)) = popped else {
            return Ok(None);
        };

        let Some(stored) = self.load_stored(&task_id).await? else {
            tracing::warn!(%task_id, "popped id without envelope; dropping");
            return Ok(None);
        };
        self.set_state(&task_id, BrokerState::Active).await?;
        Ok(Some(stored.envelope))
    }

    /// Write a progress beacon into the envelope's result field.
    pub async fn write_beacon(&self, task_id: &str, beacon: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(self.task_key(task_id), FIELD_RESULT, beacon).await?;
        Ok(())
    }

    /// Mark a handler success.
    pub async fn complete(&self, task_id: &str) -> Result<(), QueueError> {
        self.set_state(task_id, BrokerState::Completed).await
    }

    /// Record a handler failure: reschedule with linear backoff while retries
    /// remain, otherwise mark the task failed and persist the terminal status.
    /// Returns `true` when the task was rescheduled.
    pub async fn fail_or_retry(
        &self,
        envelope: &TaskEnvelope,
        error: &str,
    ) -> Result<bool, QueueError> {
        let task_id = &envelope.task.id;
        let attempt = envelope.retried + 1;
        let mut conn = self.conn.clone();

        if attempt <= self.retry.max_retries {
            let delay = self.retry.delay_for(attempt);
            let retry_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            let _: () = conn
                .hset_multiple(
                    self.task_key(task_id),
                    &[
                        (FIELD_STATE, BrokerState::Retry.as_str().to_string()),
                        (FIELD_RETRIED, attempt.to_string()),
                        (FIELD_LAST_ERR, error.to_string()),
                    ],
                )
                .await?;
            let _: () = conn.zadd(self.retry_key(), task_id, retry_at).await?;
            tracing::info!(%task_id, attempt, delay_secs = delay.as_secs(), "task rescheduled");
            return Ok(true);
        }

        let _: () = conn
            .hset_multiple(
                self.task_key(task_id),
                &[
                    (FIELD_STATE, BrokerState::Failed.as_str().to_string()),
                    (FIELD_LAST_ERR, error.to_string()),
                ],
            )
            .await?;
        self.save_final(&TaskStatus::terminal(
            task_id.clone(),
            TaskState::Failed,
            envelope.enqueued_at,
            Some(error.to_string()),
        ))
        .await?;
        tracing::error!(%task_id, error, "task failed after exhausting retries");
        Ok(false)
    }
}

#[async_trait]
impl TaskQueue for RedisQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let payload = serde_json::to_string(task)?;
        let key = self.task_key(&task.id);
        let mut conn = self.conn.clone();

        let created: bool = conn.hset_nx(&key, FIELD_PAYLOAD, &payload).await?;
        if !created {
            return Err(QueueError::Duplicate(task.id.clone()));
        }

        let queue = QueueName::from_priority(task.priority);
        let _: () = conn
            .hset_multiple(
                &key,
                &[
                    (FIELD_QUEUE, queue.as_str().to_string()),
                    (FIELD_STATE, BrokerState::Scheduled.as_str().to_string()),
                    (FIELD_RETRIED, "0".to_string()),
                    (FIELD_ENQUEUED_AT, Utc::now().to_rfc3339()),
                ],
            )
            .await?;

        let ready_at = Utc::now().timestamp_millis() + PROCESS_DEFER_MS;
        let _: () = conn.zadd(self.scheduled_key(), &task.id, ready_at).await?;

        tracing::info!(task_id = %task.id, queue = %queue, "task enqueued");
        Ok(())
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn.get(Self::status_key(task_id)).await?;
        if let Some(raw) = cached {
            return Ok(serde_json::from_str(&raw)?);
        }

        let stored = self
            .load_stored(task_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))?;

        let status = projection::project(
            task_id,
            stored.state,
            stored.envelope.last_error.as_deref(),
            stored.envelope.enqueued_at,
        );

        // Cache write-back is opportunistic; a miss next time re-projects.
        if let Err(err) = self.save_final(&status).await {
            tracing::warn!(%task_id, %err, "failed to cache projected status");
        }

        Ok(status)
    }

    async fn cancel(&self, task_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let mut removed: i64 = 0;

        for queue in QueueName::ALL {
            let count: i64 = conn.lrem(self.pending_key(queue), 0, task_id).await?;
            removed += count;
        }
        let from_scheduled: i64 = conn.zrem(self.scheduled_key(), task_id).await?;
        let from_retry: i64 = conn.zrem(self.retry_key(), task_id).await?;
        removed += from_scheduled + from_retry;

        if removed == 0 {
            // Active or unknown: an in-flight handler is never preempted here.
            return Err(QueueError::NotFound(task_id.to_string()));
        }

        let enqueued_at = self
            .load_stored(task_id)
            .await?
            .map(|stored| stored.envelope.enqueued_at)
            .unwrap_or_else(Utc::now);

        self.set_state(task_id, BrokerState::Cancelled).await?;
        self.save_final(&TaskStatus::terminal(
            task_id.to_string(),
            TaskState::Cancelled,
            enqueued_at,
            None,
        ))
        .await?;

        tracing::info!(%task_id, "task cancelled");
        Ok(())
    }

    async fn save_final(&self, status: &TaskStatus) -> Result<(), QueueError> {
        let raw = serde_json::to_string(status)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::status_key(&status.task_id), raw, STATUS_TTL_SECS)
            .await?;
        Ok(())
    }
}
