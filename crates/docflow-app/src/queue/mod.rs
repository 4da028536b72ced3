//! Durable priority task queue with a sidecar status cache.
//!
//! The broker owns scheduling; the sidecar KV (`task_status:<id>`, 24 h TTL)
//! only caches terminal transitions and is never consulted for dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Task, TaskStatus};

pub mod projection;
mod redis_queue;

pub use redis_queue::RedisQueue;

/// Named queues in strict dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Critical,
    Default,
    Low,
}

impl QueueName {
    pub const ALL: [QueueName; 3] = [QueueName::Critical, QueueName::Default, QueueName::Low];

    /// Priority mapping: 1 is critical, 2 is default, anything else is low.
    pub fn from_priority(priority: u8) -> Self {
        match priority {
            1 => QueueName::Critical,
            2 => QueueName::Default,
            _ => QueueName::Low,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::Critical => "critical",
            QueueName::Default => "default",
            QueueName::Low => "low",
        }
    }

    /// Concurrency share of a 10-slot worker, `{critical: 6, default: 3, low: 1}`.
    pub fn concurrency_share(self, total: usize) -> usize {
        let weight = match self {
            QueueName::Critical => 6,
            QueueName::Default => 3,
            QueueName::Low => 1,
        };
        ((total * weight) / 10).max(1)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(QueueName::Critical),
            "default" => Ok(QueueName::Default),
            "low" => Ok(QueueName::Low),
            other => Err(QueueError::Corrupt(format!("unknown queue `{other}`"))),
        }
    }
}

/// Broker-internal lifecycle of a task envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Scheduled,
    Pending,
    Active,
    Retry,
    Completed,
    Failed,
    Cancelled,
}

impl BrokerState {
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerState::Scheduled => "scheduled",
            BrokerState::Pending => "pending",
            BrokerState::Active => "active",
            BrokerState::Retry => "retry",
            BrokerState::Completed => "completed",
            BrokerState::Failed => "failed",
            BrokerState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BrokerState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(BrokerState::Scheduled),
            "pending" => Ok(BrokerState::Pending),
            "active" => Ok(BrokerState::Active),
            "retry" => Ok(BrokerState::Retry),
            "completed" => Ok(BrokerState::Completed),
            "failed" => Ok(BrokerState::Failed),
            "cancelled" => Ok(BrokerState::Cancelled),
            other => Err(QueueError::Corrupt(format!("unknown broker state `{other}`"))),
        }
    }
}

/// Per-task retry policy: at most `max_retries` attempts, the n-th retry
/// delayed by `n * base_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        debug_assert!(attempt >= 1);
        self.base_delay.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(60),
        }
    }
}

/// A task together with its broker bookkeeping.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub task: Task,
    pub queue: QueueName,
    pub retried: u32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task `{0}` already enqueued")]
    Duplicate(String),

    #[error("task `{0}` not found")]
    NotFound(String),

    #[error("corrupt queue record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Client-facing queue operations. The broker-side consumption API lives on
/// [`RedisQueue`] directly; only the worker touches it.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Admit a task for processing. Rejects duplicate ids.
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError>;

    /// Resolve the current status: sidecar KV first, then a projection of the
    /// broker's internal state (written back opportunistically).
    async fn get_status(&self, task_id: &str) -> Result<TaskStatus, QueueError>;

    /// Remove a pending task. A task already inside a handler is not
    /// interrupted; it must observe cancellation through its own context.
    async fn cancel(&self, task_id: &str) -> Result<(), QueueError>;

    /// Persist a terminal (or initial) status into the sidecar KV.
    async fn save_final(&self, status: &TaskStatus) -> Result<(), QueueError>;
}
