//! Pure projection of broker-internal state onto the canonical status set.
//!
//! Used only on a sidecar-KV miss; the result is written back as a cache
//! entry, never fed back into scheduling.

use chrono::{DateTime, Utc};

use crate::model::{TaskState, TaskStatus};

use super::BrokerState;

/// Map a broker envelope to a client-visible status.
///
/// `pending -> pending`, `active -> running`, `completed -> completed`
/// (progress forced to 1.0), `retry -> failed` surfacing the last handler
/// error. Scheduled tasks have not been picked up yet and read as pending.
pub fn project(
    task_id: &str,
    state: BrokerState,
    last_error: Option<&str>,
    enqueued_at: DateTime<Utc>,
) -> TaskStatus {
    let (task_state, progress, error, finished) = match state {
        BrokerState::Scheduled | BrokerState::Pending => (TaskState::Pending, 0.0, None, false),
        BrokerState::Active => (TaskState::Running, 0.5, None, false),
        BrokerState::Completed => (TaskState::Completed, 1.0, None, true),
        BrokerState::Retry | BrokerState::Failed => (
            TaskState::Failed,
            0.0,
            last_error.map(str::to_string),
            state == BrokerState::Failed,
        ),
        BrokerState::Cancelled => (TaskState::Cancelled, 0.0, None, true),
    };

    TaskStatus {
        task_id: task_id.to_string(),
        state: task_state,
        progress,
        error,
        started_at: enqueued_at,
        finished_at: finished.then(Utc::now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn scheduled_and_pending_read_as_pending() {
        for state in [BrokerState::Scheduled, BrokerState::Pending] {
            let status = project("t", state, None, at());
            assert_eq!(status.state, TaskState::Pending);
            assert_eq!(status.progress, 0.0);
            assert!(status.finished_at.is_none());
        }
    }

    #[test]
    fn active_reads_as_running() {
        let status = project("t", BrokerState::Active, None, at());
        assert_eq!(status.state, TaskState::Running);
        assert!(status.finished_at.is_none());
    }

    #[test]
    fn completed_forces_full_progress() {
        let status = project("t", BrokerState::Completed, None, at());
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(status.progress, 1.0);
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn retry_surfaces_last_error_as_failed() {
        let status = project("t", BrokerState::Retry, Some("page 3 unreadable"), at());
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.error.as_deref(), Some("page 3 unreadable"));
        // A retrying task is not finished yet.
        assert!(status.finished_at.is_none());
    }

    #[test]
    fn cancelled_is_terminal_without_error() {
        let status = project("t", BrokerState::Cancelled, None, at());
        assert_eq!(status.state, TaskState::Cancelled);
        assert!(status.error.is_none());
        assert!(status.finished_at.is_some());
    }
}
