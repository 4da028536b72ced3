//! Queue consumer: promotes due tasks, pops by priority, and runs handlers
//! under per-queue concurrency caps with a per-task timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::model::TASK_TYPE_DOCUMENT_PROCESS;
use crate::queue::{QueueName, RedisQueue, TaskEnvelope};
use crate::service::DocumentPipeline;

/// Pause between polls when every queue is saturated or empty.
const IDLE_BACKOFF: Duration = Duration::from_millis(200);
/// How long in-flight handlers get to finish after a shutdown signal before
/// their contexts are cancelled.
const DRAIN_GRACE: Duration = Duration::from_secs(30);

pub struct DocumentWorker {
    queue: RedisQueue,
    pipeline: DocumentPipeline,
    process_timeout: Duration,
    limits: HashMap<QueueName, Arc<Semaphore>>,
}

impl DocumentWorker {
    pub fn new(
        queue: RedisQueue,
        pipeline: DocumentPipeline,
        concurrency: usize,
        process_timeout: Duration,
    ) -> Self {
        let limits = QueueName::ALL
            .into_iter()
            .map(|name| {
                let share = name.concurrency_share(concurrency);
                (name, Arc::new(Semaphore::new(share)))
            })
            .collect();

        Self {
            queue,
            pipeline,
            process_timeout,
            limits,
        }
    }

    /// Consume until `shutdown` fires, then stop popping and drain in-flight
    /// handlers (cancelling their contexts after the grace period).
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("document worker started");
        let handler_cancel = CancellationToken::new();
        let tracker = TaskTracker::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(err) = self.queue.promote_due().await {
                tracing::warn!(%err, "failed to promote scheduled tasks");
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }

            // Only pop from queues that still have a free handler slot.
            let open: Vec<QueueName> = QueueName::ALL
                .into_iter()
                .filter(|name| self.limits[name].available_permits() > 0)
                .collect();
            if open.is_empty() {
                tokio::time::sleep(IDLE_BACKOFF).await;
                continue;
            }

            let envelope = tokio::select! {
                popped = self.queue.pop(&open) => match popped {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => continue,
                    Err(err) => {
                        tracing::warn!(%err, "failed to pop task");
                        tokio::time::sleep(IDLE_BACKOFF).await;
                        continue;
                    }
                },
                () = shutdown.cancelled() => break,
            };

            let permit = match Arc::clone(&self.limits[&envelope.queue]).try_acquire_owned() {
                Ok(permit) => permit,
                // Lost a race for the last slot; the retry path will resurface
                // the task, so record the miss and move on.
                Err(_) => {
                    tracing::warn!(task_id = %envelope.task.id, "no free slot after pop");
                    let _ = self
                        .queue
                        .fail_or_retry(&envelope, "worker slot unavailable")
                        .await;
                    continue;
                }
            };

            let queue = self.queue.clone();
            let pipeline = self.pipeline.clone();
            let timeout = self.process_timeout;
            let cancel = handler_cancel.child_token();
            tracker.spawn(async move {
                let _permit = permit;
                handle(queue, pipeline, envelope, timeout, cancel).await;
            });
        }

        tracing::info!("worker draining in-flight handlers");
        tracker.close();
        tokio::select! {
            () = tracker.wait() => {}
            () = tokio::time::sleep(DRAIN_GRACE) => {
                tracing::warn!("drain grace elapsed; cancelling in-flight handlers");
                handler_cancel.cancel();
                tracker.wait().await;
            }
        }
        tracing::info!("document worker stopped");
    }
}

/// Run a single task through the pipeline, surrounding it with progress
/// beacons and the broker's retry accounting.
async fn handle(
    queue: RedisQueue,
    pipeline: DocumentPipeline,
    envelope: TaskEnvelope,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let task_id = envelope.task.id.clone();

    if envelope.task.kind != TASK_TYPE_DOCUMENT_PROCESS {
        tracing::error!(%task_id, kind = %envelope.task.kind, "unexpected task type");
        let _ = queue.fail_or_retry(&envelope, "unexpected task type").await;
        return;
    }

    let running = json!({"status": "running", "progress": 0}).to_string();
    if let Err(err) = queue.write_beacon(&task_id, &running).await {
        tracing::warn!(%task_id, %err, "failed to write running beacon");
    }

    let outcome = tokio::time::timeout(
        timeout,
        pipeline.handle_document(&cancel, &envelope.task),
    )
    .await;

    match outcome {
        Ok(Ok(())) => {
            if let Err(err) = queue.complete(&task_id).await {
                tracing::warn!(%task_id, %err, "failed to mark completion");
            }
            let done = json!({"status": "completed", "progress": 1.0}).to_string();
            if let Err(err) = queue.write_beacon(&task_id, &done).await {
                tracing::warn!(%task_id, %err, "failed to write completion beacon");
            }
        }
        Ok(Err(err)) => {
            let message = err.to_string();
            tracing::error!(%task_id, error = %message, "handler failed");
            let failed = json!({"status": "failed", "error": message}).to_string();
            if let Err(beacon_err) = queue.write_beacon(&task_id, &failed).await {
                tracing::warn!(%task_id, %beacon_err, "failed to write failure beacon");
            }
            if let Err(retry_err) = queue.fail_or_retry(&envelope, &message).await {
                tracing::error!(%task_id, %retry_err, "failed to record handler failure");
            }
        }
        Err(_) => {
            let message = format!(
                "processing timeout after {}s",
                timeout.as_secs()
            );
            tracing::error!(%task_id, error = %message, "handler timed out");
            let failed = json!({"status": "failed", "error": message}).to_string();
            if let Err(beacon_err) = queue.write_beacon(&task_id, &failed).await {
                tracing::warn!(%task_id, %beacon_err, "failed to write timeout beacon");
            }
            if let Err(retry_err) = queue.fail_or_retry(&envelope, &message).await {
                tracing::error!(%task_id, %retry_err, "failed to record handler timeout");
            }
        }
    }
}
