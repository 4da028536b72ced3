//! Intake: validate, store, enqueue. The service owns a task from id minting
//! until `enqueue` returns; after that the queue owns scheduling.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde_json::Map;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::model::{ProcessingTask, Task, TaskState, TaskStatus, TASK_TYPE_DOCUMENT_PROCESS};
use crate::queue::{QueueError, TaskQueue};
use crate::storage::{BlobError, BlobStore};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("file size {size} exceeds maximum limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("ingest cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] BlobError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl IngestError {
    /// Validation failures surface to clients as 4xx and never create a task.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            IngestError::TooLarge { .. } | IngestError::UnsupportedType(_)
        )
    }
}

/// An upload as handed over by the HTTP boundary.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub data: Bytes,
}

/// Result of a batch intake. Tasks created before the first fatal error stay
/// live; callers must treat the list as possibly incomplete when `error` is
/// set.
#[derive(Debug)]
pub struct BatchOutcome {
    pub tasks: Vec<ProcessingTask>,
    pub error: Option<IngestError>,
}

#[derive(Clone)]
pub struct IngestService {
    storage: Arc<dyn BlobStore>,
    queue: Arc<dyn TaskQueue>,
    cfg: Arc<IngestConfig>,
}

impl IngestService {
    pub fn new(
        storage: Arc<dyn BlobStore>,
        queue: Arc<dyn TaskQueue>,
        cfg: IngestConfig,
    ) -> Self {
        Self {
            storage,
            queue,
            cfg: Arc::new(cfg),
        }
    }

    fn validate(&self, filename: &str, size: u64) -> Result<String, IngestError> {
        if size > self.cfg.max_file_size {
            return Err(IngestError::TooLarge {
                size,
                limit: self.cfg.max_file_size,
            });
        }

        let extension = Path::new(filename)
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy().to_lowercase()))
            .unwrap_or_default();
        if !self.cfg.allowed_types.iter().any(|allowed| *allowed == extension) {
            return Err(IngestError::UnsupportedType(extension));
        }

        Ok(extension)
    }

    /// Validate, persist the bytes under the filename (last writer wins:
    /// results are looked up by task id, never by filename), and enqueue.
    pub async fn process_file(
        &self,
        cancel: &CancellationToken,
        file: UploadedFile,
    ) -> Result<ProcessingTask, IngestError> {
        let size = file.data.len() as u64;
        let extension = self.validate(&file.filename, size)?;

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let task_id = Uuid::new_v4().to_string();
        tracing::info!(%task_id, filename = %file.filename, size, "starting file intake");

        let file_id = self.storage.put(file.data, &file.filename).await?;

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let created_at = Utc::now();
        let mut payload = Map::new();
        payload.insert("fileId".to_string(), file_id.into());
        payload.insert("filename".to_string(), file.filename.clone().into());
        payload.insert("size".to_string(), size.into());
        payload.insert("type".to_string(), extension.clone().into());

        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), file.filename.clone());
        metadata.insert("size".to_string(), size.to_string());
        metadata.insert("type".to_string(), extension);

        let task = Task {
            id: task_id.clone(),
            kind: TASK_TYPE_DOCUMENT_PROCESS.to_string(),
            priority: self.cfg.priority,
            payload,
            metadata: metadata.clone(),
            created_at,
        };

        // An enqueue failure is fatal to this intake; nothing is persisted
        // beyond the (orphaned, retention-swept) blob.
        self.queue.enqueue(&task).await?;

        // Best-effort: make the first status poll find the task even before
        // the broker has touched it.
        if let Err(err) = self.queue.save_final(&TaskStatus::pending(&task_id)).await {
            tracing::warn!(%task_id, %err, "failed to save initial status");
        }

        tracing::info!(%task_id, filename = %file.filename, "file intake complete");

        Ok(ProcessingTask {
            id: task_id,
            status: TaskState::Pending,
            kind: TASK_TYPE_DOCUMENT_PROCESS.to_string(),
            priority: self.cfg.priority,
            progress: 0.0,
            error: None,
            metadata,
            created_at,
            updated_at: created_at,
        })
    }

    /// Intake a batch concurrently under a shared cancellation context: the
    /// first fatal error cancels the remaining siblings.
    pub async fn process_batch(
        &self,
        cancel: &CancellationToken,
        files: Vec<UploadedFile>,
    ) -> BatchOutcome {
        let shared = cancel.child_token();
        let mut join_set = JoinSet::new();

        for file in files {
            let service = self.clone();
            let token = shared.clone();
            join_set.spawn(async move { service.process_file(&token, file).await });
        }

        let mut tasks = Vec::new();
        let mut first_error: Option<IngestError> = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(task)) => tasks.push(task),
                Ok(Err(IngestError::Cancelled)) => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        shared.cancel();
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if first_error.is_none() {
                        shared.cancel();
                        first_error = Some(IngestError::Storage(BlobError::Io(
                            join_err.to_string(),
                        )));
                    }
                }
            }
        }

        BatchOutcome {
            tasks,
            error: first_error,
        }
    }

    /// Retention sweep: drop every blob older than the configured window.
    pub async fn cleanup(&self) -> Result<u64, IngestError> {
        let threshold = Utc::now() - chrono::Duration::hours(self.cfg.retention_hours as i64);
        let deleted = self.storage.cleanup_before(threshold).await?;
        tracing::info!(deleted, %threshold, "completed retention sweep");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBlobStore, MemoryQueue};

    fn service() -> (IngestService, Arc<MemoryBlobStore>, Arc<MemoryQueue>) {
        let storage = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let cfg = IngestConfig {
            max_file_size: 1024,
            allowed_types: vec![".pdf".to_string(), ".png".to_string()],
            priority: 2,
            retention_hours: 24,
        };
        let service = IngestService::new(storage.clone(), queue.clone(), cfg);
        (service, storage, queue)
    }

    fn upload(name: &str, bytes: &'static [u8]) -> UploadedFile {
        UploadedFile {
            filename: name.to_string(),
            data: Bytes::from_static(bytes),
        }
    }

    #[tokio::test]
    async fn accepted_file_is_stored_and_enqueued() {
        let (service, storage, queue) = service();
        let cancel = CancellationToken::new();

        let task = service
            .process_file(&cancel, upload("report.pdf", b"%PDF-"))
            .await
            .expect("intake");

        assert_eq!(task.status, TaskState::Pending);
        assert_eq!(task.metadata["filename"], "report.pdf");
        assert_eq!(task.metadata["type"], ".pdf");

        // Bytes landed under the filename.
        assert!(storage.get("report.pdf").await.is_ok());

        // Exactly one task enqueued, with the payload the worker expects.
        let enqueued = queue.enqueued();
        assert_eq!(enqueued.len(), 1);
        assert_eq!(enqueued[0].payload["fileId"], "report.pdf");
        assert_eq!(enqueued[0].id, task.id);

        // The initial pending status is already pollable.
        let status = queue.get_status(&task.id).await.expect("status");
        assert_eq!(status.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn oversize_file_is_rejected_without_side_effects() {
        let (service, storage, queue) = service();
        let cancel = CancellationToken::new();

        let big = UploadedFile {
            filename: "big.pdf".to_string(),
            data: Bytes::from(vec![0u8; 2048]),
        };
        let err = service.process_file(&cancel, big).await.expect_err("too large");
        assert!(err.is_validation());
        assert!(matches!(err, IngestError::TooLarge { .. }));

        assert!(storage.get("big.pdf").await.is_err());
        assert!(queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn unknown_extension_is_rejected() {
        let (service, storage, queue) = service();
        let cancel = CancellationToken::new();

        let err = service
            .process_file(&cancel, upload("virus.exe", b"MZ"))
            .await
            .expect_err("unsupported");
        assert!(matches!(err, IngestError::UnsupportedType(ext) if ext == ".exe"));
        assert!(storage.get("virus.exe").await.is_err());
        assert!(queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn batch_reports_tasks_and_first_error() {
        let (service, _storage, queue) = service();
        let cancel = CancellationToken::new();

        let outcome = service
            .process_batch(
                &cancel,
                vec![
                    upload("one.pdf", b"%PDF-1"),
                    upload("two.png", b"\x89PNG"),
                    upload("nope.exe", b"MZ"),
                ],
            )
            .await;

        assert!(outcome.error.is_some(), "validation error must surface");
        // The valid uploads may or may not have completed before the error
        // cancelled the batch, but everything reported was really enqueued.
        let enqueued = queue.enqueued();
        assert_eq!(outcome.tasks.len(), enqueued.len());
    }

    #[tokio::test]
    async fn batch_of_valid_files_creates_all_tasks() {
        let (service, _storage, queue) = service();
        let cancel = CancellationToken::new();

        let outcome = service
            .process_batch(
                &cancel,
                vec![upload("a.pdf", b"%PDF-1"), upload("b.pdf", b"%PDF-2")],
            )
            .await;

        assert!(outcome.error.is_none());
        assert_eq!(outcome.tasks.len(), 2);
        assert_eq!(queue.enqueued().len(), 2);
    }
}
