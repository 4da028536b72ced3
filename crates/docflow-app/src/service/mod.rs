//! `DocumentPipeline`: the glue the worker and the HTTP boundary both sit on.
//! Resolves extractors, runs extraction + normalization, and persists the
//! result artifact strictly before the terminal status write.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::extract::{ExtractError, ExtractorRegistry, RegistryError};
use crate::ingest::IngestService;
use crate::model::{
    result_key, ProcessedDocument, ProcessingTask, Task, TaskState, TaskStatus,
    TASK_TYPE_DOCUMENT_PROCESS,
};
use crate::normalize::{NormalizeError, Normalizer};
use crate::queue::{QueueError, TaskQueue};
use crate::storage::{BlobError, BlobStore};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid task data: {0}")]
    InvalidTask(String),

    #[error("task {task_id} is not completed: {state}")]
    NotCompleted { task_id: String, state: TaskState },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Storage(#[from] BlobError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone)]
pub struct DocumentPipeline {
    registry: Arc<ExtractorRegistry>,
    storage: Arc<dyn BlobStore>,
    queue: Arc<dyn TaskQueue>,
    normalizer: Normalizer,
    ingest: IngestService,
}

impl DocumentPipeline {
    pub fn new(
        registry: Arc<ExtractorRegistry>,
        storage: Arc<dyn BlobStore>,
        queue: Arc<dyn TaskQueue>,
        ingest: IngestService,
    ) -> Self {
        Self {
            registry,
            storage,
            queue,
            normalizer: Normalizer::new(),
            ingest,
        }
    }

    pub fn ingest(&self) -> &IngestService {
        &self.ingest
    }

    pub fn registry(&self) -> &ExtractorRegistry {
        &self.registry
    }

    /// Process one task end to end. Idempotent per task id: a retry overwrites
    /// the same blob key with the same content (modulo `processedAt`).
    pub async fn handle_document(
        &self,
        cancel: &CancellationToken,
        task: &Task,
    ) -> Result<(), PipelineError> {
        if !task.is_well_formed() {
            return Err(PipelineError::InvalidTask(
                "missing required fields".to_string(),
            ));
        }
        let started = Instant::now();
        let task_id = task.id.as_str();

        tracing::info!(
            task_id,
            filename = task.metadata.get("filename").map(String::as_str),
            "processing document"
        );

        let file_id = task
            .payload
            .get("fileId")
            .and_then(Value::as_str)
            .ok_or_else(|| PipelineError::InvalidTask("payload has no fileId".to_string()))?;
        let file_type = task
            .metadata
            .get("type")
            .ok_or_else(|| PipelineError::InvalidTask("metadata has no type".to_string()))?;

        let extractor = self.registry.resolve(file_type)?;
        let data = self.storage.get(file_id).await?;
        let chunks = extractor.process(cancel, data).await?;

        let mut document = self.normalizer.convert(&chunks)?;
        document.task_id = task_id.to_string();
        document.metadata.file_name = task
            .metadata
            .get("filename")
            .cloned()
            .unwrap_or_default();
        document.metadata.file_type = file_type.clone();
        document.metadata.file_size = task
            .metadata
            .get("size")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        document.metadata.page_count = document
            .content
            .iter()
            .filter(|chunk| chunk.kind == "page")
            .count();
        document.metadata.processing_ms = started.elapsed().as_millis() as i64;

        let encoded = serde_json::to_vec(&document)?;
        // The artifact write happens strictly before the terminal status so
        // any observer of `completed` finds it on the next read.
        self.storage
            .put(encoded.into(), &result_key(task_id))
            .await?;

        let final_status = TaskStatus {
            task_id: task_id.to_string(),
            state: TaskState::Completed,
            progress: 1.0,
            error: None,
            started_at: task.created_at,
            finished_at: Some(chrono::Utc::now()),
        };
        if let Err(err) = self.queue.save_final(&final_status).await {
            tracing::warn!(task_id, %err, "failed to save final status");
        }

        tracing::info!(task_id, chunks = chunks.len(), "document processing completed");
        Ok(())
    }

    /// Current status, shaped for clients.
    pub async fn status(&self, task_id: &str) -> Result<ProcessingTask, PipelineError> {
        let status = self.queue.get_status(task_id).await?;
        Ok(ProcessingTask {
            id: status.task_id,
            status: status.state,
            kind: TASK_TYPE_DOCUMENT_PROCESS.to_string(),
            priority: 0,
            progress: status.progress,
            error: status.error,
            metadata: Default::default(),
            created_at: status.started_at,
            updated_at: status.finished_at.unwrap_or(status.started_at),
        })
    }

    /// Fetch and decode the result artifact of a completed task.
    pub async fn result(&self, task_id: &str) -> Result<ProcessedDocument, PipelineError> {
        let status = self.queue.get_status(task_id).await?;
        if status.state != TaskState::Completed {
            return Err(PipelineError::NotCompleted {
                task_id: task_id.to_string(),
                state: status.state,
            });
        }

        let raw = self.storage.get(&result_key(task_id)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn cancel_task(&self, task_id: &str) -> Result<(), PipelineError> {
        self.queue.cancel(task_id).await?;
        tracing::info!(task_id, "task cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{Extractor, PdfExtractor};
    use crate::ingest::UploadedFile;
    use crate::model::meta;
    use crate::testing::{MemoryBlobStore, MemoryQueue};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::collections::BTreeMap;

    struct FixedExtractor {
        chunks: Vec<crate::model::DocumentChunk>,
    }

    #[async_trait]
    impl Extractor for FixedExtractor {
        fn can_process(&self, mime: &str) -> bool {
            mime == "application/pdf"
        }

        async fn process(
            &self,
            _cancel: &CancellationToken,
            _data: Bytes,
        ) -> Result<Vec<crate::model::DocumentChunk>, ExtractError> {
            Ok(self.chunks.clone())
        }

        async fn extract_metadata(
            &self,
            _data: Bytes,
        ) -> Result<crate::model::DocumentMetadata, ExtractError> {
            unimplemented!("not used in these tests")
        }
    }

    fn pipeline_with(
        extractor: Arc<dyn Extractor>,
    ) -> (DocumentPipeline, Arc<MemoryBlobStore>, Arc<MemoryQueue>) {
        let storage = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let mut registry = ExtractorRegistry::new();
        registry.register(&["application/pdf"], extractor);
        let ingest = IngestService::new(
            storage.clone(),
            queue.clone(),
            crate::config::IngestConfig {
                max_file_size: 1024 * 1024,
                allowed_types: vec![".pdf".to_string()],
                priority: 2,
                retention_hours: 24,
            },
        );
        let pipeline =
            DocumentPipeline::new(Arc::new(registry), storage.clone(), queue.clone(), ingest);
        (pipeline, storage, queue)
    }

    fn page_chunks() -> Vec<crate::model::DocumentChunk> {
        (1u64..=3)
            .map(|page| {
                crate::model::DocumentChunk::new(format!("page {page} text"))
                    .with(meta::PAGE, page)
                    .with(meta::SECTION, format!("page_{page}"))
            })
            .collect()
    }

    fn task_for(task_id: &str, filename: &str) -> Task {
        let mut payload = serde_json::Map::new();
        payload.insert("fileId".to_string(), filename.into());
        let mut metadata = BTreeMap::new();
        metadata.insert("filename".to_string(), filename.to_string());
        metadata.insert("size".to_string(), "5".to_string());
        metadata.insert("type".to_string(), ".pdf".to_string());
        Task {
            id: task_id.to_string(),
            kind: TASK_TYPE_DOCUMENT_PROCESS.to_string(),
            priority: 2,
            payload,
            metadata,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn handle_document_writes_artifact_then_status() {
        let (pipeline, storage, queue) = pipeline_with(Arc::new(FixedExtractor {
            chunks: page_chunks(),
        }));
        let cancel = CancellationToken::new();

        storage
            .put(Bytes::from_static(b"%PDF-"), "report.pdf")
            .await
            .expect("seed blob");
        let task = task_for("t-1", "report.pdf");

        pipeline.handle_document(&cancel, &task).await.expect("handle");

        let artifact = storage.get("result:t-1").await.expect("artifact exists");
        let decoded: ProcessedDocument = serde_json::from_slice(&artifact).expect("decodes");
        assert_eq!(decoded.task_id, "t-1");
        assert_eq!(decoded.content.len(), 3);
        assert_eq!(decoded.metadata.file_name, "report.pdf");
        assert_eq!(decoded.metadata.page_count, 3);
        assert_eq!(
            decoded.metadata.sections,
            vec!["page_1", "page_2", "page_3"]
        );

        let status = queue.get_status("t-1").await.expect("status");
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(status.progress, 1.0);
    }

    #[tokio::test]
    async fn handler_is_idempotent_modulo_processed_at() {
        let (pipeline, storage, _queue) = pipeline_with(Arc::new(FixedExtractor {
            chunks: page_chunks(),
        }));
        let cancel = CancellationToken::new();

        storage
            .put(Bytes::from_static(b"%PDF-"), "report.pdf")
            .await
            .expect("seed blob");
        let task = task_for("t-2", "report.pdf");

        pipeline.handle_document(&cancel, &task).await.expect("first run");
        let mut first: ProcessedDocument =
            serde_json::from_slice(&storage.get("result:t-2").await.unwrap()).unwrap();

        pipeline.handle_document(&cancel, &task).await.expect("retry run");
        let mut second: ProcessedDocument =
            serde_json::from_slice(&storage.get("result:t-2").await.unwrap()).unwrap();

        let fixed = chrono::DateTime::<chrono::Utc>::MIN_UTC;
        first.processed_at = fixed;
        second.processed_at = fixed;
        first.metadata.processing_ms = 0;
        second.metadata.processing_ms = 0;
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn malformed_task_is_rejected_before_any_io() {
        let (pipeline, _storage, _queue) = pipeline_with(Arc::new(FixedExtractor {
            chunks: page_chunks(),
        }));
        let cancel = CancellationToken::new();

        let mut task = task_for("t-3", "report.pdf");
        task.payload.clear();
        let err = pipeline
            .handle_document(&cancel, &task)
            .await
            .expect_err("invalid");
        assert!(matches!(err, PipelineError::InvalidTask(_)));
    }

    #[tokio::test]
    async fn result_requires_completed_state() {
        let (pipeline, _storage, queue) = pipeline_with(Arc::new(FixedExtractor {
            chunks: page_chunks(),
        }));

        queue
            .save_final(&TaskStatus::pending("t-4"))
            .await
            .expect("seed status");

        let err = pipeline.result("t-4").await.expect_err("not completed");
        assert!(matches!(err, PipelineError::NotCompleted { .. }));
    }

    #[tokio::test]
    async fn intake_then_handle_round_trips_through_real_pdf_extractor() {
        // Full local path: ingest stores the file, the worker-side handler
        // extracts it with the real PDF extractor.
        let storage = Arc::new(MemoryBlobStore::new());
        let queue = Arc::new(MemoryQueue::new());
        let mut registry = ExtractorRegistry::new();
        registry.register(&["application/pdf"], Arc::new(PdfExtractor::new()));
        let ingest = IngestService::new(
            storage.clone(),
            queue.clone(),
            crate::config::IngestConfig {
                max_file_size: 10 * 1024 * 1024,
                allowed_types: vec![".pdf".to_string()],
                priority: 2,
                retention_hours: 24,
            },
        );
        let pipeline =
            DocumentPipeline::new(Arc::new(registry), storage.clone(), queue.clone(), ingest);
        let cancel = CancellationToken::new();

        let pdf = crate::extract::pdf::test_support::build_pdf(&["hello world"], None);
        let receipt = pipeline
            .ingest()
            .process_file(
                &cancel,
                UploadedFile {
                    filename: "hello.pdf".to_string(),
                    data: pdf,
                },
            )
            .await
            .expect("intake");

        let task = queue.enqueued().into_iter().next().expect("task enqueued");
        assert_eq!(task.id, receipt.id);

        pipeline.handle_document(&cancel, &task).await.expect("handle");
        let artifact = pipeline.result(&task.id).await.expect("result");
        assert_eq!(artifact.content.len(), 1);
        assert!(artifact.content[0].text.contains("hello world"));
    }
}
