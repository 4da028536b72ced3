//! Implements the HTTP boundary's `DocumentService` seam on top of the
//! pipeline.

use async_trait::async_trait;

use docflow_server::{
    BatchReply, DocumentService, IntakeReceipt, ServiceError, StagedUpload, TaskSnapshot,
};
use tokio_util::sync::CancellationToken;

use crate::ingest::{IngestError, UploadedFile};
use crate::model::ProcessingTask;
use crate::queue::QueueError;
use crate::service::{DocumentPipeline, PipelineError};

pub struct ApiService {
    pipeline: DocumentPipeline,
}

impl ApiService {
    pub fn new(pipeline: DocumentPipeline) -> Self {
        Self { pipeline }
    }
}

fn receipt_from(task: ProcessingTask) -> IntakeReceipt {
    IntakeReceipt {
        task_id: task.id,
        status: task.status.to_string(),
        filename: task
            .metadata
            .get("filename")
            .cloned()
            .unwrap_or_default(),
        file_size: task
            .metadata
            .get("size")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0),
        file_type: task.metadata.get("type").cloned().unwrap_or_default(),
        created_at: task.created_at,
    }
}

fn map_ingest_error(err: IngestError) -> ServiceError {
    if err.is_validation() {
        return ServiceError::Validation(err.to_string());
    }
    match err {
        IngestError::Queue(QueueError::Duplicate(id)) => {
            ServiceError::Validation(format!("task `{id}` already enqueued"))
        }
        other => ServiceError::Internal(other.to_string()),
    }
}

fn map_pipeline_error(err: PipelineError) -> ServiceError {
    match err {
        PipelineError::Queue(QueueError::NotFound(id)) => ServiceError::NotFound(id),
        PipelineError::NotCompleted { task_id, state } => {
            ServiceError::NotCompleted(format!("task {task_id} is not completed: {state}"))
        }
        other => ServiceError::Internal(other.to_string()),
    }
}

#[async_trait]
impl DocumentService for ApiService {
    async fn process_file(&self, upload: StagedUpload) -> Result<IntakeReceipt, ServiceError> {
        let cancel = CancellationToken::new();
        let task = self
            .pipeline
            .ingest()
            .process_file(
                &cancel,
                UploadedFile {
                    filename: upload.filename,
                    data: upload.data,
                },
            )
            .await
            .map_err(map_ingest_error)?;
        Ok(receipt_from(task))
    }

    async fn process_batch(&self, uploads: Vec<StagedUpload>) -> BatchReply {
        let cancel = CancellationToken::new();
        let files = uploads
            .into_iter()
            .map(|upload| UploadedFile {
                filename: upload.filename,
                data: upload.data,
            })
            .collect();

        let outcome = self.pipeline.ingest().process_batch(&cancel, files).await;
        BatchReply {
            receipts: outcome.tasks.into_iter().map(receipt_from).collect(),
            error: outcome.error.map(map_ingest_error),
        }
    }

    async fn status(&self, task_id: &str) -> Result<TaskSnapshot, ServiceError> {
        let task = self
            .pipeline
            .status(task_id)
            .await
            .map_err(map_pipeline_error)?;
        Ok(TaskSnapshot {
            task_id: task.id,
            status: task.status.to_string(),
            progress: task.progress,
            error: task.error,
            metadata: task.metadata,
            created_at: task.created_at,
            updated_at: task.updated_at,
        })
    }

    async fn result(&self, task_id: &str) -> Result<serde_json::Value, ServiceError> {
        let document = self
            .pipeline
            .result(task_id)
            .await
            .map_err(map_pipeline_error)?;
        serde_json::to_value(document)
            .map_err(|err| ServiceError::Internal(err.to_string()))
    }

    async fn cancel(&self, task_id: &str) -> Result<(), ServiceError> {
        self.pipeline
            .cancel_task(task_id)
            .await
            .map_err(map_pipeline_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BlobError;

    #[test]
    fn validation_errors_map_to_client_faults() {
        let err = map_ingest_error(IngestError::UnsupportedType(".exe".to_string()));
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = map_ingest_error(IngestError::TooLarge { size: 2, limit: 1 });
        assert!(matches!(err, ServiceError::Validation(_)));

        let err = map_ingest_error(IngestError::Storage(BlobError::Io("boom".to_string())));
        assert!(matches!(err, ServiceError::Internal(_)));
    }

    #[test]
    fn missing_tasks_map_to_not_found() {
        let err = map_pipeline_error(PipelineError::Queue(QueueError::NotFound(
            "t-1".to_string(),
        )));
        assert!(matches!(err, ServiceError::NotFound(id) if id == "t-1"));
    }
}
