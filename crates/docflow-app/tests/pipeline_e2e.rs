//! End-to-end pipeline behavior against in-memory storage and queue doubles:
//! intake through the service seam, worker-side handling, result download,
//! cancellation, and retention.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use tokio_util::sync::CancellationToken;

use docflow_app::api::ApiService;
use docflow_app::config::IngestConfig;
use docflow_app::extract::{ExtractorRegistry, PdfExtractor};
use docflow_app::ingest::IngestService;
use docflow_app::model::{Task, TaskState, TaskStatus};
use docflow_app::queue::{QueueError, TaskQueue};
use docflow_app::service::DocumentPipeline;
use docflow_app::storage::{BlobError, BlobStore};
use docflow_server::{DocumentService, ServiceError, StagedUpload};

struct MemStore {
    objects: Mutex<HashMap<String, (Bytes, DateTime<Utc>)>>,
}

impl MemStore {
    fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    fn insert_at(&self, key: &str, data: Bytes, at: DateTime<Utc>) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, at));
    }

    fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl BlobStore for MemStore {
    async fn put(&self, data: Bytes, key: &str) -> Result<String, BlobError> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (data, Utc::now()));
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn cleanup_before(&self, threshold: DateTime<Utc>) -> Result<u64, BlobError> {
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|_, (_, modified)| *modified >= threshold);
        Ok((before - objects.len()) as u64)
    }
}

struct MemQueue {
    tasks: Mutex<Vec<Task>>,
    pending: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, TaskStatus>>,
}

impl MemQueue {
    fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            pending: Mutex::new(HashSet::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    fn enqueued(&self) -> Vec<Task> {
        self.tasks.lock().unwrap().clone()
    }

    fn is_pending(&self, task_id: &str) -> bool {
        self.pending.lock().unwrap().contains(task_id)
    }
}

#[async_trait]
impl TaskQueue for MemQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        let mut pending = self.pending.lock().unwrap();
        if !pending.insert(task.id.clone()) {
            return Err(QueueError::Duplicate(task.id.clone()));
        }
        self.tasks.lock().unwrap().push(task.clone());
        Ok(())
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        self.statuses
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    async fn cancel(&self, task_id: &str) -> Result<(), QueueError> {
        if !self.pending.lock().unwrap().remove(task_id) {
            return Err(QueueError::NotFound(task_id.to_string()));
        }
        self.statuses.lock().unwrap().insert(
            task_id.to_string(),
            TaskStatus::terminal(task_id.to_string(), TaskState::Cancelled, Utc::now(), None),
        );
        Ok(())
    }

    async fn save_final(&self, status: &TaskStatus) -> Result<(), QueueError> {
        self.statuses
            .lock()
            .unwrap()
            .insert(status.task_id.clone(), status.clone());
        Ok(())
    }
}

fn build_pdf(texts: &[&str]) -> Bytes {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::with_capacity(texts.len());
    for text in texts {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).expect("serialize pdf");
    Bytes::from(buffer)
}

struct Harness {
    api: ApiService,
    pipeline: DocumentPipeline,
    storage: Arc<MemStore>,
    queue: Arc<MemQueue>,
}

fn harness() -> Harness {
    let storage = Arc::new(MemStore::new());
    let queue = Arc::new(MemQueue::new());
    let mut registry = ExtractorRegistry::new();
    registry.register(&["application/pdf"], Arc::new(PdfExtractor::new()));

    let ingest = IngestService::new(
        storage.clone(),
        queue.clone(),
        IngestConfig {
            max_file_size: 10 * 1024 * 1024,
            allowed_types: vec![".pdf".to_string(), ".png".to_string()],
            priority: 2,
            retention_hours: 24,
        },
    );
    let pipeline = DocumentPipeline::new(
        Arc::new(registry),
        storage.clone(),
        queue.clone(),
        ingest,
    );

    Harness {
        api: ApiService::new(pipeline.clone()),
        pipeline,
        storage,
        queue,
    }
}

#[tokio::test]
async fn pdf_happy_path_traverses_pending_running_completed() {
    let h = harness();

    let receipt = h
        .api
        .process_file(StagedUpload {
            filename: "report.pdf".to_string(),
            data: build_pdf(&["first page", "second page", "third page"]),
        })
        .await
        .expect("intake");
    assert_eq!(receipt.status, "pending");

    // First poll finds the pending status.
    let snapshot = h.api.status(&receipt.task_id).await.expect("status");
    assert_eq!(snapshot.status, "pending");

    // Worker-side handling of the enqueued task.
    let task = h.queue.enqueued().into_iter().next().expect("task");
    let cancel = CancellationToken::new();
    h.pipeline
        .handle_document(&cancel, &task)
        .await
        .expect("handle");

    let snapshot = h.api.status(&receipt.task_id).await.expect("status");
    assert_eq!(snapshot.status, "completed");
    assert_eq!(snapshot.progress, 1.0);

    // Download yields three ordered page chunks.
    let artifact = h.api.result(&receipt.task_id).await.expect("result");
    let content = artifact["content"].as_array().expect("content array");
    assert_eq!(content.len(), 3);
    let sections: Vec<&str> = content
        .iter()
        .map(|chunk| chunk["metadata"]["section"].as_str().unwrap())
        .collect();
    assert_eq!(sections, vec!["page_1", "page_2", "page_3"]);
    for (index, chunk) in content.iter().enumerate() {
        assert_eq!(chunk["position"].as_u64().unwrap() as usize, index + 1);
        assert_eq!(chunk["type"], "page");
    }
    assert_eq!(artifact["metadata"]["fileName"], "report.pdf");
    assert_eq!(artifact["metadata"]["pageCount"], 3);
}

#[tokio::test]
async fn unsupported_upload_creates_no_task_and_no_blob() {
    let h = harness();

    let err = h
        .api
        .process_file(StagedUpload {
            filename: "tool.exe".to_string(),
            data: Bytes::from_static(b"MZ"),
        })
        .await
        .expect_err("must be rejected");
    assert!(matches!(err, ServiceError::Validation(_)));
    assert!(err.to_string().contains("unsupported file type"));

    assert!(h.queue.enqueued().is_empty());
    assert!(h.storage.keys().is_empty());
}

#[tokio::test]
async fn cancel_pending_task_before_any_worker_touches_it() {
    let h = harness();

    let receipt = h
        .api
        .process_file(StagedUpload {
            filename: "report.pdf".to_string(),
            data: build_pdf(&["only page"]),
        })
        .await
        .expect("intake");

    h.api.cancel(&receipt.task_id).await.expect("cancel");

    let snapshot = h.api.status(&receipt.task_id).await.expect("status");
    assert_eq!(snapshot.status, "cancelled");

    // The task left the pending set, so no worker will ever claim it.
    assert!(!h.queue.is_pending(&receipt.task_id));

    // Cancelling a task that is gone reports not-found.
    let err = h.api.cancel(&receipt.task_id).await.expect_err("second cancel");
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn download_before_completion_is_refused() {
    let h = harness();

    let receipt = h
        .api
        .process_file(StagedUpload {
            filename: "report.pdf".to_string(),
            data: build_pdf(&["only page"]),
        })
        .await
        .expect("intake");

    let err = h.api.result(&receipt.task_id).await.expect_err("not done yet");
    assert!(matches!(err, ServiceError::NotCompleted(_)));
}

#[tokio::test]
async fn retention_sweep_removes_only_expired_blobs() {
    let h = harness();

    h.storage.insert_at(
        "stale.pdf",
        Bytes::from_static(b"old"),
        Utc::now() - Duration::hours(48),
    );
    h.storage
        .put(Bytes::from_static(b"fresh"), "fresh.pdf")
        .await
        .expect("put");

    let deleted = h.pipeline.ingest().cleanup().await.expect("sweep");
    assert_eq!(deleted, 1);

    let keys = h.storage.keys();
    assert!(keys.contains(&"fresh.pdf".to_string()));
    assert!(!keys.contains(&"stale.pdf".to_string()));
}
