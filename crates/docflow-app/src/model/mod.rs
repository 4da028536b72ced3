//! Wire and domain types shared across the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Routing tag for document processing tasks.
pub const TASK_TYPE_DOCUMENT_PROCESS: &str = "document:process";

/// Well-known chunk metadata keys. Extractors agree on these so the
/// normalizer can aggregate without knowing which back-end produced a chunk.
pub mod meta {
    pub const PAGE: &str = "page";
    pub const HASH: &str = "hash";
    pub const SECTION: &str = "section";
    pub const SOURCE: &str = "source";
    pub const CONFIDENCE: &str = "confidence";
    pub const REGIONS: &str = "regions";
    pub const ROWS: &str = "rows";
    pub const COLS: &str = "cols";
    pub const KEY: &str = "key";
    pub const TYPE: &str = "type";
    pub const MODEL: &str = "model";
    pub const IMAGE_TYPE: &str = "imageType";
    pub const PAGE_NUMBER: &str = "pageNumber";
}

/// Content family of an ingested file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Pdf,
    Image,
    Word,
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileKind::Pdf => "pdf",
            FileKind::Image => "image",
            FileKind::Word => "word",
        };
        f.write_str(name)
    }
}

/// A queued unit of work. The ingest service mints `id` and it stays
/// authoritative for the task's whole lifetime; the queue never rewrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: u8,
    pub payload: Map<String, Value>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// A task is well-formed when it has an id and both maps are non-empty.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.payload.is_empty() && !self.metadata.is_empty()
    }
}

/// Canonical task lifecycle states. Transitions only move forward:
/// `pending -> running -> {completed, failed, cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a task, cached in the sidecar KV for 24 hours.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    #[serde(rename = "status")]
    pub state: TaskState,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatus {
    pub fn pending(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: TaskState::Pending,
            progress: 0.0,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn terminal(
        task_id: impl Into<String>,
        state: TaskState,
        started_at: DateTime<Utc>,
        error: Option<String>,
    ) -> Self {
        debug_assert!(state.is_terminal());
        Self {
            task_id: task_id.into(),
            state,
            progress: if state == TaskState::Completed { 1.0 } else { 0.0 },
            error,
            started_at,
            finished_at: Some(Utc::now()),
        }
    }
}

/// Atomic `(content, metadata)` unit produced by an extractor. Never persisted
/// raw; the normalizer folds the sequence into a [`ProcessedDocument`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub metadata: Map<String, Value>,
}

impl DocumentChunk {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Confidence in the normalized `[0.0, 1.0]` convention, when present.
    pub fn confidence(&self) -> Option<f64> {
        self.metadata.get(meta::CONFIDENCE).and_then(Value::as_f64)
    }
}

/// Document-level metadata reported by `extract_metadata`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub id: String,
    pub title: String,
    pub author: String,
    pub file_kind: FileKind,
    pub file_size: u64,
    pub mime_type: String,
    pub pages: usize,
    pub created_at: DateTime<Utc>,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Client-facing view of a task's intake record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingTask {
    pub id: String,
    pub status: TaskState,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: u8,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A positioned chunk inside the result artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkContent {
    pub text: String,
    pub position: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub metadata: Map<String, Value>,
}

/// Aggregated metadata of the result artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub page_count: usize,
    pub sections: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
    pub confidence: f64,
    pub processing_ms: i64,
}

fn is_zero(count: &usize) -> bool {
    *count == 0
}

/// The single normalized JSON artifact written under `result:<taskId>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedDocument {
    pub task_id: String,
    pub status: String,
    pub content: Vec<ChunkContent>,
    pub metadata: ResultMetadata,
    pub processed_at: DateTime<Utc>,
}

/// Storage key for a task's result artifact.
pub fn result_key(task_id: &str) -> String {
    format!("result:{task_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_wire_names_are_lowercase() {
        let encoded = serde_json::to_string(&TaskState::Running).expect("encode");
        assert_eq!(encoded, "\"running\"");
        let decoded: TaskState = serde_json::from_str("\"cancelled\"").expect("decode");
        assert_eq!(decoded, TaskState::Cancelled);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }

    #[test]
    fn status_serializes_state_under_status_key() {
        let status = TaskStatus::pending("t-1");
        let value = serde_json::to_value(&status).expect("encode");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["taskId"], "t-1");
        assert!(value.get("finishedAt").is_none());
    }

    #[test]
    fn completed_terminal_status_has_full_progress() {
        let status = TaskStatus::terminal("t-2", TaskState::Completed, Utc::now(), None);
        assert_eq!(status.progress, 1.0);
        assert!(status.finished_at.is_some());
    }

    #[test]
    fn chunk_builder_attaches_metadata() {
        let chunk = DocumentChunk::new("hello")
            .with(meta::PAGE, 3)
            .with(meta::SECTION, "page_3");
        assert_eq!(chunk.metadata[meta::PAGE], 3);
        assert_eq!(chunk.metadata[meta::SECTION], "page_3");
        assert!(chunk.confidence().is_none());
    }

    #[test]
    fn malformed_tasks_are_rejected() {
        let task = Task {
            id: String::new(),
            kind: TASK_TYPE_DOCUMENT_PROCESS.to_string(),
            priority: 2,
            payload: Map::new(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        };
        assert!(!task.is_well_formed());
    }
}
