//! In-memory trait doubles shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::model::{Task, TaskState, TaskStatus};
use crate::queue::{QueueError, TaskQueue};
use crate::storage::{BlobError, BlobStore};

/// Map-backed blob store double.
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, (Bytes, DateTime<Utc>)>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_with_timestamp(&self, key: &str, data: Bytes, at: DateTime<Utc>) {
        self.objects
            .lock()
            .expect("store lock")
            .insert(key.to_string(), (data, at));
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().expect("store lock").keys().cloned().collect()
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: Bytes, key: &str) -> Result<String, BlobError> {
        self.objects
            .lock()
            .expect("store lock")
            .insert(key.to_string(), (data, Utc::now()));
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        self.objects
            .lock()
            .expect("store lock")
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.objects.lock().expect("store lock").remove(key);
        Ok(())
    }

    async fn cleanup_before(&self, threshold: DateTime<Utc>) -> Result<u64, BlobError> {
        let mut objects = self.objects.lock().expect("store lock");
        let before = objects.len();
        objects.retain(|_, (_, modified)| *modified >= threshold);
        Ok((before - objects.len()) as u64)
    }
}

/// Queue double: records enqueued tasks and serves the sidecar map.
pub struct MemoryQueue {
    tasks: Mutex<Vec<Task>>,
    ids: Mutex<HashSet<String>>,
    pending: Mutex<HashSet<String>>,
    statuses: Mutex<HashMap<String, TaskStatus>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
            ids: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashSet::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn enqueued(&self) -> Vec<Task> {
        self.tasks.lock().expect("queue lock").clone()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: &Task) -> Result<(), QueueError> {
        if !self.ids.lock().expect("queue lock").insert(task.id.clone()) {
            return Err(QueueError::Duplicate(task.id.clone()));
        }
        self.pending.lock().expect("queue lock").insert(task.id.clone());
        self.tasks.lock().expect("queue lock").push(task.clone());
        Ok(())
    }

    async fn get_status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
        self.statuses
            .lock()
            .expect("queue lock")
            .get(task_id)
            .cloned()
            .ok_or_else(|| QueueError::NotFound(task_id.to_string()))
    }

    async fn cancel(&self, task_id: &str) -> Result<(), QueueError> {
        if !self.pending.lock().expect("queue lock").remove(task_id) {
            return Err(QueueError::NotFound(task_id.to_string()));
        }
        self.statuses.lock().expect("queue lock").insert(
            task_id.to_string(),
            TaskStatus::terminal(task_id.to_string(), TaskState::Cancelled, Utc::now(), None),
        );
        Ok(())
    }

    async fn save_final(&self, status: &TaskStatus) -> Result<(), QueueError> {
        self.statuses
            .lock()
            .expect("queue lock")
            .insert(status.task_id.clone(), status.clone());
        Ok(())
    }
}
