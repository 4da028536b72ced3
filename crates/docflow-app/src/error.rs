//! Application-level error type shared across binaries.

use thiserror::Error;

use crate::config::AppConfigError;
use crate::extract::{ExtractError, RegistryError};
use crate::ingest::IngestError;
use crate::normalize::NormalizeError;
use crate::queue::QueueError;
use crate::service::PipelineError;
use crate::storage::BlobError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] AppConfigError),

    #[error(transparent)]
    Storage(#[from] BlobError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Normalize(#[from] NormalizeError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Server(#[from] docflow_server::ServeError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
