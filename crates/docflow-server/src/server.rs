//! Router, handlers, and server lifecycle for the `/api/v1/documents` API.

use std::{
    collections::BTreeMap, future::IntoFuture, net::SocketAddr, sync::Arc, time::Duration,
};

use async_trait::async_trait;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

const PROCESS_PATH: &str = "/api/v1/documents/process";
const BATCH_PATH: &str = "/api/v1/documents/batch";
const STATUS_PATH: &str = "/api/v1/documents/status/:task_id";
const DOWNLOAD_PATH: &str = "/api/v1/documents/download/:task_id";
const CANCEL_PATH: &str = "/api/v1/documents/task/:task_id";

/// Uploads above the largest accepted document still need multipart framing
/// headroom.
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 60 * 1024 * 1024;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_ID_HEADER: &str = "x-request-id";

/// An upload extracted from the multipart body, handed to the service.
#[derive(Debug, Clone)]
pub struct StagedUpload {
    pub filename: String,
    pub data: Bytes,
}

/// Intake acknowledgement returned by `POST /documents/process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeReceipt {
    pub task_id: String,
    pub status: String,
    pub filename: String,
    pub file_size: u64,
    pub file_type: String,
    pub created_at: DateTime<Utc>,
}

/// Client-facing status record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: String,
    pub progress: f64,
    pub error: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Batch intake outcome: receipts created before any failure, plus the first
/// fatal error when one occurred.
#[derive(Debug)]
pub struct BatchReply {
    pub receipts: Vec<IntakeReceipt>,
    pub error: Option<ServiceError>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    NotCompleted(String),

    #[error("{0}")]
    Internal(String),
}

/// The seam the application implements: intake, status, result retrieval,
/// and cancellation.
#[async_trait]
pub trait DocumentService: Send + Sync {
    async fn process_file(&self, upload: StagedUpload) -> Result<IntakeReceipt, ServiceError>;

    async fn process_batch(&self, uploads: Vec<StagedUpload>) -> BatchReply;

    async fn status(&self, task_id: &str) -> Result<TaskSnapshot, ServiceError>;

    /// The decoded result artifact of a completed task.
    async fn result(&self, task_id: &str) -> Result<Value, ServiceError>;

    async fn cancel(&self, task_id: &str) -> Result<(), ServiceError>;
}

pub type DynDocumentService = Arc<dyn DocumentService>;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,

    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Serialize)]
struct ApiErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    message: String,
}

#[derive(Debug, Clone)]
struct ApiError {
    status: StatusCode,
    body: ApiErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
            },
        }
    }

    fn bad_request(message: impl Into<String>, error: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message, error)
    }

    fn internal(message: impl Into<String>, error: Option<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message, error)
    }

    fn from_service(message: &'static str, err: ServiceError) -> Self {
        match err {
            ServiceError::Validation(detail) => Self::bad_request(message, Some(detail)),
            other => Self::internal(message, Some(other.to_string())),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// `POST /api/v1/documents/process` — multipart `file` field.
async fn process_document(
    State(service): State<DynDocumentService>,
    multipart: Multipart,
) -> Result<Json<IntakeReceipt>, ApiError> {
    let mut uploads = read_uploads(multipart, "file").await?;
    let upload = uploads
        .pop()
        .ok_or_else(|| ApiError::bad_request("Invalid file upload", None))?;

    let receipt = service
        .process_file(upload)
        .await
        .map_err(|err| ApiError::from_service("Failed to process file", err))?;
    Ok(Json(receipt))
}

/// `POST /api/v1/documents/batch` — multipart `files` fields.
async fn process_batch(
    State(service): State<DynDocumentService>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let uploads = read_uploads(multipart, "files").await?;
    if uploads.is_empty() {
        return Err(ApiError::bad_request("No files provided", None));
    }
    let count = uploads.len();

    let reply = service.process_batch(uploads).await;
    if let Some(err) = reply.error {
        return Err(ApiError::from_service("Failed to process files", err));
    }

    Ok(Json(json!({
        "message": format!("Processing {count} documents"),
        "tasks": reply.receipts,
    })))
}

/// `GET /api/v1/documents/status/:task_id`.
async fn get_status(
    State(service): State<DynDocumentService>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskSnapshot>, ApiError> {
    require_task_id(&task_id)?;
    let snapshot = service
        .status(&task_id)
        .await
        .map_err(|err| ApiError::from_service("Failed to get status", err))?;
    Ok(Json(snapshot))
}

/// `GET /api/v1/documents/download/:task_id` — JSON attachment.
async fn download_result(
    State(service): State<DynDocumentService>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    require_task_id(&task_id)?;
    let artifact = service
        .result(&task_id)
        .await
        .map_err(|err| ApiError::from_service("Failed to get result", err))?;

    let encoded = serde_json::to_vec(&artifact)
        .map_err(|err| ApiError::internal("Failed to serialize result", Some(err.to_string())))?;

    let disposition = format!("attachment; filename=result_{task_id}.json");
    let disposition = HeaderValue::from_str(&disposition)
        .map_err(|err| ApiError::internal("Failed to build headers", Some(err.to_string())))?;

    let mut response = (StatusCode::OK, encoded).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_DISPOSITION, disposition);
    Ok(response)
}

/// `DELETE /api/v1/documents/task/:task_id`.
async fn cancel_task(
    State(service): State<DynDocumentService>,
    Path(task_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    require_task_id(&task_id)?;
    service
        .cancel(&task_id)
        .await
        .map_err(|err| ApiError::from_service("Failed to cancel task", err))?;
    Ok(Json(json!({
        "message": "Task cancelled successfully",
        "taskId": task_id,
    })))
}

fn require_task_id(task_id: &str) -> Result<(), ApiError> {
    if task_id.trim().is_empty() {
        return Err(ApiError::bad_request("Task ID is required", None));
    }
    Ok(())
}

/// Collect the uploads under `field_name` from a multipart body.
async fn read_uploads(
    mut multipart: Multipart,
    field_name: &str,
) -> Result<Vec<StagedUpload>, ApiError> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request("Invalid form data", Some(err.to_string())))?
    {
        if field.name() != Some(field_name) {
            continue;
        }
        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::bad_request("Invalid file upload", None))?;
        let data = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request("Invalid file upload", Some(err.to_string())))?;
        uploads.push(StagedUpload { filename, data });
    }
    Ok(uploads)
}

/// Assemble the application router: routes, permissive CORS (all origins;
/// GET/POST/PUT/DELETE/OPTIONS; Origin/Content-Type/Authorization), request
/// tracing, and request ids.
pub fn build_router(service: DynDocumentService, max_upload_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::AUTHORIZATION]);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .route(PROCESS_PATH, post(process_document))
        .route(BATCH_PATH, post(process_batch))
        .route(STATUS_PATH, get(get_status))
        .route(DOWNLOAD_PATH, get(download_result))
        .route(CANCEL_PATH, delete(cancel_task))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .with_state(service)
}

/// Serve until SIGINT/SIGTERM, then give in-flight connections a short drain
/// window before tearing the server down.
pub async fn serve(
    listen_addr: &str,
    service: DynDocumentService,
    max_upload_bytes: usize,
) -> Result<(), ServeError> {
    let trimmed = listen_addr.trim();
    if trimmed.is_empty() {
        return Err(ServeError::EmptyListenAddr);
    }
    let addr: SocketAddr = trimmed
        .parse()
        .map_err(|source| ServeError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })?;

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServeError::Bind {
            address: addr.to_string(),
            source,
        })?;
    tracing::info!(%addr, "docflow server listening");

    let app = build_router(service, max_upload_bytes);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_signal = async move {
        wait_for_shutdown().await;
        let _ = shutdown_tx.send(true);
    };

    let mut server = Box::pin(
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal)
            .into_future(),
    );
    let mut drain = Box::pin(drain_timeout(shutdown_rx));

    tokio::select! {
        result = server.as_mut() => {
            result.map_err(|source| ServeError::Serve { source })?;
        }
        () = drain.as_mut() => {
            tracing::warn!(
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; dropping remaining connections"
            );
        }
    }

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::warn!(%error, "failed to capture Ctrl+C signal");
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
    tracing::info!("shutdown signal received; draining connections");
}

async fn drain_timeout(mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *shutdown_rx.borrow() {
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            return;
        }
    }
}
