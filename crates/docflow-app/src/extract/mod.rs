//! Format-specific extractors behind a common capability set, plus the
//! MIME-keyed registry that dispatches incoming files to them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{DocumentChunk, DocumentMetadata};

pub mod image;
pub mod pdf;
pub mod textract;
pub mod word;

pub use self::image::LocalImageExtractor;
pub use pdf::PdfExtractor;
pub use textract::TextractExtractor;
pub use word::WordExtractor;

/// Errors produced inside an extractor.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction cancelled")]
    Cancelled,

    #[error("failed to decode document: {0}")]
    Decode(String),

    #[error("failed to extract page {page}: {message}")]
    Page { page: u32, message: String },

    #[error("preprocessor `{stage}` failed: {message}")]
    Preprocess { stage: &'static str, message: String },

    #[error("ocr engine error: {0}")]
    Engine(String),

    #[error("external provider error: {0}")]
    Provider(String),

    #[error("io error: {0}")]
    Io(String),
}

impl ExtractError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExtractError::Cancelled)
    }
}

/// Capability set every extractor implements. `process` must honor
/// cancellation promptly at all blocking points; the returned chunk sequence
/// is totally ordered, matching source order for multi-page inputs.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn can_process(&self, mime: &str) -> bool;

    async fn process(
        &self,
        cancel: &CancellationToken,
        data: Bytes,
    ) -> Result<Vec<DocumentChunk>, ExtractError>;

    async fn extract_metadata(&self, data: Bytes) -> Result<DocumentMetadata, ExtractError>;

    /// Release held resources. Safe to call more than once.
    async fn close(&self) {}
}

impl std::fmt::Debug for dyn Extractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Extractor")
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("no processor registered for mime type: {0}")]
    NoProcessor(String),
}

/// Normalize an incoming `type` value (bare extension, dotted extension, or a
/// MIME string) to its canonical MIME type.
pub fn mime_for(raw: &str) -> Result<&'static str, RegistryError> {
    let lowered = raw.trim().to_ascii_lowercase();
    let candidate = if lowered.contains('/') {
        lowered.clone()
    } else {
        let ext = lowered.strip_prefix('.').unwrap_or(&lowered);
        match ext {
            "jpg" | "jpeg" => return Ok("image/jpeg"),
            "png" => return Ok("image/png"),
            "tif" | "tiff" => return Ok("image/tiff"),
            "pdf" => return Ok("application/pdf"),
            "doc" => return Ok("application/msword"),
            "docx" => {
                return Ok(
                    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                )
            }
            _ => return Err(RegistryError::UnsupportedFileType(raw.to_string())),
        }
    };

    // MIME spellings are normalized to the same canonical set.
    match candidate.as_str() {
        "image/jpeg" | "image/jpg" => Ok("image/jpeg"),
        "image/png" => Ok("image/png"),
        "image/tiff" => Ok("image/tiff"),
        "application/pdf" => Ok("application/pdf"),
        "application/msword" => Ok("application/msword"),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
            Ok("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        _ => Err(RegistryError::UnsupportedFileType(raw.to_string())),
    }
}

/// MIME -> extractor dispatch table. Registration is static at boot.
#[derive(Default)]
pub struct ExtractorRegistry {
    processors: HashMap<&'static str, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, mimes: &[&'static str], extractor: Arc<dyn Extractor>) {
        for mime in mimes {
            debug_assert!(extractor.can_process(mime), "extractor rejects {mime}");
            self.processors.insert(mime, Arc::clone(&extractor));
        }
    }

    /// Resolve an incoming `type` value to its extractor.
    pub fn resolve(&self, file_type: &str) -> Result<Arc<dyn Extractor>, RegistryError> {
        let mime = mime_for(file_type)?;
        self.processors
            .get(mime)
            .cloned()
            .ok_or_else(|| RegistryError::NoProcessor(mime.to_string()))
    }

    pub async fn close_all(&self) {
        for extractor in self.processors.values() {
            extractor.close().await;
        }
    }
}

/// SHA-256 of the raw document bytes, lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
