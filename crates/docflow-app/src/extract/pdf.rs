//! PDF extraction: whole-file in-memory load (the parser needs random
//! access), SHA-256 content hash, and page texts fanned out onto a bounded
//! worker pool.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use lopdf::{Document, Object};
use serde_json::Map;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::model::{meta, DocumentChunk, DocumentMetadata, FileKind};

use super::{sha256_hex, ExtractError, Extractor};

/// Page-level parallelism inside a single document.
const PAGE_WORKERS: usize = 4;

pub struct PdfExtractor;

impl PdfExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Text-normalization hook applied to every page chunk. Identity for now.
    fn normalize_text(text: String) -> String {
        text
    }

    fn load(data: &[u8]) -> Result<Document, ExtractError> {
        Document::load_mem(data).map_err(|err| ExtractError::Decode(err.to_string()))
    }
}

impl Default for PdfExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for PdfExtractor {
    fn can_process(&self, mime: &str) -> bool {
        mime == "application/pdf"
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        data: Bytes,
    ) -> Result<Vec<DocumentChunk>, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let hash = sha256_hex(&data);
        let document = {
            let bytes = data.clone();
            tokio::task::spawn_blocking(move || Self::load(&bytes))
                .await
                .map_err(|err| ExtractError::Io(err.to_string()))??
        };
        let document = Arc::new(document);

        let page_numbers: Vec<u32> = document.get_pages().keys().copied().collect();
        let num_pages = page_numbers.len();
        if num_pages == 0 {
            return Ok(Vec::new());
        }

        // Workers share a 4-permit semaphore; results flow through a channel
        // sized to the page count so sends never block. A failing worker
        // cancels the child token, which stops the remaining workers.
        let child = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(PAGE_WORKERS));
        let (tx, mut rx) = mpsc::channel::<DocumentChunk>(num_pages);
        let mut workers = JoinSet::new();

        for page in page_numbers {
            let document = Arc::clone(&document);
            let semaphore = Arc::clone(&semaphore);
            let tx = tx.clone();
            let child = child.clone();
            let hash = hash.clone();

            workers.spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => {
                        permit.map_err(|_| ExtractError::Cancelled)?
                    }
                    () = child.cancelled() => return Err(ExtractError::Cancelled),
                };

                let extracted =
                    tokio::task::spawn_blocking(move || document.extract_text(&[page]))
                        .await
                        .map_err(|err| ExtractError::Page {
                            page,
                            message: err.to_string(),
                        })?;
                let text = match extracted {
                    Ok(text) => text,
                    Err(err) => {
                        child.cancel();
                        return Err(ExtractError::Page {
                            page,
                            message: err.to_string(),
                        });
                    }
                };

                let chunk = DocumentChunk::new(Self::normalize_text(text))
                    .with(meta::PAGE, page)
                    .with(meta::HASH, hash.as_str())
                    .with(meta::SECTION, format!("page_{page}"));

                if tx.send(chunk).await.is_err() {
                    return Err(ExtractError::Cancelled);
                }
                Ok(())
            });
        }
        drop(tx);

        // Collector: drains until every worker has dropped its sender.
        let mut chunks = Vec::with_capacity(num_pages);
        while let Some(chunk) = rx.recv().await {
            chunks.push(chunk);
        }

        // Barrier: every worker has finished; the first non-cancellation
        // error becomes the overall result.
        let mut first_error: Option<ExtractError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) if err.is_cancelled() => {}
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(join_err) => {
                    if !join_err.is_cancelled() && first_error.is_none() {
                        first_error = Some(ExtractError::Io(join_err.to_string()));
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        // Workers finish out of order; the artifact promises ascending pages.
        chunks.sort_by_key(|chunk| {
            chunk
                .metadata
                .get(meta::PAGE)
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(u64::MAX)
        });

        Ok(chunks)
    }

    async fn extract_metadata(&self, data: Bytes) -> Result<DocumentMetadata, ExtractError> {
        let hash = sha256_hex(&data);
        let file_size = data.len() as u64;
        let document = tokio::task::spawn_blocking(move || Self::load(&data))
            .await
            .map_err(|err| ExtractError::Io(err.to_string()))??;

        let pages = document.get_pages().len();
        let (title, author) = trailer_info(&document);

        Ok(DocumentMetadata {
            id: hash[..8].to_string(),
            title,
            author,
            file_kind: FileKind::Pdf,
            file_size,
            mime_type: "application/pdf".to_string(),
            pages,
            created_at: Utc::now(),
            hash,
            extra: Map::new(),
        })
    }
}

/// Best-effort `Title`/`Author` from the trailer's `Info` dictionary; either
/// may legitimately be absent.
fn trailer_info(document: &Document) -> (String, String) {
    let info = match document.trailer.get(b"Info") {
        Ok(object) => object,
        Err(_) => return (String::new(), String::new()),
    };
    let dict = match info {
        Object::Reference(id) => match document.get_object(*id).and_then(Object::as_dict) {
            Ok(dict) => dict,
            Err(_) => return (String::new(), String::new()),
        },
        Object::Dictionary(dict) => dict,
        _ => return (String::new(), String::new()),
    };

    let title = dict
        .get(b"Title")
        .ok()
        .and_then(|object| object.as_str().ok())
        .map(decode_pdf_string)
        .unwrap_or_default();
    let author = dict
        .get(b"Author")
        .ok()
        .and_then(|object| object.as_str().ok())
        .map(decode_pdf_string)
        .unwrap_or_default();

    (title, author)
}

/// PDF text strings are either UTF-16BE with a BOM or PDFDocEncoding; the
/// latter is close enough to Latin-1 for metadata fields.
fn decode_pdf_string(raw: &[u8]) -> String {
    if raw.len() >= 2 && raw[0] == 0xFE && raw[1] == 0xFF {
        let units: Vec<u16> = raw[2..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        raw.iter().map(|&byte| byte as char).collect()
    }
}
