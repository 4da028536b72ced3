//! Word-document extractor. Registered so `.doc`/`.docx` uploads are routed
//! and fail with a clear message; the actual conversion is still pending.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use crate::model::{DocumentChunk, DocumentMetadata, FileKind};

use super::{sha256_hex, ExtractError, Extractor};

pub const WORD_MIME_TYPES: [&str; 2] = [
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
];

pub struct WordExtractor;

impl WordExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WordExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for WordExtractor {
    fn can_process(&self, mime: &str) -> bool {
        WORD_MIME_TYPES.contains(&mime)
    }

    async fn process(
        &self,
        _cancel: &CancellationToken,
        _data: Bytes,
    ) -> Result<Vec<DocumentChunk>, ExtractError> {
        Err(ExtractError::Provider(
            "word document extraction pending".to_string(),
        ))
    }

    async fn extract_metadata(&self, data: Bytes) -> Result<DocumentMetadata, ExtractError> {
        let hash = sha256_hex(&data);
        Ok(DocumentMetadata {
            id: hash[..8].to_string(),
            title: String::new(),
            author: String::new(),
            file_kind: FileKind::Word,
            file_size: data.len() as u64,
            mime_type: WORD_MIME_TYPES[1].to_string(),
            pages: 0,
            created_at: Utc::now(),
            hash,
            extra: Map::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn word_processing_is_still_pending() {
        let extractor = WordExtractor::new();
        assert!(extractor.can_process("application/msword"));
        assert!(!extractor.can_process("application/pdf"));

        let err = extractor
            .process(&CancellationToken::new(), Bytes::from_static(b"doc"))
            .await
            .expect_err("stub must fail");
        assert!(matches!(err, ExtractError::Provider(_)));
    }
}
