//! Converts an extractor's chunk sequence into the client-facing
//! `ProcessedDocument` artifact.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::model::{meta, ChunkContent, DocumentChunk, ProcessedDocument, ResultMetadata};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("no chunks to convert")]
    Empty,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Fold chunks into a `ProcessedDocument`. Positions are 1-based in input
    /// order; sections are collected as a sorted set; confidence is the
    /// arithmetic mean of the chunks that carry one (1.0 when none do).
    pub fn convert(&self, chunks: &[DocumentChunk]) -> Result<ProcessedDocument, NormalizeError> {
        if chunks.is_empty() {
            return Err(NormalizeError::Empty);
        }

        let mut content = Vec::with_capacity(chunks.len());
        let mut sections = BTreeSet::new();
        let mut confidence_sum = 0.0f64;
        let mut confidence_count = 0usize;

        for (index, chunk) in chunks.iter().enumerate() {
            content.push(ChunkContent {
                text: chunk.content.clone(),
                position: index + 1,
                kind: chunk_kind(chunk),
                metadata: chunk.metadata.clone(),
            });

            if let Some(section) = chunk.metadata.get(meta::SECTION).and_then(Value::as_str) {
                sections.insert(section.to_string());
            }
            if let Some(confidence) = chunk.confidence() {
                confidence_sum += confidence;
                confidence_count += 1;
            }
        }

        let confidence = if confidence_count > 0 {
            confidence_sum / confidence_count as f64
        } else {
            1.0
        };

        Ok(ProcessedDocument {
            task_id: String::new(),
            status: "completed".to_string(),
            content,
            metadata: ResultMetadata {
                file_name: String::new(),
                file_type: String::new(),
                file_size: 0,
                page_count: 0,
                sections: sections.into_iter().collect(),
                language: String::new(),
                confidence,
                processing_ms: 0,
            },
            processed_at: Utc::now(),
        })
    }
}

/// Chunk type resolution: page markers win, then image markers, then whatever
/// type tag the extractor attached.
fn chunk_kind(chunk: &DocumentChunk) -> String {
    if chunk.metadata.contains_key(meta::PAGE) || chunk.metadata.contains_key(meta::PAGE_NUMBER) {
        return "page".to_string();
    }
    if chunk.metadata.contains_key(meta::IMAGE_TYPE) {
        return "image".to_string();
    }
    chunk
        .metadata
        .get(meta::TYPE)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
