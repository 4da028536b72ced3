//! Cloud OCR extraction through the AWS Textract document-analysis API.
//!
//! The network call is a thin wrapper; everything interesting happens in the
//! pure block-graph functions below, which makes them testable without the
//! service.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_textract::config::Region;
use aws_sdk_textract::primitives::Blob;
use aws_sdk_textract::types::{Block, BlockType, Document, EntityType, FeatureType, RelationshipType};
use aws_sdk_textract::Client;
use bytes::Bytes;
use chrono::Utc;
use serde_json::Map;
use tokio_util::sync::CancellationToken;

use crate::config::TextractConfig;
use crate::model::{meta, DocumentChunk, DocumentMetadata, FileKind};

use super::{sha256_hex, ExtractError, Extractor};

const SOURCE: &str = "textract";

/// Stateless across calls; the SDK client is thread-safe, so no pooling.
pub struct TextractExtractor {
    client: Client,
    min_confidence: f32,
    feature_types: Vec<FeatureType>,
    enable_tables: bool,
    enable_forms: bool,
}

impl TextractExtractor {
    pub async fn connect(cfg: &TextractConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = cfg.region.clone() {
            loader = loader.region(Region::new(region));
        }
        let shared = loader.load().await;

        let mut feature_types = Vec::new();
        if cfg.enable_tables {
            feature_types.push(FeatureType::Tables);
        }
        if cfg.enable_forms {
            feature_types.push(FeatureType::Forms);
        }

        Self {
            client: Client::new(&shared),
            min_confidence: cfg.min_confidence,
            feature_types,
            enable_tables: cfg.enable_tables,
            enable_forms: cfg.enable_forms,
        }
    }
}

#[async_trait]
impl Extractor for TextractExtractor {
    fn can_process(&self, mime: &str) -> bool {
        matches!(
            mime,
            "image/jpeg" | "image/jpg" | "image/png" | "image/tiff" | "application/pdf"
        )
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        data: Bytes,
    ) -> Result<Vec<DocumentChunk>, ExtractError> {
        let mut request = self.client.analyze_document().document(
            Document::builder().bytes(Blob::new(data.to_vec())).build(),
        );
        for feature in &self.feature_types {
            request = request.feature_types(feature.clone());
        }

        let output = tokio::select! {
            response = request.send() => {
                response.map_err(|err| ExtractError::Provider(err.to_string()))?
            }
            () = cancel.cancelled() => return Err(ExtractError::Cancelled),
        };

        let blocks = output.blocks();
        let mut chunks = Vec::new();

        if let Some(chunk) = lines_chunk(blocks, self.min_confidence) {
            chunks.push(chunk);
        }
        if self.enable_tables {
            chunks.extend(table_chunks(blocks));
        }
        if self.enable_forms {
            chunks.extend(form_chunks(blocks));
        }

        Ok(chunks)
    }

    async fn extract_metadata(&self, data: Bytes) -> Result<DocumentMetadata, ExtractError> {
        let hash = sha256_hex(&data);
        let decoded = image::load_from_memory(&data)
            .map_err(|err| ExtractError::Decode(err.to_string()))?;
        let format = image::guess_format(&data)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());

        let mut extra = Map::new();
        extra.insert("width".to_string(), decoded.width().into());
        extra.insert("height".to_string(), decoded.height().into());
        extra.insert("processor".to_string(), SOURCE.into());

        Ok(DocumentMetadata {
            id: hash[..8].to_string(),
            title: String::new(),
            author: String::new(),
            file_kind: FileKind::Image,
            file_size: data.len() as u64,
            mime_type: format,
            pages: 1,
            created_at: Utc::now(),
            hash,
            extra,
        })
    }
}

fn block_index(blocks: &[Block]) -> HashMap<&str, &Block> {
    blocks
        .iter()
        .filter_map(|block| block.id().map(|id| (id, block)))
        .collect()
}

fn related_ids<'a>(block: &'a Block, relationship: RelationshipType) -> Vec<&'a str> {
    block
        .relationships()
        .iter()
        .filter(|rel| rel.r#type() == Some(&relationship))
        .flat_map(|rel| rel.ids().iter().map(String::as_str))
        .collect()
}

/// Join the text of a block's direct word children.
fn child_text(block: &Block, index: &HashMap<&str, &Block>) -> String {
    let mut out = String::new();
    for id in related_ids(block, RelationshipType::Child) {
        let Some(child) = index.get(id) else { continue };
        let Some(text) = child.text() else { continue };
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(text);
    }
    out
}

/// One chunk concatenating every LINE block at or above the confidence floor.
/// Confidence metadata is the mean of surviving lines, normalized to [0, 1].
fn lines_chunk(blocks: &[Block], min_confidence: f32) -> Option<DocumentChunk> {
    let mut lines = Vec::new();
    let mut total_confidence = 0.0f64;
    for block in blocks {
        if block.block_type() != Some(&BlockType::Line) {
            continue;
        }
        let Some(confidence) = block.confidence() else {
            continue;
        };
        if confidence < min_confidence {
            continue;
        }
        let Some(text) = block.text() else { continue };
        lines.push(text.to_string());
        total_confidence += f64::from(confidence);
    }

    if lines.is_empty() {
        return None;
    }
    let mean = total_confidence / lines.len() as f64 / 100.0;

    Some(
        DocumentChunk::new(lines.join("\n"))
            .with(meta::SOURCE, SOURCE)
            .with(meta::TYPE, "text")
            .with(meta::CONFIDENCE, mean),
    )
}

/// One chunk per TABLE block. Dimensions come from the cell children's
/// maximum row/column index; cell text comes from each cell's own children.
fn table_chunks(blocks: &[Block]) -> Vec<DocumentChunk> {
    let index = block_index(blocks);
    let mut chunks = Vec::new();

    for block in blocks {
        if block.block_type() != Some(&BlockType::Table) {
            continue;
        }

        let cells: Vec<&Block> = related_ids(block, RelationshipType::Child)
            .into_iter()
            .filter_map(|id| index.get(id).copied())
            .filter(|child| child.block_type() == Some(&BlockType::Cell))
            .collect();

        let rows = cells
            .iter()
            .filter_map(|cell| cell.row_index())
            .max()
            .unwrap_or(0) as usize;
        let cols = cells
            .iter()
            .filter_map(|cell| cell.column_index())
            .max()
            .unwrap_or(0) as usize;
        if rows == 0 || cols == 0 {
            continue;
        }

        let mut grid = vec![vec![String::new(); cols]; rows];
        for cell in cells {
            let (Some(row), Some(col)) = (cell.row_index(), cell.column_index()) else {
                continue;
            };
            let (row, col) = (row as usize - 1, col as usize - 1);
            if row < rows && col < cols {
                grid[row][col] = child_text(cell, &index);
            }
        }

        let content = grid
            .iter()
            .map(|row| row.join(" | "))
            .collect::<Vec<_>>()
            .join("\n");

        chunks.push(
            DocumentChunk::new(content)
                .with(meta::SOURCE, SOURCE)
                .with(meta::TYPE, "table")
                .with(meta::ROWS, rows)
                .with(meta::COLS, cols),
        );
    }

    chunks
}

/// One chunk per key/value pair: KEY_VALUE_SET blocks whose first entity type
/// is KEY, with the value resolved through the VALUE relationship.
fn form_chunks(blocks: &[Block]) -> Vec<DocumentChunk> {
    let index = block_index(blocks);
    let mut chunks = Vec::new();

    for block in blocks {
        if block.block_type() != Some(&BlockType::KeyValueSet) {
            continue;
        }
        if block.entity_types().first() != Some(&EntityType::Key) {
            continue;
        }

        let key = child_text(block, &index);
        let value = related_ids(block, RelationshipType::Value)
            .into_iter()
            .filter_map(|id| index.get(id).copied())
            .map(|value_block| child_text(value_block, &index))
            .find(|text| !text.is_empty())
            .unwrap_or_default();

        if key.is_empty() || value.is_empty() {
            continue;
        }

        chunks.push(
            DocumentChunk::new(format!("{key}: {value}"))
                .with(meta::SOURCE, SOURCE)
                .with(meta::TYPE, "form")
                .with(meta::KEY, key),
        );
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_textract::types::Relationship;

    fn word(id: &str, text: &str) -> Block {
        Block::builder()
            .block_type(BlockType::Word)
            .id(id)
            .text(text)
            .confidence(99.0)
            .build()
    }

    fn line(text: &str, confidence: f32) -> Block {
        Block::builder()
            .block_type(BlockType::Line)
            .id(format!("line-{text}"))
            .text(text)
            .confidence(confidence)
            .build()
    }

    fn child_rel(ids: &[&str]) -> Relationship {
        let mut builder = Relationship::builder().r#type(RelationshipType::Child);
        for id in ids {
            builder = builder.ids(id.to_string());
        }
        builder.build()
    }

    #[test]
    fn lines_below_confidence_floor_are_dropped() {
        let blocks = vec![line("keep me", 95.0), line("drop me", 42.0)];
        let chunk = lines_chunk(&blocks, 80.0).expect("chunk");
        assert_eq!(chunk.content, "keep me");
        let confidence = chunk.confidence().expect("confidence");
        assert!((confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn no_surviving_lines_means_no_text_chunk() {
        let blocks = vec![line("faint", 10.0)];
        assert!(lines_chunk(&blocks, 80.0).is_none());
    }

    #[test]
    fn table_dimensions_come_from_cell_indices() {
        let cell = |id: &str, row: i32, col: i32, word_id: &str| {
            Block::builder()
                .block_type(BlockType::Cell)
                .id(id)
                .row_index(row)
                .column_index(col)
                .relationships(child_rel(&[word_id]))
                .build()
        };

        let table = Block::builder()
            .block_type(BlockType::Table)
            .id("t1")
            .relationships(child_rel(&["c1", "c2", "c3", "c4"]))
            .build();

        let blocks = vec![
            table,
            cell("c1", 1, 1, "w1"),
            cell("c2", 1, 2, "w2"),
            cell("c3", 2, 1, "w3"),
            cell("c4", 2, 2, "w4"),
            word("w1", "name"),
            word("w2", "qty"),
            word("w3", "bolts"),
            word("w4", "40"),
        ];

        let chunks = table_chunks(&blocks);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].metadata[meta::ROWS], 2);
        assert_eq!(chunks[0].metadata[meta::COLS], 2);
        assert_eq!(chunks[0].content, "name | qty\nbolts | 40");
    }

    #[test]
    fn form_key_resolves_value_through_relationship() {
        let key_block = Block::builder()
            .block_type(BlockType::KeyValueSet)
            .id("k1")
            .entity_types(EntityType::Key)
            .relationships(child_rel(&["kw1"]))
            .relationships(
                Relationship::builder()
                    .r#type(RelationshipType::Value)
                    .ids("v1")
                    .build(),
            )
            .build();
        let value_block = Block::builder()
            .block_type(BlockType::KeyValueSet)
            .id("v1")
            .entity_types(EntityType::Value)
            .relationships(child_rel(&["vw1"]))
            .build();

        let blocks = vec![key_block, value_block, word("kw1", "Name"), word("vw1", "Alice")];
        let chunks = form_chunks(&blocks);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "Name: Alice");
        assert_eq!(chunks[0].metadata[meta::TYPE], "form");
        assert_eq!(chunks[0].metadata[meta::KEY], "Name");
    }

    #[test]
    fn value_entity_blocks_do_not_emit_form_chunks() {
        let lone_value = Block::builder()
            .block_type(BlockType::KeyValueSet)
            .id("v9")
            .entity_types(EntityType::Value)
            .build();
        assert!(form_chunks(&[lone_value]).is_empty());
    }
}
