//! Local raster-image extraction: preprocessing pipeline, per-call OCR
//! engine, optional table-grid recovery, and vision-LLM augmentation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use image::{imageops, DynamicImage, GrayImage};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{ExtractConfig, OcrEngineConfig, PreprocessConfig, TableConfig, VisionConfig};
use crate::model::{meta, DocumentChunk, DocumentMetadata, FileKind};

use super::{sha256_hex, ExtractError, Extractor};

pub mod ocr;
pub mod preprocess;
pub mod table;
pub mod vision;

use vision::VisionPool;

const OCR_SOURCE: &str = "tesseract";
const VISION_SOURCE: &str = "vision";
const JPEG_QUALITY: u8 = 100;

fn vision_prompt(ocr_text: &str) -> String {
    format!(
        "Transcribe the text in this document image as accurately as possible.\n\
         An OCR engine produced the following reading; use it to cross-check \
         your transcription and fix recognition mistakes (0/O, 1/I/l, rn/m, \
         merged or missing words):\n\n{ocr_text}\n\n\
         Keep the original layout where possible and reply with the corrected \
         text only."
    )
}

fn encode_jpeg(image: &GrayImage, quality: u8) -> Result<Vec<u8>, ExtractError> {
    let mut buffer = Vec::new();
    let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buffer, quality);
    encoder
        .encode_image(&DynamicImage::ImageLuma8(image.clone()))
        .map_err(|err| ExtractError::Decode(err.to_string()))?;
    Ok(buffer)
}

pub struct LocalImageExtractor {
    ocr: OcrEngineConfig,
    preprocess: PreprocessConfig,
    table: TableConfig,
    vision_cfg: VisionConfig,
    vision: Option<VisionPool>,
}

impl LocalImageExtractor {
    pub fn new(cfg: &ExtractConfig) -> Self {
        let vision = cfg.vision.enabled.then(|| VisionPool::new(&cfg.vision));
        Self {
            ocr: cfg.ocr.clone(),
            preprocess: cfg.preprocess.clone(),
            table: cfg.table.clone(),
            vision_cfg: cfg.vision.clone(),
            vision,
        }
    }

    /// Recover the table grid (when enabled) and OCR each cell crop.
    fn extract_table(
        processed: &GrayImage,
        table_cfg: &TableConfig,
        ocr_cfg: &OcrEngineConfig,
    ) -> Option<DocumentChunk> {
        let edges = table::sobel_edges(processed, table_cfg.edge_threshold);
        let mut grid = table::detect_grid(&edges, table_cfg)?;

        let (width, height) = processed.dimensions();
        for cell in &mut grid.cells {
            let bounds = cell.bounds;
            let x = bounds.min_x.min(width);
            let y = bounds.min_y.min(height);
            let w = bounds.width().min(width - x);
            let h = bounds.height().min(height - y);
            if w == 0 || h == 0 {
                continue;
            }

            let crop = imageops::crop_imm(processed, x, y, w, h).to_image();
            let jpeg = match encode_jpeg(&crop, JPEG_QUALITY) {
                Ok(jpeg) => jpeg,
                Err(err) => {
                    tracing::warn!(%err, "failed to encode table cell");
                    continue;
                }
            };
            match ocr::recognize(ocr_cfg, &jpeg) {
                Ok(outcome) => cell.content = outcome.text.trim().to_string(),
                Err(err) => {
                    tracing::warn!(%err, "failed to recognize table cell");
                }
            }
        }

        let content = grid
            .cells
            .chunks(grid.cols)
            .map(|row| {
                row.iter()
                    .map(|cell| cell.content.as_str())
                    .collect::<Vec<_>>()
                    .join(" | ")
            })
            .collect::<Vec<_>>()
            .join("\n");

        Some(
            DocumentChunk::new(content)
                .with(meta::SOURCE, OCR_SOURCE)
                .with(meta::TYPE, "table")
                .with(meta::ROWS, grid.rows)
                .with(meta::COLS, grid.cols),
        )
    }
}

#[async_trait]
impl Extractor for LocalImageExtractor {
    fn can_process(&self, mime: &str) -> bool {
        matches!(
            mime,
            "image/jpeg" | "image/jpg" | "image/png" | "image/tiff"
        )
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        data: Bytes,
    ) -> Result<Vec<DocumentChunk>, ExtractError> {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let decoded = image::load_from_memory(&data)
            .map_err(|err| ExtractError::Decode(err.to_string()))?;

        let preprocess_cfg = self.preprocess.clone();
        let processed = tokio::task::spawn_blocking(move || preprocess::run(&preprocess_cfg, &decoded))
            .await
            .map_err(|err| ExtractError::Io(err.to_string()))??;

        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        // The engine consumes the JPEG re-encoding of the preprocessed image;
        // the same bytes feed the vision model later.
        let jpeg = encode_jpeg(&processed, JPEG_QUALITY)?;

        let ocr_cfg = self.ocr.clone();
        let ocr_input = jpeg.clone();
        let outcome = tokio::task::spawn_blocking(move || ocr::recognize(&ocr_cfg, &ocr_input))
            .await
            .map_err(|err| ExtractError::Io(err.to_string()))??;

        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled);
        }

        let mut chunks = vec![DocumentChunk::new(outcome.text.clone())
            .with(meta::SOURCE, OCR_SOURCE)
            .with(meta::CONFIDENCE, outcome.confidence)
            .with(meta::REGIONS, Value::Array(outcome.regions.clone()))];

        if self.table.enabled {
            let processed_for_table = processed.clone();
            let table_cfg = self.table.clone();
            let ocr_cfg = self.ocr.clone();
            let table_chunk = tokio::task::spawn_blocking(move || {
                Self::extract_table(&processed_for_table, &table_cfg, &ocr_cfg)
            })
            .await
            .map_err(|err| ExtractError::Io(err.to_string()))?;
            if let Some(chunk) = table_chunk {
                chunks.push(chunk);
            }
        }

        // Vision augmentation is best-effort: the OCR chunk above is emitted
        // no matter what happens here.
        if let Some(pool) = &self.vision {
            match pool.get().await {
                Ok(client) => {
                    let prompt = vision_prompt(&outcome.text);
                    match client.analyze(cancel, &jpeg, &prompt).await {
                        Ok(text) if !text.trim().is_empty() => {
                            chunks.push(
                                DocumentChunk::new(text)
                                    .with(meta::SOURCE, VISION_SOURCE)
                                    .with(meta::MODEL, self.vision_cfg.model.as_str()),
                            );
                        }
                        Ok(_) => {}
                        Err(err) if err.is_cancelled() => return Err(err),
                        Err(err) => {
                            tracing::warn!(%err, "vision augmentation skipped");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, "vision augmentation skipped");
                }
            }
        }

        Ok(chunks)
    }

    async fn extract_metadata(&self, data: Bytes) -> Result<DocumentMetadata, ExtractError> {
        let hash = sha256_hex(&data);
        let decoded = image::load_from_memory(&data)
            .map_err(|err| ExtractError::Decode(err.to_string()))?;
        let mime = image::guess_format(&data)
            .map(|format| format.to_mime_type().to_string())
            .unwrap_or_else(|_| "application/octet-stream".to_string());

        let mut extra = Map::new();
        extra.insert("width".to_string(), decoded.width().into());
        extra.insert("height".to_string(), decoded.height().into());
        extra.insert("format".to_string(), mime.clone().into());

        Ok(DocumentMetadata {
            id: hash[..8].to_string(),
            title: String::new(),
            author: String::new(),
            file_kind: FileKind::Image,
            file_size: data.len() as u64,
            mime_type: mime,
            pages: 1,
            created_at: Utc::now(),
            hash,
            extra,
        })
    }

    async fn close(&self) {
        if let Some(pool) = &self.vision {
            pool.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn jpeg_round_trip_keeps_dimensions() {
        let img = GrayImage::from_pixel(24, 16, Luma([200u8]));
        let jpeg = encode_jpeg(&img, JPEG_QUALITY).expect("encode");
        let back = image::load_from_memory(&jpeg).expect("decode");
        assert_eq!((back.width(), back.height()), (24, 16));
    }

    #[test]
    fn prompt_embeds_ocr_reading() {
        let prompt = vision_prompt("Name: Alice");
        assert!(prompt.contains("Name: Alice"));
        assert!(prompt.contains("cross-check"));
    }

    #[tokio::test]
    async fn metadata_reports_dimensions_and_hash() {
        let img = GrayImage::from_pixel(8, 4, Luma([127u8]));
        let mut png = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .expect("encode png");
        let data = Bytes::from(png);

        let extractor = LocalImageExtractor::new(&ExtractConfig::default());
        let metadata = extractor.extract_metadata(data.clone()).await.expect("metadata");
        assert_eq!(metadata.file_kind, FileKind::Image);
        assert_eq!(metadata.extra["width"], 8);
        assert_eq!(metadata.extra["height"], 4);
        assert_eq!(metadata.hash, sha256_hex(&data));
        assert_eq!(metadata.mime_type, "image/png");
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let extractor = LocalImageExtractor::new(&ExtractConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = extractor
            .process(&cancel, Bytes::from_static(&[0u8; 4]))
            .await
            .expect_err("cancelled");
        assert!(err.is_cancelled());
    }
}
