//! Local OCR step. Engines are not safe to share across concurrent calls, so
//! every invocation builds a fresh one from the configured settings.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config::OcrEngineConfig;

use super::super::ExtractError;

/// Word-level recognition result.
#[derive(Debug, Clone)]
pub struct OcrWord {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub text: String,
    /// Engine-native confidence in [0, 100].
    pub confidence: f32,
}

/// Outcome of one OCR pass, confidences normalized to [0, 1].
#[derive(Debug, Clone)]
pub struct OcrOutcome {
    pub text: String,
    pub confidence: f64,
    pub regions: Vec<Value>,
}

fn engine_args(cfg: &OcrEngineConfig) -> rusty_tesseract::Args {
    let mut config_variables = HashMap::new();
    config_variables.insert("load_system_dawg".to_string(), "1".to_string());
    config_variables.insert(
        "language_model_penalty_non_dict_word".to_string(),
        "0.8".to_string(),
    );
    if !cfg.user_words.is_empty() {
        config_variables.insert("user_words_suffix".to_string(), "user-words".to_string());
        config_variables.insert("user_patterns_suffix".to_string(), "user-patterns".to_string());
    }

    rusty_tesseract::Args {
        lang: cfg.languages.join("+"),
        config_variables,
        dpi: Some(300),
        psm: Some(cfg.page_seg_mode),
        oem: Some(3),
    }
}

/// Run OCR over a JPEG-encoded image. Blocking: call from a blocking task.
pub fn recognize(cfg: &OcrEngineConfig, jpeg: &[u8]) -> Result<OcrOutcome, ExtractError> {
    use std::io::Write;

    // The engine reads its input from disk; stage the JPEG in a temp file
    // that lives until both passes finish.
    let mut staged = tempfile::Builder::new()
        .prefix("docflow-ocr-")
        .suffix(".jpg")
        .tempfile()
        .map_err(|err| ExtractError::Io(err.to_string()))?;
    staged
        .write_all(jpeg)
        .and_then(|()| staged.flush())
        .map_err(|err| ExtractError::Io(err.to_string()))?;

    let input = rusty_tesseract::Image::from_path(staged.path())
        .map_err(|err| ExtractError::Engine(err.to_string()))?;
    let args = engine_args(cfg);

    let text = rusty_tesseract::image_to_string(&input, &args)
        .map_err(|err| ExtractError::Engine(err.to_string()))?;

    let words = match rusty_tesseract::image_to_data(&input, &args) {
        Ok(data) => data
            .data
            .into_iter()
            // Level 5 entries are words; structural rows carry conf -1.
            .filter(|entry| entry.level == 5 && entry.conf >= 0.0)
            .map(|entry| OcrWord {
                x: entry.left,
                y: entry.top,
                width: entry.width,
                height: entry.height,
                text: entry.text,
                confidence: entry.conf,
            })
            .collect(),
        Err(err) => {
            tracing::warn!(%err, "word-box extraction failed; reporting text only");
            Vec::new()
        }
    };

    Ok(post_process(text, words, cfg.min_confidence))
}

/// Drop sub-confidence boxes, average the survivors, and shape the region
/// metadata. Scores leave this module in the normalized [0, 1] convention.
pub fn post_process(text: String, words: Vec<OcrWord>, min_confidence: f32) -> OcrOutcome {
    let surviving: Vec<OcrWord> = words
        .into_iter()
        .filter(|word| word.confidence >= min_confidence)
        .collect();

    let confidence = if surviving.is_empty() {
        0.0
    } else {
        let total: f64 = surviving.iter().map(|word| f64::from(word.confidence)).sum();
        total / surviving.len() as f64 / 100.0
    };

    let regions = surviving
        .iter()
        .map(|word| {
            json!({
                "x": word.x,
                "y": word.y,
                "width": word.width,
                "height": word.height,
                "text": word.text,
                "confidence": f64::from(word.confidence) / 100.0,
            })
        })
        .collect();

    OcrOutcome {
        text,
        confidence,
        regions,
    }
}
