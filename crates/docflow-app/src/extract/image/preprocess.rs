//! Fixed-order image preprocessing applied before OCR.
//!
//! Every stage is a pure `image -> image` transform on the grayscale buffer.
//! A stage returning no image is a fatal pipeline error.

use image::imageops;
use image::{DynamicImage, GrayImage, Luma};

use crate::config::PreprocessConfig;

use super::super::ExtractError;

/// A single preprocessing stage.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;
    fn apply(&self, image: GrayImage) -> Option<GrayImage>;
}

/// Gaussian blur denoise.
pub struct Denoise {
    pub strength: f32,
}

impl Preprocessor for Denoise {
    fn name(&self) -> &'static str {
        "denoise"
    }

    fn apply(&self, image: GrayImage) -> Option<GrayImage> {
        if self.strength <= 0.0 {
            return Some(image);
        }
        Some(imageops::blur(&image, self.strength))
    }
}

/// Fixed contrast stretch; scanned text benefits from a mild boost.
pub struct ContrastNormalize;

impl Preprocessor for ContrastNormalize {
    fn name(&self) -> &'static str {
        "contrast_normalize"
    }

    fn apply(&self, image: GrayImage) -> Option<GrayImage> {
        Some(imageops::contrast(&image, 20.0))
    }
}

/// Rotates the page upright when the detected skew is inside the angle limit,
/// filling exposed background white.
pub struct Deskew {
    pub angle_limit: f32,
}

impl Preprocessor for Deskew {
    fn name(&self) -> &'static str {
        "deskew"
    }

    fn apply(&self, image: GrayImage) -> Option<GrayImage> {
        let angle = detect_skew_angle(&image, self.angle_limit);
        if angle.abs() < self.angle_limit && angle != 0.0 {
            Some(rotate_about_center(&image, -angle))
        } else {
            Some(image)
        }
    }
}

/// Local-mean adaptive threshold: a pixel turns black iff it is darker than
/// the mean of its `block_size` window by more than `constant`.
pub struct AdaptiveThreshold {
    pub block_size: u32,
    pub constant: f32,
}

impl Preprocessor for AdaptiveThreshold {
    fn name(&self) -> &'static str {
        "adaptive_threshold"
    }

    fn apply(&self, image: GrayImage) -> Option<GrayImage> {
        Some(adaptive_threshold(&image, self.block_size, self.constant))
    }
}

/// Unsharp mask.
pub struct Sharpen {
    pub strength: f32,
}

impl Preprocessor for Sharpen {
    fn name(&self) -> &'static str {
        "sharpen"
    }

    fn apply(&self, image: GrayImage) -> Option<GrayImage> {
        if self.strength <= 0.0 {
            return Some(image);
        }
        Some(imageops::unsharpen(&image, self.strength, 1))
    }
}

/// Build the fixed pipeline for the given settings.
pub fn pipeline(cfg: &PreprocessConfig) -> Vec<Box<dyn Preprocessor>> {
    vec![
        Box::new(Denoise {
            strength: cfg.denoise_strength,
        }),
        Box::new(ContrastNormalize),
        Box::new(Deskew {
            angle_limit: cfg.deskew_angle_limit,
        }),
        Box::new(AdaptiveThreshold {
            block_size: cfg.adaptive_block_size,
            constant: cfg.adaptive_constant,
        }),
        Box::new(Sharpen {
            strength: cfg.sharpen_strength,
        }),
    ]
}

/// Run grayscale conversion plus the fixed stage order.
pub fn run(cfg: &PreprocessConfig, image: &DynamicImage) -> Result<GrayImage, ExtractError> {
    let mut current = image.to_luma8();
    for stage in pipeline(cfg) {
        current = stage.apply(current).ok_or(ExtractError::Preprocess {
            stage: stage.name(),
            message: "stage produced no image".to_string(),
        })?;
    }
    Ok(current)
}

fn adaptive_threshold(image: &GrayImage, block_size: u32, constant: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image.clone();
    }

    // Summed-area table over pixel values; window means come out in O(1).
    let w = width as usize;
    let h = height as usize;
    let mut integral = vec![0u64; (w + 1) * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += u64::from(image.get_pixel(x as u32, y as u32).0[0]);
            integral[(y + 1) * (w + 1) + (x + 1)] = integral[y * (w + 1) + (x + 1)] + row_sum;
        }
    }

    let half = (block_size / 2) as i64;
    let mut out = GrayImage::from_pixel(width, height, Luma([255u8]));

    for y in 0..h as i64 {
        for x in 0..w as i64 {
            let x0 = (x - half).max(0) as usize;
            let y0 = (y - half).max(0) as usize;
            let x1 = ((x + half).min(w as i64 - 1) + 1) as usize;
            let y1 = ((y + half).min(h as i64 - 1) + 1) as usize;

            let sum = integral[y1 * (w + 1) + x1] + integral[y0 * (w + 1) + x0]
                - integral[y0 * (w + 1) + x1]
                - integral[y1 * (w + 1) + x0];
            let count = ((x1 - x0) * (y1 - y0)) as f32;
            let mean = sum as f32 / count;

            let pixel = f32::from(image.get_pixel(x as u32, y as u32).0[0]);
            if pixel < mean - constant {
                out.put_pixel(x as u32, y as u32, Luma([0u8]));
            }
        }
    }

    out
}

/// Projection-profile skew estimate: the rotation angle whose horizontal
/// projection of dark pixels is sharpest. Works on a downscaled copy and only
/// searches inside `limit` degrees.
fn detect_skew_angle(image: &GrayImage, limit: f32) -> f32 {
    const TARGET_WIDTH: u32 = 256;
    const STEP: f32 = 0.5;

    if limit <= 0.0 {
        return 0.0;
    }

    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return 0.0;
    }
    let scale = if width > TARGET_WIDTH {
        let target_height = ((height * TARGET_WIDTH) / width).max(1);
        imageops::resize(image, TARGET_WIDTH, target_height, imageops::FilterType::Triangle)
    } else {
        image.clone()
    };

    let dark: Vec<(f32, f32)> = scale
        .enumerate_pixels()
        .filter(|(_, _, pixel)| pixel.0[0] < 128)
        .map(|(x, y, _)| (x as f32, y as f32))
        .collect();
    if dark.len() < 32 {
        return 0.0;
    }

    // Projections can go negative by up to width * sin(limit); pad both ends.
    let margin = (scale.width() as f32 * limit.to_radians().sin()).abs().ceil() as usize + 1;
    let bins = scale.height() as usize + 2 * margin;
    let mut best_angle = 0.0f32;
    let mut best_score = f64::MIN;

    let mut angle = -limit;
    while angle <= limit {
        let (sin, cos) = angle.to_radians().sin_cos();
        let mut histogram = vec![0u32; bins];
        for &(x, y) in &dark {
            let projected = -x * sin + y * cos;
            let bin = projected.round() as i64 + margin as i64;
            if bin >= 0 && (bin as usize) < bins {
                histogram[bin as usize] += 1;
            }
        }
        let score: f64 = histogram.iter().map(|&count| f64::from(count).powi(2)).sum();
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
        angle += STEP;
    }

    best_angle
}

/// Nearest-neighbor rotation about the image center with white fill.
fn rotate_about_center(image: &GrayImage, angle_deg: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let mut out = GrayImage::from_pixel(width, height, Luma([255u8]));

    for y in 0..height {
        for x in 0..width {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let sx = cos * dx + sin * dy + cx - 0.5;
            let sy = -sin * dx + cos * dy + cy - 0.5;
            let (sx, sy) = (sx.round(), sy.round());
            if sx >= 0.0 && sy >= 0.0 && (sx as u32) < width && (sy as u32) < height {
                out.put_pixel(x, y, *image.get_pixel(sx as u32, sy as u32));
            }
        }
    }

    out
}
