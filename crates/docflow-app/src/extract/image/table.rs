//! Grid detection on binarized page images: Sobel edges, run-length line
//! scanning, collinear merging, and cell synthesis from line crossings.

use image::{GrayImage, Luma};

use crate::config::TableConfig;

/// Axis-aligned pixel rectangle, end-exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }
}

/// A detected table cell; `content` is filled by OCR over the cropped region.
#[derive(Debug, Clone)]
pub struct TableCell {
    pub bounds: Rect,
    pub content: String,
}

/// Detected grid: cells in row-major order.
#[derive(Debug, Clone)]
pub struct TableGrid {
    pub rows: usize,
    pub cols: usize,
    pub cells: Vec<TableCell>,
}

/// Sobel gradient magnitude; a pixel is an edge (black) iff the magnitude
/// exceeds the threshold.
pub fn sobel_edges(image: &GrayImage, threshold: f32) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut out = GrayImage::from_pixel(width, height, Luma([255u8]));
    if width < 3 || height < 3 {
        return out;
    }

    let value = |x: u32, y: u32| f32::from(image.get_pixel(x, y).0[0]);

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = (value(x + 1, y - 1) + 2.0 * value(x + 1, y) + value(x + 1, y + 1))
                - (value(x - 1, y - 1) + 2.0 * value(x - 1, y) + value(x - 1, y + 1));
            let gy = (value(x - 1, y + 1) + 2.0 * value(x, y + 1) + value(x + 1, y + 1))
                - (value(x - 1, y - 1) + 2.0 * value(x, y - 1) + value(x + 1, y - 1));
            let magnitude = (gx * gx + gy * gy).sqrt();
            if magnitude > threshold {
                out.put_pixel(x, y, Luma([0u8]));
            }
        }
    }

    out
}

/// Detect the table structure of a binarized image. Returns `None` when fewer
/// than two lines exist on either axis (no cell can be formed).
pub fn detect_grid(image: &GrayImage, cfg: &TableConfig) -> Option<TableGrid> {
    let horizontal = merge_collinear(
        scan_horizontal(image, cfg.min_line_length, cfg.max_line_gap),
        true,
        cfg.max_line_gap,
    );
    let vertical = merge_collinear(
        scan_vertical(image, cfg.min_line_length, cfg.max_line_gap),
        false,
        cfg.max_line_gap,
    );

    if horizontal.len() < 2 || vertical.len() < 2 {
        return None;
    }

    let rows = horizontal.len() - 1;
    let cols = vertical.len() - 1;
    let mut cells = Vec::with_capacity(rows * cols);

    for row in 0..rows {
        for col in 0..cols {
            cells.push(TableCell {
                bounds: Rect {
                    min_x: vertical[col].min_x,
                    min_y: horizontal[row].min_y,
                    max_x: vertical[col + 1].max_x,
                    max_y: horizontal[row + 1].max_y,
                },
                content: String::new(),
            });
        }
    }

    Some(TableGrid { rows, cols, cells })
}

fn is_dark(pixel: &Luma<u8>) -> bool {
    pixel.0[0] < 128
}

/// Scan each row for dark runs at least `min_length` long, bridging gaps of
/// up to `max_gap` light pixels inside a run.
fn scan_horizontal(image: &GrayImage, min_length: u32, max_gap: u32) -> Vec<Rect> {
    let (width, height) = image.dimensions();
    let mut lines = Vec::new();

    for y in 0..height {
        let mut start: Option<u32> = None;
        let mut dark_count = 0u32;
        let mut gap = 0u32;

        for x in 0..width {
            if is_dark(image.get_pixel(x, y)) {
                if start.is_none() {
                    start = Some(x);
                }
                dark_count += 1;
                gap = 0;
            } else if let Some(run_start) = start {
                gap += 1;
                if gap > max_gap {
                    if dark_count >= min_length {
                        lines.push(Rect {
                            min_x: run_start,
                            min_y: y,
                            max_x: x - gap + 1,
                            max_y: y + 1,
                        });
                    }
                    start = None;
                    dark_count = 0;
                    gap = 0;
                }
            }
        }
        if let Some(run_start) = start {
            if dark_count >= min_length {
                lines.push(Rect {
                    min_x: run_start,
                    min_y: y,
                    max_x: width,
                    max_y: y + 1,
                });
            }
        }
    }

    lines
}

fn scan_vertical(image: &GrayImage, min_length: u32, max_gap: u32) -> Vec<Rect> {
    let (width, height) = image.dimensions();
    let mut lines = Vec::new();

    for x in 0..width {
        let mut start: Option<u32> = None;
        let mut dark_count = 0u32;
        let mut gap = 0u32;

        for y in 0..height {
            if is_dark(image.get_pixel(x, y)) {
                if start.is_none() {
                    start = Some(y);
                }
                dark_count += 1;
                gap = 0;
            } else if let Some(run_start) = start {
                gap += 1;
                if gap > max_gap {
                    if dark_count >= min_length {
                        lines.push(Rect {
                            min_x: x,
                            min_y: run_start,
                            max_x: x + 1,
                            max_y: y - gap + 1,
                        });
                    }
                    start = None;
                    dark_count = 0;
                    gap = 0;
                }
            }
        }
        if let Some(run_start) = start {
            if dark_count >= min_length {
                lines.push(Rect {
                    min_x: x,
                    min_y: run_start,
                    max_x: x + 1,
                    max_y: height,
                });
            }
        }
    }

    lines
}

/// Merge segments on adjacent scanlines whose separation is within the gap;
/// a ruled line several pixels thick collapses into one segment.
fn merge_collinear(mut lines: Vec<Rect>, horizontal: bool, max_gap: u32) -> Vec<Rect> {
    if lines.len() < 2 {
        return lines;
    }

    if horizontal {
        lines.sort_by_key(|rect| (rect.min_y, rect.min_x));
    } else {
        lines.sort_by_key(|rect| (rect.min_x, rect.min_y));
    }

    let mut merged: Vec<Rect> = Vec::new();
    let mut current = lines[0];

    for line in lines.into_iter().skip(1) {
        let adjacent = if horizontal {
            line.min_y.saturating_sub(current.max_y) <= max_gap
        } else {
            line.min_x.saturating_sub(current.max_x) <= max_gap
        };

        if adjacent {
            current = Rect {
                min_x: current.min_x.min(line.min_x),
                min_y: current.min_y.min(line.min_y),
                max_x: current.max_x.max(line.max_x),
                max_y: current.max_y.max(line.max_y),
            };
        } else {
            merged.push(current);
            current = line;
        }
    }
    merged.push(current);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255u8]))
    }

    fn draw_h_line(img: &mut GrayImage, y: u32, x0: u32, x1: u32) {
        for x in x0..x1 {
            img.put_pixel(x, y, Luma([0u8]));
        }
    }

    fn draw_v_line(img: &mut GrayImage, x: u32, y0: u32, y1: u32) {
        for y in y0..y1 {
            img.put_pixel(x, y, Luma([0u8]));
        }
    }

    fn ruled_grid() -> GrayImage {
        // 3 horizontal and 3 vertical rules: a 2x2 grid.
        let mut img = white(120, 90);
        for y in [10u32, 45, 80] {
            draw_h_line(&mut img, y, 10, 110);
        }
        for x in [10u32, 60, 110] {
            draw_v_line(&mut img, x, 10, 81);
        }
        img
    }

    fn cfg() -> TableConfig {
        TableConfig {
            enabled: true,
            min_line_length: 50,
            max_line_gap: 5,
            edge_threshold: 30.0,
        }
    }

    #[test]
    fn grid_of_three_by_three_rules_yields_four_cells() {
        let grid = detect_grid(&ruled_grid(), &cfg()).expect("grid detected");
        assert_eq!(grid.rows, 2);
        assert_eq!(grid.cols, 2);
        assert_eq!(grid.cells.len(), 4);

        let first = grid.cells[0].bounds;
        assert!(first.min_x <= 10 && first.min_y <= 10);
        assert!(first.width() > 0 && first.height() > 0);
    }

    #[test]
    fn broken_rule_bridges_within_gap() {
        let mut img = white(120, 90);
        // One horizontal line with a 3px break, plus a pair of verticals and a
        // second horizontal so a grid can form.
        draw_h_line(&mut img, 10, 10, 60);
        draw_h_line(&mut img, 10, 63, 110);
        draw_h_line(&mut img, 80, 10, 110);
        draw_v_line(&mut img, 10, 10, 81);
        draw_v_line(&mut img, 110, 10, 81);

        let grid = detect_grid(&img, &cfg()).expect("bridged grid");
        assert_eq!(grid.rows, 1);
        assert_eq!(grid.cols, 1);
    }

    #[test]
    fn short_dashes_are_not_lines() {
        let mut img = white(120, 40);
        draw_h_line(&mut img, 10, 10, 30); // 20px < min_line_length
        draw_h_line(&mut img, 30, 10, 30);
        assert!(detect_grid(&img, &cfg()).is_none());
    }

    #[test]
    fn blank_page_has_no_grid() {
        assert!(detect_grid(&white(100, 100), &cfg()).is_none());
    }

    #[test]
    fn sobel_marks_step_edges() {
        let mut img = white(20, 20);
        for y in 0..20 {
            for x in 10..20 {
                img.put_pixel(x, y, Luma([0u8]));
            }
        }
        let edges = sobel_edges(&img, 30.0);
        // The vertical step around x=10 must be marked.
        assert_eq!(edges.get_pixel(10, 10).0[0], 0);
        // Flat regions stay white.
        assert_eq!(edges.get_pixel(3, 3).0[0], 255);
        assert_eq!(edges.get_pixel(17, 10).0[0], 255);
    }
}
