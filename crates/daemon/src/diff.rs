//! Pixel diff worker pool
//!
//! Comparisons run on the blocking thread pool; a semaphore bounds how many run
//! at once so pixel work never starves result ingestion.

use async_trait::async_trait;
use image::{GenericImageView, Pixel, Rgba, RgbaImage};
use snapreport_common::{DiffRequest, DiffWorker, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::DiffConfig;

/// Comparison settings resolved from config and per-screenshot options
#[derive(Debug, Clone, Copy, PartialEq)]
struct Thresholds {
    tolerance: f64,
    antialiasing_tolerance: f64,
    diff_color: Rgba<u8>,
}

/// Outcome of one comparison
#[derive(Debug, Clone, PartialEq)]
pub struct PixelDiff {
    pub diff_pixels: u64,
    pub total_pixels: u64,
    pub width: u32,
    pub height: u32,
}

/// Writes diff images on the blocking pool
#[derive(Clone)]
pub struct PixelDiffWorker {
    config: DiffConfig,
    permits: Arc<Semaphore>,
}

impl PixelDiffWorker {
    pub fn new(config: DiffConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.workers.max(1)));
        Self { config, permits }
    }

    fn thresholds(&self, request: &DiffRequest) -> Thresholds {
        let color = request
            .options
            .diff_color
            .as_deref()
            .unwrap_or(&self.config.diff_color);

        Thresholds {
            tolerance: request.options.tolerance.unwrap_or(self.config.tolerance),
            antialiasing_tolerance: request
                .options
                .antialiasing_tolerance
                .unwrap_or(self.config.antialiasing_tolerance),
            diff_color: parse_color(color).unwrap_or(Rgba([255, 0, 255, 255])),
        }
    }
}

#[async_trait]
impl DiffWorker for PixelDiffWorker {
    async fn save_diff_to(&self, request: DiffRequest, dest: &Path) -> Result<()> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| Error::DiffComputation(e.to_string()))?;

        let thresholds = self.thresholds(&request);
        let dest = dest.to_path_buf();

        let diff = tokio::task::spawn_blocking(move || {
            write_diff(&request.reference, &request.current, &dest, thresholds)
        })
        .await
        .map_err(|e| Error::DiffComputation(e.to_string()))??;

        debug!(
            "Diff {}x{}: {} of {} pixels differ",
            diff.width, diff.height, diff.diff_pixels, diff.total_pixels
        );
        Ok(())
    }
}

/// Parse `#rrggbb`
fn parse_color(value: &str) -> Option<Rgba<u8>> {
    let hex = value.strip_prefix('#').unwrap_or(value);
    if hex.len() != 6 {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(hex.get(range)?, 16).ok();
    Some(Rgba([channel(0..2)?, channel(2..4)?, channel(4..6)?, 255]))
}

fn write_diff(reference: &Path, current: &Path, dest: &Path, thresholds: Thresholds) -> Result<PixelDiff> {
    let open = |path: &Path| {
        image::open(path).map_err(|e| Error::DiffComputation(format!("{}: {}", path.display(), e)))
    };
    let reference = open(reference)?.to_rgba8();
    let current = open(current)?.to_rgba8();

    let (diff_img, diff) = compare(&reference, &current, thresholds);

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    diff_img
        .save(dest)
        .map_err(|e| Error::DiffComputation(format!("{}: {}", dest.display(), e)))?;

    Ok(diff)
}

/// Compare two images over the larger of both sizes.
///
/// Differing pixels are painted with the diff color; equal ones are dimmed
/// copies of the current image. Pixels outside either image always differ.
fn compare(reference: &RgbaImage, current: &RgbaImage, thresholds: Thresholds) -> (RgbaImage, PixelDiff) {
    let width = reference.width().max(current.width());
    let height = reference.height().max(current.height());

    let mut diff_img = RgbaImage::new(width, height);
    let mut diff_pixels = 0u64;

    for y in 0..height {
        for x in 0..width {
            let in_reference = reference.in_bounds(x, y);
            let in_current = current.in_bounds(x, y);

            let differs = match (in_reference, in_current) {
                (true, true) => {
                    let expected = reference.get_pixel(x, y);
                    let actual = current.get_pixel(x, y);
                    pixels_differ(expected, actual, thresholds.tolerance)
                        && !is_antialiased(reference, x, y, actual, thresholds.antialiasing_tolerance)
                }
                _ => true,
            };

            if differs {
                diff_pixels += 1;
                diff_img.put_pixel(x, y, thresholds.diff_color);
            } else {
                let channels = current.get_pixel(x, y).channels();
                diff_img.put_pixel(
                    x,
                    y,
                    Rgba([channels[0] / 2, channels[1] / 2, channels[2] / 2, 128]),
                );
            }
        }
    }

    let diff = PixelDiff {
        diff_pixels,
        total_pixels: width as u64 * height as u64,
        width,
        height,
    };
    (diff_img, diff)
}

/// Check if two pixels differ by more than `tolerance` in any channel
fn pixels_differ(a: &Rgba<u8>, b: &Rgba<u8>, tolerance: f64) -> bool {
    a.channels()
        .iter()
        .zip(b.channels())
        .any(|(x, y)| (*x as f64 - *y as f64).abs() > tolerance)
}

/// A differing pixel that matches one of its reference neighbours is treated as
/// an antialiasing artifact
fn is_antialiased(reference: &RgbaImage, x: u32, y: u32, actual: &Rgba<u8>, tolerance: f64) -> bool {
    if tolerance <= 0.0 {
        return false;
    }

    let (width, height) = reference.dimensions();
    for ny in y.saturating_sub(1)..=(y + 1).min(height - 1) {
        for nx in x.saturating_sub(1)..=(x + 1).min(width - 1) {
            if (nx, ny) == (x, y) {
                continue;
            }
            if !pixels_differ(reference.get_pixel(nx, ny), actual, tolerance) {
                return true;
            }
        }
    }
    false
}
