//! Heatmap box extraction
//!
//! Binarizes the detection model's probability raster and turns each
//! external connected component into a padded bounding box.

use image::{GrayImage, Luma};
use imageproc::contours::{find_contours, BorderType, Contour};
use tracing::debug;

use super::error::{VisionError, VisionResult};
use super::geometry::{expand_with_factor, BoundingBox, ContourRect, ImageSize, DEFAULT_OFFSET_FACTOR};
use super::resources::ByteSize;

/// Single-channel probability raster produced by the detection model
#[derive(Debug, Clone)]
pub struct Heatmap {
    /// Row-major probabilities in [0, 1]
    pub data: Vec<f32>,
    /// Declared raster dimensions
    pub size: ImageSize,
}

impl Heatmap {
    pub fn new(data: Vec<f32>, size: ImageSize) -> Self {
        Self { data, size }
    }

    /// Size of the backing buffer in bytes
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

impl ByteSize for Heatmap {
    fn byte_size(&self) -> usize {
        self.byte_len()
    }
}

/// Configuration for box extraction
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// 8-bit binarization threshold, pixels strictly above are foreground
    pub threshold: u8,
    /// Rectangles with width or height at or below this are noise
    pub min_side: i32,
    /// Margin factor handed to the geometry transform
    pub offset_factor: f32,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            threshold: 77,
            min_side: 2,
            offset_factor: DEFAULT_OFFSET_FACTOR,
        }
    }
}

/// Converts heatmaps into candidate text boxes
#[derive(Debug, Clone, Default)]
pub struct HeatmapBoxExtractor {
    config: ExtractorConfig,
}

impl HeatmapBoxExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ExtractorConfig) -> Self {
        Self { config }
    }

    /// Extract boxes from a heatmap
    ///
    /// Boxes come out in reverse order of discovery. Callers associate
    /// downstream results through [`BoundingBox::id`], never by position.
    pub fn extract(&self, heatmap: &Heatmap, image_size: ImageSize) -> VisionResult<Vec<BoundingBox>> {
        let expected = image_size.area();
        if heatmap.data.len() != expected {
            return Err(VisionError::ShapeMismatch {
                expected,
                actual: heatmap.data.len(),
                height: image_size.height,
                width: image_size.width,
            });
        }

        let gray = to_gray(&heatmap.data, image_size)?;
        let binary = binarize(&gray, self.config.threshold);
        let opened = open_2x2(&binary);

        let mut boxes = Vec::new();
        let external = find_contours::<i32>(&opened)
            .into_iter()
            .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none());

        for (id, contour) in external.enumerate() {
            let Some(rect) = bounding_rect(&contour) else {
                continue;
            };
            if rect.width > self.config.min_side && rect.height > self.config.min_side {
                boxes.push(expand_with_factor(&rect, id, image_size, self.config.offset_factor));
            }
        }
        boxes.reverse();

        debug!("Extracted {} boxes from {}x{} heatmap", boxes.len(), image_size.width, image_size.height);
        Ok(boxes)
    }
}

/// Scale probabilities to an 8-bit raster, rounding to the nearest level
fn to_gray(data: &[f32], size: ImageSize) -> VisionResult<GrayImage> {
    let pixels: Vec<u8> = data
        .iter()
        .map(|&p| if p.is_nan() { 0 } else { (p * 255.0).round().clamp(0.0, 255.0) as u8 })
        .collect();
    let actual = pixels.len();
    GrayImage::from_raw(size.width, size.height, pixels).ok_or(VisionError::ShapeMismatch {
        expected: size.area(),
        actual,
        height: size.height,
        width: size.width,
    })
}

fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = image.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = if pixel.0[0] > threshold { 255 } else { 0 };
    }
    out
}

/// Morphological opening with a 2x2 square structuring element
///
/// A foreground pixel survives only if it lies inside some 2x2 block that is
/// entirely foreground.
fn open_2x2(binary: &GrayImage) -> GrayImage {
    let (width, height) = binary.dimensions();
    let mut out = GrayImage::new(width, height);
    if width < 2 || height < 2 {
        return out;
    }

    let on = |x: u32, y: u32| binary.get_pixel(x, y).0[0] > 0;
    for y in 0..height - 1 {
        for x in 0..width - 1 {
            if on(x, y) && on(x + 1, y) && on(x, y + 1) && on(x + 1, y + 1) {
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    out.put_pixel(x + dx, y + dy, Luma([255]));
                }
            }
        }
    }
    out
}

/// Inclusive pixel extent of a contour
fn bounding_rect(contour: &Contour<i32>) -> Option<ContourRect> {
    let first = contour.points.first()?;
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (first.x, first.y, first.x, first.y);
    for p in &contour.points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Some(ContourRect::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1))
}
