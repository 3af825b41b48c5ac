//! Crop normalization
//!
//! Cuts one sub-image per box and fits it into the recognition model's fixed
//! input, preserving aspect ratio and zero-padding the remainder.

use image::imageops::{self, FilterType};
use image::RgbImage;
use tracing::{debug, warn};

use super::error::{VisionError, VisionResult};
use super::geometry::{BoundingBox, ImageSize, PixelBox};

/// Recognition input (height, width)
pub const DEFAULT_TARGET_SIZE: (u32, u32) = (32, 128);

/// A normalized crop ready for batching
#[derive(Debug, Clone)]
pub struct Crop {
    /// Exactly target-sized RGB pixels
    pub buffer: RgbImage,
    /// Box the crop was cut from
    pub source_box: BoundingBox,
    /// Crop rectangle in source pixel space
    pub pixel_bbox: PixelBox,
}

impl Crop {
    pub fn box_id(&self) -> usize {
        self.source_box.id
    }
}

/// Extracts and resizes crops to a fixed (height, width)
#[derive(Debug, Clone)]
pub struct CropNormalizer {
    target_height: u32,
    target_width: u32,
}

impl Default for CropNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_SIZE)
    }
}

impl CropNormalizer {
    /// `target_size` is (height, width)
    pub fn new(target_size: (u32, u32)) -> Self {
        Self {
            target_height: target_size.0.max(1),
            target_width: target_size.1.max(1),
        }
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_height, self.target_width)
    }

    /// Cut and fit the crop for one box
    ///
    /// `source` must be the canvas the boxes were detected on; box fractions
    /// are scaled by its dimensions.
    pub fn normalize(&self, source: &RgbImage, bbox: &BoundingBox) -> VisionResult<Crop> {
        let canvas = ImageSize::new(source.width(), source.height());
        let pixel_bbox = bbox.to_pixels(canvas);
        let degenerate = || VisionError::DegenerateCrop {
            box_id: bbox.id,
            width: pixel_bbox.width,
            height: pixel_bbox.height,
        };

        if pixel_bbox.is_degenerate() {
            return Err(degenerate());
        }

        let x0 = pixel_bbox.x.clamp(0, canvas.width as i64);
        let y0 = pixel_bbox.y.clamp(0, canvas.height as i64);
        let x1 = (pixel_bbox.x + pixel_bbox.width).clamp(0, canvas.width as i64);
        let y1 = (pixel_bbox.y + pixel_bbox.height).clamp(0, canvas.height as i64);
        if x1 <= x0 || y1 <= y0 {
            return Err(degenerate());
        }

        let region = imageops::crop_imm(
            source,
            x0 as u32,
            y0 as u32,
            (x1 - x0) as u32,
            (y1 - y0) as u32,
        )
        .to_image();

        Ok(Crop {
            buffer: self.fit_and_pad(&region),
            source_box: bbox.clone(),
            pixel_bbox,
        })
    }

    /// Normalize every box, skipping degenerate ones
    pub fn normalize_all(&self, source: &RgbImage, boxes: &[BoundingBox]) -> Vec<Crop> {
        let crops: Vec<Crop> = boxes
            .iter()
            .filter_map(|bbox| match self.normalize(source, bbox) {
                Ok(crop) => Some(crop),
                Err(e) => {
                    warn!("Skipping crop: {}", e);
                    None
                }
            })
            .collect();

        debug!("Normalized {} of {} boxes into crops", crops.len(), boxes.len());
        crops
    }

    /// Aspect-preserving resize dimensions as (width, height)
    pub fn resize_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let (tw, th) = (self.target_width as f32, self.target_height as f32);
        let (w, h) = (width as f32, height as f32);
        let aspect = tw / th;

        if aspect * h > w {
            let new_w = (th * w / h).round().clamp(1.0, tw) as u32;
            (new_w, self.target_height)
        } else {
            let new_h = (tw * h / w).round().clamp(1.0, th) as u32;
            (self.target_width, new_h)
        }
    }

    /// Resize with nearest-neighbour sampling and zero-pad to the target
    pub fn fit_and_pad(&self, image: &RgbImage) -> RgbImage {
        let (new_w, new_h) = self.resize_dimensions(image.width().max(1), image.height().max(1));
        let resized = imageops::resize(image, new_w, new_h, FilterType::Nearest);

        let mut canvas = RgbImage::new(self.target_width, self.target_height);
        imageops::replace(&mut canvas, &resized, 0, 0);
        canvas
    }
}
