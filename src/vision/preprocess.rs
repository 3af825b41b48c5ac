//! Image preprocessing for the detection and recognition models
//!
//! Handles frame conversion, canvas resizing and tensor packing.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array4, ArrayViewD};

use super::error::{VisionError, VisionResult};
use super::geometry::ImageSize;
use super::heatmap::Heatmap;
use crate::config::TensorLayout;

/// Scalar mean/std applied to every channel, in 0-255 units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelNorm {
    pub mean: f32,
    pub std: f32,
}

impl ChannelNorm {
    /// Build from mean/std expressed in [0, 1]
    pub fn from_unit(mean: f32, std: f32) -> Self {
        Self {
            mean: mean * 255.0,
            std: std * 255.0,
        }
    }

    #[inline]
    pub fn apply(&self, value: u8) -> f32 {
        (value as f32 - self.mean) / self.std
    }
}

/// Convert RGBA frame bytes to an RGB image
/// Note: CapturedFrame stores data as RGBA
pub fn rgba_to_rgb(data: &[u8], width: u32, height: u32) -> VisionResult<RgbImage> {
    let expected = width as usize * height as usize * 4;
    if data.len() != expected {
        return Err(VisionError::ShapeMismatch {
            expected,
            actual: data.len(),
            height,
            width,
        });
    }

    let rgb: Vec<u8> = data
        .chunks_exact(4)
        .flat_map(|px| [px[0], px[1], px[2]])
        .collect();

    RgbImage::from_raw(width, height, rgb).ok_or(VisionError::ShapeMismatch {
        expected: width as usize * height as usize * 3,
        actual: data.len() / 4 * 3,
        height,
        width,
    })
}

/// Nearest-neighbour resize onto the detection canvas
///
/// Aspect ratio is not preserved; box fractions are relative to this canvas.
pub fn resize_to_canvas(image: &RgbImage, size: ImageSize) -> RgbImage {
    if image.dimensions() == (size.width, size.height) {
        return image.clone();
    }
    imageops::resize(image, size.width, size.height, FilterType::Nearest)
}

/// Pack one image into a batch-of-one tensor
pub fn image_to_tensor(image: &RgbImage, norm: ChannelNorm, layout: TensorLayout) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((1, 3, h, w)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((1, h, w, 3)),
    };
    write_sample(&mut tensor, 0, image, norm, layout);
    tensor
}

/// Pack equally sized images into one `[N, ...]` tensor
pub fn batch_to_tensor(
    images: &[&RgbImage],
    norm: ChannelNorm,
    layout: TensorLayout,
) -> VisionResult<Array4<f32>> {
    let Some(first) = images.first() else {
        return Ok(match layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((0, 3, 0, 0)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((0, 0, 0, 3)),
        });
    };

    let (width, height) = first.dimensions();
    let (w, h, n) = (width as usize, height as usize, images.len());
    let mut tensor = match layout {
        TensorLayout::Nchw => Array4::<f32>::zeros((n, 3, h, w)),
        TensorLayout::Nhwc => Array4::<f32>::zeros((n, h, w, 3)),
    };

    for (i, image) in images.iter().enumerate() {
        if image.dimensions() != (width, height) {
            return Err(VisionError::ShapeMismatch {
                expected: w * h * 3,
                actual: image.as_raw().len(),
                height,
                width,
            });
        }
        write_sample(&mut tensor, i, image, norm, layout);
    }

    Ok(tensor)
}

fn write_sample(tensor: &mut Array4<f32>, index: usize, image: &RgbImage, norm: ChannelNorm, layout: TensorLayout) {
    for (x, y, pixel) in image.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            let value = norm.apply(pixel.0[c]);
            match layout {
                TensorLayout::Nchw => tensor[[index, c, y, x]] = value,
                TensorLayout::Nhwc => tensor[[index, y, x, c]] = value,
            }
        }
    }
}

/// Flatten a single-sample detection output into a heatmap
///
/// Accepts any shape whose element count matches the canvas, e.g.
/// `[1, 1, H, W]`, `[1, H, W, 1]` or `[H, W]`.
pub fn heatmap_from_output(output: ArrayViewD<f32>, size: ImageSize) -> VisionResult<Heatmap> {
    if output.len() != size.area() {
        return Err(VisionError::ShapeMismatch {
            expected: size.area(),
            actual: output.len(),
            height: size.height,
            width: size.width,
        });
    }
    Ok(Heatmap::new(output.iter().copied().collect(), size))
}
