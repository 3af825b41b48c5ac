//! Frame data structures for captured images

use image::imageops::{self, FilterType};
use image::{RgbImage, RgbaImage};
use std::time::Instant;

use crate::vision::error::{VisionError, VisionResult};
use crate::vision::preprocess::rgba_to_rgb;
use crate::vision::resources::DeviceProfile;

/// A captured frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Raw RGBA pixel data
    pub data: Vec<u8>,
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
}

impl CapturedFrame {
    /// Create a new captured frame
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
        }
    }

    pub fn from_rgba(image: RgbaImage) -> Self {
        let (width, height) = image.dimensions();
        Self::new(image.into_raw(), width, height)
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Drop the alpha channel
    pub fn to_rgb(&self) -> VisionResult<RgbImage> {
        rgba_to_rgb(&self.data, self.width, self.height)
    }

    /// Downscale so the longer side fits the device's `max_dimension`
    pub fn fit_to_profile(self, profile: &DeviceProfile) -> VisionResult<Self> {
        let (width, height) = profile.fit_dimensions(self.width, self.height);
        if (width, height) == (self.width, self.height) {
            return Ok(self);
        }

        let expected = self.width as usize * self.height as usize * 4;
        let actual = self.data.len();
        let image = RgbaImage::from_raw(self.width, self.height, self.data).ok_or(VisionError::ShapeMismatch {
            expected,
            actual,
            height: self.height,
            width: self.width,
        })?;
        let resized = imageops::resize(&image, width, height, FilterType::Triangle);
        Ok(Self {
            timestamp: self.timestamp,
            ..Self::from_rgba(resized)
        })
    }
}
