//! Image Capture Layer
//!
//! Loads still images into [`CapturedFrame`]s for the extraction pipeline.

pub mod frame;

use anyhow::{Context, Result};
use std::path::Path;
use tracing::debug;

pub use frame::CapturedFrame;

/// Decode an image file into an RGBA frame
pub fn load_frame(path: &Path) -> Result<CapturedFrame> {
    let image = image::open(path).with_context(|| format!("Failed to open image {:?}", path))?;
    let frame = CapturedFrame::from_rgba(image.to_rgba8());
    debug!("Loaded {:?} ({}x{})", path, frame.width, frame.height);
    Ok(frame)
}

/// Decode encoded image bytes (PNG, JPEG, ...) into an RGBA frame
pub fn decode_frame(bytes: &[u8]) -> Result<CapturedFrame> {
    let image = image::load_from_memory(bytes).context("Failed to decode image data")?;
    Ok(CapturedFrame::from_rgba(image.to_rgba8()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let image = RgbaImage::from_pixel(6, 3, Rgba([10, 20, 30, 255]));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    #[test]
    fn test_decode_frame() {
        let frame = decode_frame(&png_bytes()).unwrap();
        assert_eq!(frame.dimensions(), (6, 3));
        assert_eq!(&frame.data[..4], &[10, 20, 30, 255]);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_frame(b"not an image").is_err());
    }

    #[test]
    fn test_load_frame_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("frame.png");
        std::fs::write(&path, png_bytes()).unwrap();

        let frame = load_frame(&path).unwrap();
        assert_eq!(frame.width, 6);
        assert!(load_frame(&dir.path().join("missing.png")).is_err());
    }
}
