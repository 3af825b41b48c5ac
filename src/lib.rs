//! SnapText - text extraction from captured frames
//!
//! Detects text regions with a DBNet-style heatmap model, normalizes each
//! region into a fixed-size crop and decodes it with a CTC recognizer.
//! Inference runs on a pool of isolated execution contexts sized to the
//! device.

pub mod capture;
pub mod config;
pub mod storage;
pub mod vision;

pub use capture::CapturedFrame;
pub use config::AppConfig;
pub use vision::{ExtractionResult, VisionError, VisionPipeline, VisionResult};
