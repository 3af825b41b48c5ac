//! Error taxonomy for the extraction pipeline

use std::time::Duration;

/// Errors raised by the vision core
#[derive(Debug, Clone, thiserror::Error)]
pub enum VisionError {
    /// Heatmap byte length does not match its declared dimensions
    #[error("heatmap shape mismatch: expected {expected} values ({height}x{width}), got {actual}")]
    ShapeMismatch {
        expected: usize,
        actual: usize,
        height: u32,
        width: u32,
    },

    /// Inference engine failed to load a model
    #[error("failed to load model: {0}")]
    ModelLoad(String),

    /// Crop with zero or negative extent
    #[error("degenerate crop for box {box_id}: {width}x{height}")]
    DegenerateCrop { box_id: usize, width: i64, height: i64 },

    /// A recognition batch failed in inference or decoding
    #[error("batch {batch} failed: {message}")]
    BatchProcessing { batch: usize, message: String },

    /// An execution context exceeded its deadline
    #[error("execution context timed out after {0:?}")]
    ContextTimeout(Duration),

    /// Inference engine output had an unusable shape
    #[error("unexpected inference output shape: {0}")]
    UnexpectedOutputShape(String),

    /// Engine-level failure reported by an execution context
    #[error("inference failed: {0}")]
    Inference(String),

    /// Task submitted to a pool that is no longer running
    #[error("execution pool has been terminated")]
    PoolTerminated,

    #[error("io error: {0}")]
    Io(String),
}

impl VisionError {
    /// Per-crop and per-batch errors degrade the result instead of failing it
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VisionError::DegenerateCrop { .. }
                | VisionError::BatchProcessing { .. }
                | VisionError::UnexpectedOutputShape(_)
                | VisionError::Inference(_)
        )
    }
}

impl From<std::io::Error> for VisionError {
    fn from(err: std::io::Error) -> Self {
        VisionError::Io(err.to_string())
    }
}

pub type VisionResult<T> = std::result::Result<T, VisionError>;
