//! Vision Layer
//!
//! Detects text regions on a captured frame and recognizes the words in
//! them. Detection and recognition run on a pool of execution contexts;
//! this module wires the stages together under one deadline.

pub mod context;
pub mod crop;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod heatmap;
pub mod models;
pub mod pool;
pub mod preprocess;
pub mod resources;
pub mod scheduler;

#[cfg(test)]
mod testing;

use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capture::frame::CapturedFrame;
use crate::config::AppConfig;

pub use context::{ContextFactory, ContextRequest, ContextResponse, ContextSettings, InferenceContextFactory};
pub use crop::{Crop, CropNormalizer};
pub use decoder::{SequenceDecoder, Vocabulary};
pub use error::{VisionError, VisionResult};
pub use geometry::{BoundingBox, ImageSize, PixelBox};
pub use heatmap::{ExtractorConfig, Heatmap, HeatmapBoxExtractor};
pub use models::{ModelKind, ModelStore};
pub use pool::{ExecutionPool, PoolConfig, PoolState, PoolStatus};
pub use resources::{DeviceProfile, MemorySnapshot, MonitorHandle, ResourceGovernor};
pub use scheduler::{BatchScheduler, DecodedWord};

/// Words and boxes found on one frame
///
/// Pixel boxes are in detection canvas space; use
/// [`ExtractionResult::to_frame_pixels`] to map them onto the frame.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionResult {
    /// Recognized words, one per non-empty box
    pub words: Vec<DecodedWord>,
    /// Words joined by single spaces
    pub text: String,
    /// Every box the detector produced
    pub boxes: Vec<BoundingBox>,
    /// Frame size after device downscaling
    pub frame: ImageSize,
    /// Detection canvas size
    pub canvas: ImageSize,
    /// Processing time in milliseconds
    pub processing_time_ms: u64,
}

impl ExtractionResult {
    fn new(words: Vec<DecodedWord>, boxes: Vec<BoundingBox>, frame: ImageSize, canvas: ImageSize, started: Instant) -> Self {
        let text = words.iter().map(|w| w.word.as_str()).collect::<Vec<_>>().join(" ");
        Self {
            words,
            text,
            boxes,
            frame,
            canvas,
            processing_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Scale a canvas-space box onto the frame
    pub fn to_frame_pixels(&self, bbox: &PixelBox) -> PixelBox {
        let sx = self.frame.width as f64 / self.canvas.width.max(1) as f64;
        let sy = self.frame.height as f64 / self.canvas.height.max(1) as f64;
        PixelBox {
            x: (bbox.x as f64 * sx).round() as i64,
            y: (bbox.y as f64 * sy).round() as i64,
            width: (bbox.width as f64 * sx).round() as i64,
            height: (bbox.height as f64 * sy).round() as i64,
        }
    }
}

/// Sort words top-to-bottom, then left-to-right
pub fn sort_reading_order(words: &mut [DecodedWord]) {
    words.sort_by_key(|w| (w.bounding_box.y, w.bounding_box.x));
}

/// End-to-end text extraction pipeline
pub struct VisionPipeline {
    config: AppConfig,
    governor: ResourceGovernor,
    extractor: HeatmapBoxExtractor,
    normalizer: CropNormalizer,
    pool: ExecutionPool,
    _monitor: Option<MonitorHandle>,
}

impl VisionPipeline {
    /// Probe the device, resolve both models and start the pool
    pub fn new(config: AppConfig) -> VisionResult<Self> {
        let governor = ResourceGovernor::probe(&config.device);

        let store = ModelStore::new(config.models.clone()).map_err(|e| VisionError::ModelLoad(format!("{:#}", e)))?;
        let loader = store
            .prepare_loader()
            .map_err(|e| VisionError::ModelLoad(format!("{:#}", e)))?;

        let factory = InferenceContextFactory::new(
            Arc::new(loader),
            ContextSettings::from_config(&config),
            Vocabulary::default(),
        );
        Self::with_factory(config, governor, Arc::new(factory))
    }

    /// Build a pipeline over an arbitrary context factory
    pub fn with_factory(
        config: AppConfig,
        governor: ResourceGovernor,
        factory: Arc<dyn ContextFactory>,
    ) -> VisionResult<Self> {
        let profile = governor.profile().clone();
        info!(
            "Starting vision pipeline: max_dimension={}, batch_size={}, constrained={}",
            profile.max_dimension, profile.batch_size, profile.is_constrained
        );

        let pool = ExecutionPool::start(factory, PoolConfig::from_settings(&config.pool, profile.parallelism))?;

        let settings = &config.pipeline;
        let extractor = HeatmapBoxExtractor::with_config(ExtractorConfig {
            threshold: settings.binarize_threshold,
            min_side: settings.min_box_side,
            offset_factor: settings.offset_factor,
        });
        let normalizer = CropNormalizer::new(settings.recognition_size);
        let monitor = config.device.monitor_interval().map(|i| governor.spawn_monitor(i));

        Ok(Self {
            config,
            governor,
            extractor,
            normalizer,
            pool,
            _monitor: monitor,
        })
    }

    pub fn profile(&self) -> &DeviceProfile {
        self.governor.profile()
    }

    pub fn pool(&self) -> &ExecutionPool {
        &self.pool
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.governor
    }

    /// Detect and recognize all text on a frame
    ///
    /// A context timeout anywhere in the run discards partial results. When
    /// the watchdog fired before the pool's own task deadline, the pool is
    /// reinitialized before the error is returned.
    pub fn process(&self, frame: CapturedFrame) -> VisionResult<ExtractionResult> {
        let started = Instant::now();
        let deadline = started + self.config.pipeline.watchdog();
        let generation = self.pool.status().generation;

        match self.run(frame, started, deadline) {
            Err(e @ VisionError::ContextTimeout(_)) => {
                if self.pool.status().generation != generation {
                    warn!("Extraction timed out, contexts already replaced: {}", e);
                } else {
                    warn!("Extraction timed out, reinitializing contexts: {}", e);
                    if let Err(reinit) = self.pool.reinitialize(e.clone()) {
                        error!("Failed to reinitialize execution pool: {}", reinit);
                    }
                }
                Err(e)
            }
            other => other,
        }
    }

    fn run(&self, frame: CapturedFrame, started: Instant, deadline: Instant) -> VisionResult<ExtractionResult> {
        let arena = self.governor.arena();
        let _scope = arena.scope("extract");

        let frame = frame.fit_to_profile(self.governor.profile())?;
        let (width, height) = frame.dimensions();
        let frame_size = ImageSize::new(width, height);

        let (dw, dh) = self.config.pipeline.detection_size;
        let canvas_size = ImageSize::new(dw, dh);
        let canvas = {
            let rgb = arena.track(frame.to_rgb()?);
            arena.track(preprocess::resize_to_canvas(&rgb, canvas_size))
        };

        let heatmap = match self
            .pool
            .submit(ContextRequest::Detect { image: (*canvas).clone() })?
            .wait_until(deadline)?
        {
            ContextResponse::DetectComplete { heatmap } => arena.track(heatmap),
            other => {
                return Err(VisionError::UnexpectedOutputShape(format!(
                    "detection answered with {}",
                    other.message_type()
                )))
            }
        };

        let boxes = self.extractor.extract(&heatmap, canvas_size)?;
        drop(heatmap);

        let crops = self.normalizer.normalize_all(&canvas, &boxes);
        drop(canvas);
        debug!("{} boxes, {} crops", boxes.len(), crops.len());

        let scheduler = BatchScheduler::new(&self.pool, &self.governor, self.config.device.idle_tick());
        let mut words = scheduler.run_recognition(crops, self.governor.profile(), deadline)?;
        if self.config.pipeline.sort_output {
            sort_reading_order(&mut words);
        }

        let result = ExtractionResult::new(words, boxes, frame_size, canvas_size, started);
        info!(
            "Extracted {} words from {} boxes in {}ms",
            result.words.len(),
            result.boxes.len(),
            result.processing_time_ms
        );
        Ok(result)
    }
}
