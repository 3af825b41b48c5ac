//! Execution-context message protocol
//!
//! Every context receives typed requests and answers with exactly one typed
//! response. [`InferenceContext`] is the production handler: it owns one
//! detection and one recognition engine plus its own buffer arena.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use super::decoder::{best_path, validate_class_count, SequenceDecoder, Vocabulary};
use super::engine::{EngineLoader, InferenceEngine};
use super::error::{VisionError, VisionResult};
use super::geometry::ImageSize;
use super::heatmap::Heatmap;
use super::models::ModelKind;
use super::preprocess::{batch_to_tensor, heatmap_from_output, image_to_tensor, resize_to_canvas, ChannelNorm};
use super::resources::{BufferArena, MemorySnapshot};
use crate::config::AppConfig;

/// Message type tags of the context protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    Init,
    Detect,
    ProcessRegion,
    GetMemoryInfo,
    Initialized,
    DetectComplete,
    RegionComplete,
    MemoryInfo,
    Error,
}

impl MessageType {
    /// Success type paired with an inbound type; `None` for outbound types
    pub fn expected_response(self) -> Option<MessageType> {
        match self {
            MessageType::Init => Some(MessageType::Initialized),
            MessageType::Detect => Some(MessageType::DetectComplete),
            MessageType::ProcessRegion => Some(MessageType::RegionComplete),
            MessageType::GetMemoryInfo => Some(MessageType::MemoryInfo),
            _ => None,
        }
    }

    pub fn is_inbound(self) -> bool {
        self.expected_response().is_some()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Init => "init",
            MessageType::Detect => "detect",
            MessageType::ProcessRegion => "processRegion",
            MessageType::GetMemoryInfo => "getMemoryInfo",
            MessageType::Initialized => "initialized",
            MessageType::DetectComplete => "detectComplete",
            MessageType::RegionComplete => "regionComplete",
            MessageType::MemoryInfo => "memoryInfo",
            MessageType::Error => "error",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One crop handed to a context; the sender gives up the buffer
#[derive(Debug, Clone)]
pub struct RegionInput {
    pub box_id: usize,
    pub buffer: RgbImage,
}

/// Decoded text for one box
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionText {
    pub box_id: usize,
    pub text: String,
}

/// Inbound message
#[derive(Debug, Clone)]
pub enum ContextRequest {
    Init,
    /// Detection-canvas sized image
    Detect { image: RgbImage },
    ProcessRegion { crops: Vec<RegionInput> },
    GetMemoryInfo,
}

impl ContextRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            ContextRequest::Init => MessageType::Init,
            ContextRequest::Detect { .. } => MessageType::Detect,
            ContextRequest::ProcessRegion { .. } => MessageType::ProcessRegion,
            ContextRequest::GetMemoryInfo => MessageType::GetMemoryInfo,
        }
    }
}

/// Outbound message
#[derive(Debug, Clone)]
pub enum ContextResponse {
    Initialized,
    DetectComplete { heatmap: Heatmap },
    RegionComplete { texts: Vec<RegionText> },
    MemoryInfo(MemorySnapshot),
    Error { message: String },
}

impl ContextResponse {
    pub fn message_type(&self) -> MessageType {
        match self {
            ContextResponse::Initialized => MessageType::Initialized,
            ContextResponse::DetectComplete { .. } => MessageType::DetectComplete,
            ContextResponse::RegionComplete { .. } => MessageType::RegionComplete,
            ContextResponse::MemoryInfo(_) => MessageType::MemoryInfo,
            ContextResponse::Error { .. } => MessageType::Error,
        }
    }

    fn from_result<T>(result: VisionResult<T>, wrap: impl FnOnce(T) -> ContextResponse) -> ContextResponse {
        match result {
            Ok(value) => wrap(value),
            Err(e) => ContextResponse::Error { message: e.to_string() },
        }
    }
}

/// Runs inside one execution context, one request at a time
pub trait ContextHandler: Send {
    fn handle(&mut self, request: ContextRequest) -> ContextResponse;
}

/// Creates a fresh, uninitialized handler for a context slot
pub trait ContextFactory: Send + Sync {
    fn create(&self, index: usize) -> Box<dyn ContextHandler>;
}

/// Tensor parameters shared by every inference context
#[derive(Debug, Clone, Copy)]
pub struct ContextSettings {
    pub detection_size: ImageSize,
    pub detection_norm: ChannelNorm,
    pub recognition_norm: ChannelNorm,
}

impl ContextSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let (width, height) = config.pipeline.detection_size;
        let norm = &config.normalization;
        Self {
            detection_size: ImageSize::new(width, height),
            detection_norm: ChannelNorm::from_unit(norm.detection_mean, norm.detection_std),
            recognition_norm: ChannelNorm::from_unit(norm.recognition_mean, norm.recognition_std),
        }
    }
}

struct Engines {
    detection: Box<dyn InferenceEngine>,
    recognition: Box<dyn InferenceEngine>,
}

/// Production handler backed by real inference engines
pub struct InferenceContext {
    index: usize,
    loader: Arc<dyn EngineLoader>,
    settings: ContextSettings,
    decoder: SequenceDecoder,
    arena: BufferArena,
    engines: Option<Engines>,
}

impl InferenceContext {
    pub fn new(index: usize, loader: Arc<dyn EngineLoader>, settings: ContextSettings, vocab: Vocabulary) -> Self {
        Self {
            index,
            loader,
            settings,
            decoder: SequenceDecoder::new(vocab),
            arena: BufferArena::new(),
            engines: None,
        }
    }

    fn init(&mut self) -> VisionResult<()> {
        if self.engines.is_some() {
            return Ok(());
        }
        let detection = self.loader.load(ModelKind::Detection)?;
        let recognition = self.loader.load(ModelKind::Recognition)?;
        self.engines = Some(Engines { detection, recognition });
        info!("Context {} loaded its models", self.index);
        Ok(())
    }

    fn engines(&mut self) -> VisionResult<&mut Engines> {
        self.engines
            .as_mut()
            .ok_or_else(|| VisionError::Inference("context is not initialized".into()))
    }

    fn detect(&mut self, image: RgbImage) -> VisionResult<Heatmap> {
        let _scope = self.arena.scope("detect");
        let settings = self.settings;
        let arena = self.arena.clone();
        let engines = self.engines()?;

        let canvas = arena.track(resize_to_canvas(&image, settings.detection_size));
        drop(image);
        let input = arena.track(image_to_tensor(&canvas, settings.detection_norm, engines.detection.input_layout()));
        drop(canvas);

        let output = arena.track(engines.detection.infer(input.into_inner().into_dyn())?.into_primary()?);
        heatmap_from_output(output.view(), settings.detection_size)
    }

    fn process_region(&mut self, crops: Vec<RegionInput>) -> VisionResult<Vec<RegionText>> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }
        let _scope = self.arena.scope("processRegion");
        let norm = self.settings.recognition_norm;
        let arena = self.arena.clone();
        let engines = self.engines()?;

        let buffers: Vec<&RgbImage> = crops.iter().map(|c| &c.buffer).collect();
        let input = arena.track(batch_to_tensor(&buffers, norm, engines.recognition.input_layout())?);

        let logits = arena.track(engines.recognition.infer(input.into_inner().into_dyn())?.primary_with_rank(3)?);
        if logits.shape()[0] != crops.len() {
            return Err(VisionError::UnexpectedOutputShape(format!(
                "{} sequences for {} crops",
                logits.shape()[0],
                crops.len()
            )));
        }
        validate_class_count(logits.shape()[2], self.decoder.vocabulary())?;

        let view = logits
            .view()
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| VisionError::UnexpectedOutputShape(e.to_string()))?;
        let texts = self.decoder.decode(&best_path(view));
        debug!("Context {} decoded {} regions", self.index, texts.len());

        Ok(crops
            .iter()
            .zip(texts)
            .map(|(crop, text)| RegionText { box_id: crop.box_id, text })
            .collect())
    }
}

impl ContextHandler for InferenceContext {
    fn handle(&mut self, request: ContextRequest) -> ContextResponse {
        match request {
            ContextRequest::Init => ContextResponse::from_result(self.init(), |_| ContextResponse::Initialized),
            ContextRequest::Detect { image } => {
                ContextResponse::from_result(self.detect(image), |heatmap| ContextResponse::DetectComplete { heatmap })
            }
            ContextRequest::ProcessRegion { crops } => {
                ContextResponse::from_result(self.process_region(crops), |texts| ContextResponse::RegionComplete { texts })
            }
            ContextRequest::GetMemoryInfo => ContextResponse::MemoryInfo(self.arena.snapshot()),
        }
    }
}

/// Builds [`InferenceContext`]s sharing one engine loader
pub struct InferenceContextFactory {
    loader: Arc<dyn EngineLoader>,
    settings: ContextSettings,
    vocab: Vocabulary,
}

impl InferenceContextFactory {
    pub fn new(loader: Arc<dyn EngineLoader>, settings: ContextSettings, vocab: Vocabulary) -> Self {
        Self { loader, settings, vocab }
    }
}

impl ContextFactory for InferenceContextFactory {
    fn create(&self, index: usize) -> Box<dyn ContextHandler> {
        Box::new(InferenceContext::new(index, self.loader.clone(), self.settings, self.vocab.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TensorLayout;
    use crate::vision::engine::InferenceOutput;
    use ndarray::{ArrayD, IxDyn};

    /// Detection marks bright pixels; recognition always reads "ab".
    struct FakeEngine {
        kind: ModelKind,
        steps: usize,
        classes: usize,
    }

    impl InferenceEngine for FakeEngine {
        fn infer(&mut self, input: ArrayD<f32>) -> VisionResult<InferenceOutput> {
            match self.kind {
                ModelKind::Detection => {
                    let (h, w) = (input.shape()[2], input.shape()[3]);
                    let mut probs = ArrayD::<f32>::zeros(IxDyn(&[1, 1, h, w]));
                    for y in 0..h {
                        for x in 0..w {
                            if input[[0, 0, y, x]] > 0.0 {
                                probs[[0, 0, y, x]] = 0.9;
                            }
                        }
                    }
                    Ok(InferenceOutput::Many(vec![probs]))
                }
                ModelKind::Recognition => {
                    let n = input.shape()[0];
                    let mut logits = ArrayD::<f32>::zeros(IxDyn(&[n, self.steps, self.classes]));
                    for i in 0..n {
                        // "ab" followed by blanks
                        logits[[i, 0, 10]] = 1.0;
                        logits[[i, 1, 11]] = 1.0;
                        for t in 2..self.steps {
                            logits[[i, t, self.classes - 1]] = 1.0;
                        }
                    }
                    Ok(InferenceOutput::Single(logits))
                }
            }
        }

        fn input_layout(&self) -> TensorLayout {
            TensorLayout::Nchw
        }
    }

    struct FakeLoader {
        fail: bool,
    }

    impl EngineLoader for FakeLoader {
        fn load(&self, kind: ModelKind) -> VisionResult<Box<dyn InferenceEngine>> {
            if self.fail {
                return Err(VisionError::ModelLoad("no such model".into()));
            }
            Ok(Box::new(FakeEngine { kind, steps: 6, classes: 127 }))
        }
    }

    fn settings() -> ContextSettings {
        ContextSettings {
            detection_size: ImageSize::new(16, 16),
            detection_norm: ChannelNorm::from_unit(0.5, 0.5),
            recognition_norm: ChannelNorm::from_unit(0.694, 0.298),
        }
    }

    fn context(fail: bool) -> InferenceContext {
        InferenceContext::new(0, Arc::new(FakeLoader { fail }), settings(), Vocabulary::default())
    }

    #[test]
    fn test_response_pairing() {
        for inbound in [
            MessageType::Init,
            MessageType::Detect,
            MessageType::ProcessRegion,
            MessageType::GetMemoryInfo,
        ] {
            let outbound = inbound.expected_response().unwrap();
            assert!(!outbound.is_inbound());
            assert_ne!(outbound, MessageType::Error);
        }
        assert_eq!(MessageType::Error.expected_response(), None);
    }

    #[test]
    fn test_message_type_wire_names() {
        assert_eq!(serde_json::to_string(&MessageType::ProcessRegion).unwrap(), "\"processRegion\"");
        assert_eq!(serde_json::to_string(&MessageType::GetMemoryInfo).unwrap(), "\"getMemoryInfo\"");
        let parsed: MessageType = serde_json::from_str("\"regionComplete\"").unwrap();
        assert_eq!(parsed, MessageType::RegionComplete);
        assert_eq!(MessageType::DetectComplete.to_string(), "detectComplete");
    }

    #[test]
    fn test_requests_before_init_fail() {
        let mut ctx = context(false);
        let response = ctx.handle(ContextRequest::Detect { image: RgbImage::new(16, 16) });
        assert_eq!(response.message_type(), MessageType::Error);
    }

    #[test]
    fn test_init_failure_reports_error() {
        let mut ctx = context(true);
        match ctx.handle(ContextRequest::Init) {
            ContextResponse::Error { message } => assert!(message.contains("no such model")),
            other => panic!("unexpected response {:?}", other.message_type()),
        }
    }

    #[test]
    fn test_detect_produces_heatmap() {
        let mut ctx = context(false);
        assert_eq!(ctx.handle(ContextRequest::Init).message_type(), MessageType::Initialized);

        let mut image = RgbImage::new(16, 16);
        image.put_pixel(3, 4, image::Rgb([255, 255, 255]));
        match ctx.handle(ContextRequest::Detect { image }) {
            ContextResponse::DetectComplete { heatmap } => {
                assert_eq!(heatmap.data.len(), 256);
                assert!(heatmap.data[4 * 16 + 3] > 0.5);
                assert_eq!(heatmap.data[0], 0.0);
            }
            other => panic!("unexpected response {:?}", other.message_type()),
        }
    }

    #[test]
    fn test_process_region_keeps_box_ids() {
        let mut ctx = context(false);
        ctx.handle(ContextRequest::Init);

        let crops = vec![
            RegionInput { box_id: 7, buffer: RgbImage::new(128, 32) },
            RegionInput { box_id: 2, buffer: RgbImage::new(128, 32) },
        ];
        match ctx.handle(ContextRequest::ProcessRegion { crops }) {
            ContextResponse::RegionComplete { texts } => {
                assert_eq!(texts.len(), 2);
                assert_eq!(texts[0], RegionText { box_id: 7, text: "ab".into() });
                assert_eq!(texts[1].box_id, 2);
            }
            other => panic!("unexpected response {:?}", other.message_type()),
        }
    }

    #[test]
    fn test_buffers_released_after_each_request() {
        let mut ctx = context(false);
        ctx.handle(ContextRequest::Init);
        ctx.handle(ContextRequest::Detect { image: RgbImage::new(16, 16) });
        ctx.handle(ContextRequest::ProcessRegion {
            crops: vec![RegionInput { box_id: 0, buffer: RgbImage::new(128, 32) }],
        });

        match ctx.handle(ContextRequest::GetMemoryInfo) {
            ContextResponse::MemoryInfo(snapshot) => {
                assert_eq!(snapshot.live_buffers, 0);
                assert_eq!(snapshot.live_bytes, 0);
                assert!(snapshot.total_allocations > 0);
                assert!(snapshot.peak_bytes > 0);
            }
            other => panic!("unexpected response {:?}", other.message_type()),
        }
    }
}
