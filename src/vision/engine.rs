//! Inference engines
//!
//! The pool's contexts only see the [`InferenceEngine`] trait; the ONNX
//! Runtime implementation lives here alongside the loader that builds it.

use ndarray::ArrayD;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::error::{VisionError, VisionResult};
use crate::config::{ModelEntry, TensorLayout};
use super::models::ModelKind;

/// Output of one model invocation
///
/// Some exported graphs return a list of tensors; the first entry is the
/// one the pipeline consumes.
#[derive(Debug, Clone)]
pub enum InferenceOutput {
    Single(ArrayD<f32>),
    Many(Vec<ArrayD<f32>>),
}

impl InferenceOutput {
    /// Unwrap the primary tensor
    pub fn into_primary(self) -> VisionResult<ArrayD<f32>> {
        match self {
            InferenceOutput::Single(tensor) => Ok(tensor),
            InferenceOutput::Many(tensors) => tensors
                .into_iter()
                .next()
                .ok_or_else(|| VisionError::UnexpectedOutputShape("model returned no tensors".into())),
        }
    }

    /// Unwrap the primary tensor and check its rank
    pub fn primary_with_rank(self, rank: usize) -> VisionResult<ArrayD<f32>> {
        let tensor = self.into_primary()?;
        if tensor.ndim() != rank {
            return Err(VisionError::UnexpectedOutputShape(format!(
                "expected rank {}, got shape {:?}",
                rank,
                tensor.shape()
            )));
        }
        Ok(tensor)
    }
}

/// A loaded model able to run a forward pass
pub trait InferenceEngine: Send {
    fn infer(&mut self, input: ArrayD<f32>) -> VisionResult<InferenceOutput>;

    /// Layout the model expects its image input in
    fn input_layout(&self) -> TensorLayout;
}

/// Builds engines inside an execution context
pub trait EngineLoader: Send + Sync {
    fn load(&self, kind: ModelKind) -> VisionResult<Box<dyn InferenceEngine>>;
}

/// ONNX Runtime session wrapper
pub struct OrtEngine {
    session: Session,
    input_name: String,
    output_names: Vec<String>,
    layout: TensorLayout,
}

impl OrtEngine {
    /// Create a new ONNX session from a model file
    pub fn load(model_path: &Path, entry: &ModelEntry) -> VisionResult<Self> {
        info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(entry.intra_threads.max(1)))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| VisionError::ModelLoad(format!("{}: {}", model_path.display(), e)))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| VisionError::ModelLoad(format!("{} declares no inputs", model_path.display())))?;

        let output_names: Vec<String> = session
            .outputs
            .iter()
            .map(|output| output.name.clone())
            .collect();

        info!("Model loaded. Input: {}, Outputs: {:?}", input_name, output_names);

        Ok(Self {
            session,
            input_name,
            output_names,
            layout: entry.input_layout,
        })
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}

impl InferenceEngine for OrtEngine {
    fn infer(&mut self, input: ArrayD<f32>) -> VisionResult<InferenceOutput> {
        debug!("Running {} with input shape {:?}", self.input_name, input.shape());

        let value = Value::from_array(input).map_err(|e| VisionError::Inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => value])
            .map_err(|e| VisionError::Inference(e.to_string()))?;

        let mut tensors = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let tensor = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| VisionError::UnexpectedOutputShape(format!("{}: {}", name, e)))?;
            tensors.push(tensor.to_owned());
        }

        Ok(match tensors.len() {
            1 => InferenceOutput::Single(tensors.remove(0)),
            _ => InferenceOutput::Many(tensors),
        })
    }

    fn input_layout(&self) -> TensorLayout {
        self.layout
    }
}

/// Resolved location of one model
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub path: PathBuf,
    pub entry: ModelEntry,
}

/// Loads ONNX Runtime engines from files already present on disk
#[derive(Debug, Clone)]
pub struct OrtLoader {
    pub detection: ModelSource,
    pub recognition: ModelSource,
}

impl EngineLoader for OrtLoader {
    fn load(&self, kind: ModelKind) -> VisionResult<Box<dyn InferenceEngine>> {
        let source = match kind {
            ModelKind::Detection => &self.detection,
            ModelKind::Recognition => &self.recognition,
        };
        Ok(Box::new(OrtEngine::load(&source.path, &source.entry)?))
    }
}
