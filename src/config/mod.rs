//! Application Configuration
//!
//! Pipeline, pool, device and model settings stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Detection/recognition pipeline settings
    pub pipeline: PipelineSettings,
    /// Execution pool settings
    pub pool: PoolSettings,
    /// Device capability settings
    pub device: DeviceSettings,
    /// Model file settings
    pub models: ModelSettings,
    /// Input normalization constants
    pub normalization: NormalizationSettings,
}

/// Pipeline geometry and thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Detection canvas (width, height)
    pub detection_size: (u32, u32),
    /// Recognition input (height, width)
    pub recognition_size: (u32, u32),
    /// 8-bit heatmap binarization threshold
    pub binarize_threshold: u8,
    /// Noise floor for box sides in pixels
    pub min_box_side: i32,
    /// Margin factor for box expansion
    pub offset_factor: f32,
    /// End-to-end deadline for one extraction
    pub watchdog_ms: u64,
    /// Sort words into reading order
    pub sort_output: bool,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            detection_size: (512, 512),
            recognition_size: (32, 128),
            binarize_threshold: 77,
            min_box_side: 2,
            offset_factor: 1.8,
            watchdog_ms: 30_000,
            sort_output: false,
        }
    }
}

impl PipelineSettings {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

impl DeviceSettings {
    pub fn idle_tick(&self) -> Duration {
        Duration::from_millis(self.idle_tick_ms)
    }

    pub fn monitor_interval(&self) -> Option<Duration> {
        (self.monitor_interval_ms > 0).then(|| Duration::from_millis(self.monitor_interval_ms))
    }
}

/// Execution pool sizing and deadlines
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of contexts, 0 = available parallelism
    pub size: usize,
    /// Upper bound applied to the detected parallelism
    pub max_size: usize,
    /// Per-task deadline
    pub task_timeout_ms: u64,
    /// Deadline for the init handshake of every context
    pub init_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 0,
            max_size: 8,
            task_timeout_ms: 30_000,
            init_timeout_ms: 60_000,
        }
    }
}

impl PoolSettings {
    /// Resolve the context count against the hardware parallelism
    pub fn resolved_size(&self, parallelism: usize) -> usize {
        let size = if self.size == 0 { parallelism } else { self.size };
        size.clamp(1, self.max_size.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

/// Device capability overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Force constrained (true) or desktop (false) mode instead of probing
    pub force_constrained: Option<bool>,
    /// Override for the largest processed image side
    pub max_dimension: Option<u32>,
    /// Batch size on constrained devices
    pub constrained_batch_size: usize,
    /// Batch size otherwise
    pub batch_size: usize,
    /// Devices with less memory than this are constrained
    pub constrained_memory_mb: u64,
    /// Pause between batches on constrained devices
    pub idle_tick_ms: u64,
    /// Override for the live buffer ceiling
    pub max_live_buffers: Option<usize>,
    /// Override for the live byte ceiling, in MB
    pub max_live_mb: Option<usize>,
    /// Memory usage log interval, 0 disables the monitor
    pub monitor_interval_ms: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            force_constrained: None,
            max_dimension: None,
            constrained_batch_size: 4,
            batch_size: 16,
            constrained_memory_mb: 4096,
            idle_tick_ms: 16,
            max_live_buffers: None,
            max_live_mb: None,
            monitor_interval_ms: 5_000,
        }
    }
}

/// Memory layout expected by a model input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TensorLayout {
    /// [batch, channels, height, width]
    #[default]
    Nchw,
    /// [batch, height, width, channels]
    Nhwc,
}

/// One model file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelEntry {
    /// File name inside the models directory
    pub filename: String,
    /// Download location when the file is missing
    pub url: Option<String>,
    /// Expected SHA-256 of the file
    pub sha256: Option<String>,
    /// Input tensor layout
    pub input_layout: TensorLayout,
    /// ONNX Runtime intra-op threads
    pub intra_threads: usize,
}

impl Default for ModelEntry {
    fn default() -> Self {
        Self {
            filename: String::new(),
            url: None,
            sha256: None,
            input_layout: TensorLayout::Nchw,
            intra_threads: 1,
        }
    }
}

/// Model locations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Override for the models directory
    pub models_dir: Option<std::path::PathBuf>,
    /// Never download, fail instead
    pub offline: bool,
    pub detection: ModelEntry,
    pub recognition: ModelEntry,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            models_dir: None,
            offline: false,
            detection: ModelEntry {
                filename: "db_mobilenet_v2.onnx".to_string(),
                ..Default::default()
            },
            recognition: ModelEntry {
                filename: "crnn_mobilenet_v2.onnx".to_string(),
                ..Default::default()
            },
        }
    }
}

/// Per-channel mean/std in [0, 1]; multiplied by 255 at use
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizationSettings {
    pub detection_mean: f32,
    pub detection_std: f32,
    pub recognition_mean: f32,
    pub recognition_std: f32,
}

impl Default for NormalizationSettings {
    fn default() -> Self {
        Self {
            detection_mean: 0.785,
            detection_std: 0.275,
            recognition_mean: 0.694,
            recognition_std: 0.298,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file {:?}", path))?;
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &AppConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
