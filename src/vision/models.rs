//! Model file management
//!
//! Resolves, downloads, verifies and records the detection and recognition
//! model files.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use super::engine::{ModelSource, OrtLoader};
use crate::config::{ModelEntry, ModelSettings};

/// Environment variable that forces offline mode
pub const OFFLINE_ENV: &str = "SNAPTEXT_OFFLINE";

/// The two models a context loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    /// Text detection model (DBNet)
    Detection,
    /// Text recognition model (CRNN)
    Recognition,
}

impl ModelKind {
    pub const ALL: [ModelKind; 2] = [ModelKind::Detection, ModelKind::Recognition];

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelKind::Detection => "Text Detection",
            ModelKind::Recognition => "Text Recognition",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub kind: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    pub downloaded_at: String,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Local model directory with on-demand download
pub struct ModelStore {
    models_dir: PathBuf,
    settings: ModelSettings,
}

impl ModelStore {
    /// Create a store in the configured or default models directory
    pub fn new(settings: ModelSettings) -> Result<Self> {
        let models_dir = match &settings.models_dir {
            Some(dir) => dir.clone(),
            None => crate::storage::get_data_dir()?.join("models"),
        };
        Self::with_dir(models_dir, settings)
    }

    /// Create a store with a custom directory
    pub fn with_dir(models_dir: PathBuf, settings: ModelSettings) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self { models_dir, settings })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn entry(&self, kind: ModelKind) -> &ModelEntry {
        match kind {
            ModelKind::Detection => &self.settings.detection,
            ModelKind::Recognition => &self.settings.recognition,
        }
    }

    pub fn model_path(&self, kind: ModelKind) -> PathBuf {
        self.models_dir.join(&self.entry(kind).filename)
    }

    /// A model counts as available when its file exists and is not empty
    pub fn is_model_available(&self, kind: ModelKind) -> bool {
        std::fs::metadata(self.model_path(kind))
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    fn is_offline(&self) -> bool {
        self.settings.offline || std::env::var(OFFLINE_ENV).is_ok()
    }

    /// Download a model if not already available
    /// Returns the path to the model file
    pub fn ensure_model(&self, kind: ModelKind) -> Result<PathBuf> {
        let path = self.model_path(kind);

        if self.is_model_available(kind) {
            debug!("Model {:?} already available at {:?}", kind, path);
            return Ok(path);
        }

        let url = self.entry(kind).url.clone().with_context(|| {
            format!(
                "{} model missing at {:?} and no download URL is configured",
                kind.display_name(),
                path
            )
        })?;

        if self.is_offline() {
            anyhow::bail!(
                "Offline mode: cannot download models. Please download manually from {} and place at {:?}",
                url,
                path
            );
        }

        self.download_model(kind, &url)?;
        Ok(path)
    }

    /// Make both models available and build a loader for them
    pub fn prepare_loader(&self) -> Result<OrtLoader> {
        let source = |kind: ModelKind| -> Result<ModelSource> {
            Ok(ModelSource {
                path: self.ensure_model(kind)?,
                entry: self.entry(kind).clone(),
            })
        };
        Ok(OrtLoader {
            detection: source(ModelKind::Detection)?,
            recognition: source(ModelKind::Recognition)?,
        })
    }

    /// Download a specific model (blocking)
    fn download_model(&self, kind: ModelKind, url: &str) -> Result<()> {
        let path = self.model_path(kind);
        info!("Downloading {} model from {}", kind.display_name(), url);

        // Create a tokio runtime for async download
        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let hash = rt.block_on(self.download_file_async(url, &path, kind))?;

        self.update_manifest_for_model(kind, hash)?;

        info!("Successfully downloaded {} model", kind.display_name());
        Ok(())
    }

    /// Async download implementation, returns the SHA-256 of the file
    async fn download_file_async(&self, url: &str, path: &Path, kind: ModelKind) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .get(url)
            .send()
            .await
            .context("Failed to send download request")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status {}: {}", response.status(), url);
        }

        let total_size = response.content_length();
        debug!("Download size: {:?} bytes", total_size);

        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading download stream")?;
            file.write_all(&chunk).context("Failed to write to temp file")?;
            hasher.update(&chunk);
            downloaded += chunk.len() as u64;
        }

        file.flush().context("Failed to flush temp file")?;
        drop(file);
        debug!("{:?}: received {} / {:?} bytes", kind, downloaded, total_size);

        let hash = format!("{:x}", hasher.finalize());
        if let Err(e) = verify_checksum(self.entry(kind), &hash) {
            std::fs::remove_file(&temp_path).ok();
            return Err(e);
        }

        std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;
        Ok(hash)
    }

    /// Update manifest after successful download
    fn update_manifest_for_model(&self, kind: ModelKind, hash: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(kind))?;

        let model_info = ModelInfo {
            kind: format!("{:?}", kind),
            filename: self.entry(kind).filename.clone(),
            size_bytes: metadata.len(),
            sha256: Some(hash),
            downloaded_at: unix_timestamp(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

fn verify_checksum(entry: &ModelEntry, actual: &str) -> Result<()> {
    match &entry.sha256 {
        Some(expected) if !expected.eq_ignore_ascii_case(actual) => anyhow::bail!(
            "Checksum mismatch for {}: expected {}, got {}",
            entry.filename,
            expected,
            actual
        ),
        _ => Ok(()),
    }
}

/// Seconds since the Unix epoch as a string
fn unix_timestamp() -> String {
    use std::time::SystemTime;

    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}
