use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use idmatch_vision::{DetectConfig, NormalizeConfig};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

pub static CONFIG_PATH: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("IDMATCH_CONFIG_PATH").unwrap_or("/usr/local/etc/idmatch/config.toml"))
});

pub static ACCOUNT_STORE_PREFIX: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("IDMATCH_STORE_PREFIX").unwrap_or("/var/lib/idmatch/accounts"))
});

pub static MODEL_DIR: Lazy<&'static Path> = Lazy::new(|| {
    Path::new(option_env!("IDMATCH_MODEL_DIR").unwrap_or("/usr/local/share/idmatch/models"))
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Face distance below which a candidate counts as a match.
    pub threshold: f32,
    /// Minimum signature similarity for a reference to count as accepted.
    pub signature_threshold: f64,
    pub detection: DetectionConfig,
    pub normalize: NormalizeSection,
    pub limits: LimitsConfig,
    pub models: ModelsConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub input_size: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeSection {
    pub signature_width: u32,
    pub signature_height: u32,
    pub face_box: u32,
    pub max_input_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub collaborator_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub detector: PathBuf,
    pub recognizer: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub prefix: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            signature_threshold: 0.85,
            detection: DetectionConfig::default(),
            normalize: NormalizeSection::default(),
            limits: LimitsConfig::default(),
            models: ModelsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_threshold: 0.5,
            nms_threshold: 0.3,
        }
    }
}

impl Default for NormalizeSection {
    fn default() -> Self {
        let base = NormalizeConfig::default();
        Self {
            signature_width: base.signature_width,
            signature_height: base.signature_height,
            face_box: base.face_box,
            max_input_bytes: base.max_input_bytes,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            collaborator_timeout_ms: 10_000,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            detector: MODEL_DIR.join("face_detection_yunet_2023mar.onnx"),
            recognizer: MODEL_DIR.join("face_recognition_sface_2021dec.onnx"),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: ACCOUNT_STORE_PREFIX.to_path_buf(),
        }
    }
}

impl Config {
    pub fn detect_config(&self) -> DetectConfig {
        DetectConfig {
            input_size: self.detection.input_size,
            score_threshold: self.detection.score_threshold,
        }
    }

    pub fn normalize_config(&self) -> NormalizeConfig {
        NormalizeConfig {
            signature_width: self.normalize.signature_width,
            signature_height: self.normalize.signature_height,
            face_box: self.normalize.face_box,
            max_input_bytes: self.normalize.max_input_bytes,
        }
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.collaborator_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.threshold > 0.0) {
            anyhow::bail!("threshold must be positive, got {}", self.threshold);
        }
        if !(self.signature_threshold > 0.0 && self.signature_threshold <= 1.0) {
            anyhow::bail!(
                "signature_threshold must be in (0, 1], got {}",
                self.signature_threshold
            );
        }
        if !(self.detection.score_threshold > 0.0 && self.detection.score_threshold <= 1.0) {
            anyhow::bail!(
                "detection.score_threshold must be in (0, 1], got {}",
                self.detection.score_threshold
            );
        }
        if self.detection.input_size == 0 || self.detection.input_size % 32 != 0 {
            anyhow::bail!(
                "detection.input_size must be a positive multiple of 32, got {}",
                self.detection.input_size
            );
        }
        let n = &self.normalize;
        if n.signature_width == 0 || n.signature_height == 0 || n.face_box == 0 {
            anyhow::bail!("normalize sizes must be non-zero");
        }
        if n.max_input_bytes == 0 {
            anyhow::bail!("normalize.max_input_bytes must be non-zero");
        }
        if self.limits.collaborator_timeout_ms == 0 {
            anyhow::bail!("limits.collaborator_timeout_ms must be non-zero");
        }
        Ok(())
    }
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or(&CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config at {}", path.display()))?;
    let cfg: Config =
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validating config {}", path.display()))?;
    Ok(cfg)
}

pub fn save_config(cfg: &Config, path: Option<&Path>) -> Result<()> {
    let path = path.unwrap_or(&CONFIG_PATH);
    let data = toml::to_string_pretty(cfg)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, data)?;
    Ok(())
}
