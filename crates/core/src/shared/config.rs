//! Resolver configuration, loaded from a JSON file with every field defaulted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::constants::{
    DEFAULT_AUXILIARY_WEIGHT, DEFAULT_BURST_WINDOW_SECS, DEFAULT_IOU_THRESHOLD,
    DEFAULT_MATCH_THRESHOLD, DEFAULT_MIN_CROP_PX, DEFAULT_PRIMARY_WEIGHT,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS,
    MAX_BURST_WINDOW_SECS,
};

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractorRole {
    Primary,
    Auxiliary,
}

/// One embedding model and its preprocessing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractorConfig {
    pub name: String,
    pub version: String,
    pub role: ExtractorRole,
    /// Model file name, resolved against `model_dir` and the cache dir.
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_input_size")]
    pub input_size: u32,
    /// Embedding length; read from the model when it declares a static size.
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default = "default_mean")]
    pub mean: [f32; 3],
    #[serde(default = "default_std")]
    pub std: [f32; 3],
}

fn default_input_size() -> u32 {
    224
}

/// ImageNet statistics on a 0-1 pixel scale.
fn default_mean() -> [f32; 3] {
    [0.485, 0.456, 0.406]
}

fn default_std() -> [f32; 3] {
    [0.229, 0.224, 0.225]
}

/// Weights of the primary and auxiliary score families. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleWeights {
    pub primary: f64,
    pub auxiliary: f64,
}

impl Default for EnsembleWeights {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_WEIGHT,
            auxiliary: DEFAULT_AUXILIARY_WEIGHT,
        }
    }
}

impl EnsembleWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary < 0.0 || self.auxiliary < 0.0 {
            return Err(ConfigError::Invalid("ensemble weights must be non-negative".into()));
        }
        if ((self.primary + self.auxiliary) - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::Invalid(format!(
                "ensemble weights must sum to 1.0, got {}",
                self.primary + self.auxiliary
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub iou_threshold: f64,
    pub burst_window_secs: i64,
    pub min_crop_px: u32,
    pub match_threshold: f64,
    pub ensemble: EnsembleWeights,
    pub retry: RetryConfig,
    /// Worker threads; 0 means one per available core.
    pub workers: usize,
    pub recheck_burst_in_transaction: bool,
    pub refresh_embeddings: bool,
    pub similarity_log: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub extractors: Vec<ExtractorConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            burst_window_secs: DEFAULT_BURST_WINDOW_SECS,
            min_crop_px: DEFAULT_MIN_CROP_PX,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            ensemble: EnsembleWeights::default(),
            retry: RetryConfig::default(),
            workers: 0,
            recheck_burst_in_transaction: true,
            refresh_embeddings: true,
            similarity_log: None,
            model_dir: None,
            extractors: Vec::new(),
        }
    }
}

impl ResolverConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: ResolverConfig =
            serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(ConfigError::Invalid(format!(
                "iou_threshold must be in [0, 1], got {}",
                self.iou_threshold
            )));
        }
        if !(-1.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be in [-1, 1], got {}",
                self.match_threshold
            )));
        }
        if !(0..=MAX_BURST_WINDOW_SECS).contains(&self.burst_window_secs) {
            return Err(ConfigError::Invalid(format!(
                "burst_window_secs must be in [0, {MAX_BURST_WINDOW_SECS}], got {}",
                self.burst_window_secs
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be >= 1".into()));
        }
        self.ensemble.validate()?;

        if !self.extractors.is_empty() {
            let primaries = self
                .extractors
                .iter()
                .filter(|e| e.role == ExtractorRole::Primary)
                .count();
            if primaries != 1 {
                return Err(ConfigError::Invalid(format!(
                    "exactly one primary extractor required, found {primaries}"
                )));
            }
            let mut names = HashSet::new();
            for e in &self.extractors {
                if !names.insert(e.name.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "duplicate extractor name '{}'",
                        e.name
                    )));
                }
                if e.input_size == 0 || e.std.iter().any(|s| *s <= 0.0) {
                    return Err(ConfigError::Invalid(format!(
                        "extractor '{}' has invalid preprocessing",
                        e.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn primary_extractor(&self) -> Option<&ExtractorConfig> {
        self.extractors
            .iter()
            .find(|e| e.role == ExtractorRole::Primary)
    }

    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
