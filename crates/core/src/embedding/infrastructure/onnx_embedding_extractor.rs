/// Appearance embedding extractor backed by an ONNX Runtime session.
///
/// One implementation covers every re-identification backbone: models differ
/// only in input resolution and normalization, which come from configuration.
/// The session sits behind a mutex so a single loaded model serves all
/// worker threads; no per-call state survives between calls.
use std::path::Path;
use std::sync::Mutex;

use crate::embedding::domain::embedding_extractor::{EmbeddingExtractor, ExtractError};
use crate::embedding::infrastructure::execution_provider::{
    accelerator_name, preferred_execution_providers,
};
use crate::shared::config::ExtractorConfig;
use crate::shared::crop::Crop;
use crate::shared::embedding::Embedding;

type BoxError = Box<dyn std::error::Error>;

pub struct OnnxEmbeddingExtractor {
    name: String,
    version: String,
    session: Mutex<ort::session::Session>,
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
    dimension: usize,
    min_crop_px: u32,
}

impl OnnxEmbeddingExtractor {
    /// Load `model_path` and prepare for inference.
    ///
    /// Input resolution and embedding length are read from the model when it
    /// declares them, otherwise taken from `config`.
    pub fn new(
        config: &ExtractorConfig,
        model_path: &Path,
        min_crop_px: u32,
    ) -> Result<Self, ExtractError> {
        let load_error = |message: String| ExtractError::ModelLoad {
            extractor: config.name.clone(),
            message,
        };

        let session = build_session(model_path).map_err(|e| load_error(e.to_string()))?;

        let input_size = declared_input_size(&session).unwrap_or(config.input_size);
        let dimension = declared_dimension(&session)
            .or(config.dimension)
            .ok_or_else(|| {
                load_error("model has a dynamic output size and no dimension is configured".into())
            })?;

        log::info!(
            "Loaded extractor '{}' v{} from {} ({}px input, {} dims, {})",
            config.name,
            config.version,
            model_path.display(),
            input_size,
            dimension,
            accelerator_name()
        );

        Ok(Self {
            name: config.name.clone(),
            version: config.version.clone(),
            session: Mutex::new(session),
            input_size,
            mean: config.mean,
            std: config.std,
            dimension,
            min_crop_px,
        })
    }

    fn infer(&self, crop: &Crop) -> Result<Vec<f32>, BoxError> {
        let tensor = preprocess(crop, self.input_size, self.mean, self.std)
            .ok_or("crop buffer does not match its dimensions")?;
        let input_value = ort::value::Tensor::from_array(tensor)?;
        let mut session = self
            .session
            .lock()
            .map_err(|e| format!("Lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs![input_value])?;
        let embedding_array = outputs[0].try_extract_array::<f32>()?;
        let embedding_slice = embedding_array
            .as_slice()
            .ok_or("Cannot get embedding slice")?;
        Ok(embedding_slice.to_vec())
    }

    fn classify(&self, message: String) -> ExtractError {
        let lower = message.to_ascii_lowercase();
        if lower.contains("out of memory")
            || lower.contains("failed to allocate")
            || lower.contains("resource exhausted")
        {
            ExtractError::ResourceExhausted {
                extractor: self.name.clone(),
                message,
            }
        } else {
            ExtractError::Inference {
                extractor: self.name.clone(),
                message,
            }
        }
    }
}

impl EmbeddingExtractor for OnnxEmbeddingExtractor {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn extract(&self, crop: &Crop) -> Result<Option<Embedding>, ExtractError> {
        if crop.is_smaller_than(self.min_crop_px) {
            return Ok(None);
        }
        let raw = self.infer(crop).map_err(|e| self.classify(e.to_string()))?;
        if raw.len() != self.dimension {
            return Err(self.classify(format!(
                "expected {} values, model produced {}",
                self.dimension,
                raw.len()
            )));
        }
        Ok(Embedding::normalized(raw))
    }
}

fn build_session(model_path: &Path) -> Result<ort::session::Session, BoxError> {
    let intra_threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let session = ort::session::Session::builder()?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
        .with_inter_threads(1)?
        .with_intra_threads(intra_threads)?
        .with_execution_providers(preferred_execution_providers())?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Square input side from an NCHW input shape, if static.
fn declared_input_size(session: &ort::session::Session) -> Option<u32> {
    session.inputs().first().and_then(|input| {
        if let ort::value::ValueType::Tensor { ref shape, .. } = input.dtype() {
            if shape.len() >= 4 && shape[2] > 0 {
                Some(shape[2] as u32)
            } else {
                None
            }
        } else {
            None
        }
    })
}

/// Embedding length from the last axis of the first output, if static.
fn declared_dimension(session: &ort::session::Session) -> Option<usize> {
    session.outputs().first().and_then(|output| {
        if let ort::value::ValueType::Tensor { ref shape, .. } = output.dtype() {
            let n = shape.len();
            if n >= 1 && shape[n - 1] > 0 {
                Some(shape[n - 1] as usize)
            } else {
                None
            }
        } else {
            None
        }
    })
}

/// Resize to `size`×`size` (nearest-neighbor, pixel centers), scale to 0-1,
/// normalize per channel, NCHW layout.
fn preprocess(
    crop: &Crop,
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
) -> Option<ndarray::Array4<f32>> {
    let src = crop.as_ndarray()?;
    let src_w = crop.width() as usize;
    let src_h = crop.height() as usize;
    if src_w == 0 || src_h == 0 {
        return None;
    }
    let size = size as usize;

    let mut tensor = ndarray::Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        let src_y = (((y as f64 + 0.5) * src_h as f64 / size as f64) as usize).min(src_h - 1);
        for x in 0..size {
            let src_x = (((x as f64 + 0.5) * src_w as f64 / size as f64) as usize).min(src_w - 1);
            for c in 0..3 {
                let v = src[[src_y, src_x, c]] as f32 / 255.0;
                tensor[[0, c, y, x]] = (v - mean[c]) / std[c];
            }
        }
    }
    Some(tensor)
}
