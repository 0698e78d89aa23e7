use thiserror::Error;

use crate::shared::crop::Crop;
use crate::shared::embedding::Embedding;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExtractError {
    #[error("extractor '{extractor}' ran out of resources: {message}")]
    ResourceExhausted { extractor: String, message: String },
    #[error("inference failed in extractor '{extractor}': {message}")]
    Inference { extractor: String, message: String },
    #[error("failed to load extractor '{extractor}': {message}")]
    ModelLoad { extractor: String, message: String },
}

impl ExtractError {
    /// Runtime failures may clear up on retry; a model that won't load will not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ExtractError::ModelLoad { .. })
    }
}

/// Domain interface for appearance embedding models.
///
/// Returns `Ok(None)` when the crop is unusable (for example, too small).
/// Implementations are shared across worker threads and must not carry
/// per-call mutable state between calls.
pub trait EmbeddingExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Changes whenever the model or its preprocessing changes.
    fn version(&self) -> &str;

    fn dimension(&self) -> usize;

    fn extract(&self, crop: &Crop) -> Result<Option<Embedding>, ExtractError>;
}
