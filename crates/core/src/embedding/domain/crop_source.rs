use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::shared::bounding_box::BoundingBox;
use crate::shared::crop::Crop;

/// Failures of the crop source. All of them are input-data problems.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CropError {
    #[error("image not found: {0}")]
    Missing(PathBuf),
    #[error("unsupported image type: {0}")]
    Unsupported(PathBuf),
    #[error("cannot decode {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("bounding box lies outside {0}")]
    OutOfBounds(PathBuf),
}

/// Cuts the pixels under a bounding box out of a photo file.
pub trait CropSource: Send + Sync {
    fn crop(&self, path: &Path, bbox: &BoundingBox) -> Result<Crop, CropError>;
}
