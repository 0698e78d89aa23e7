use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::resolution::deduplicate_photo_use_case::DeduplicatePhotoUseCase;
use crate::resolution::resolution_outcome::ResolutionOutcome;
use crate::resolution::resolve_detection_use_case::ResolveDetectionUseCase;
use crate::shared::ids::{DetectionId, PhotoId};
use crate::store::domain::identity_store::StoreError;

/// Progress callback: `(resolved, total)`.
pub type ProgressFn = Box<dyn Fn(usize, usize) + Send + Sync>;

/// Configuration for one processing run.
pub struct ExecutionConfig {
    pub workers: usize,
    pub on_progress: Option<ProgressFn>,
    pub cancelled: Arc<AtomicBool>,
}

impl ExecutionConfig {
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            on_progress: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub photos: usize,
    /// One per resolved detection, ordered by detection id.
    pub outcomes: Vec<ResolutionOutcome>,
    /// Detections whose resolution could not even be recorded.
    pub errors: Vec<(DetectionId, String)>,
}

/// Abstracts how the dedup → resolve run over a set of photos is executed.
///
/// Every photo is deduplicated and committed before any of its detections
/// is handed to resolution.
pub trait ResolutionExecutor: Send + Sync {
    fn execute(
        &self,
        photos: &[PhotoId],
        dedup: &DeduplicatePhotoUseCase,
        resolver: &ResolveDetectionUseCase,
        config: ExecutionConfig,
    ) -> Result<ExecutionReport, StoreError>;
}
