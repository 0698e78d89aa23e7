use std::sync::Arc;

use crate::dedup::domain::frame_deduplicator::FrameDeduplicator;
use crate::shared::detection::Detection;
use crate::shared::ids::PhotoId;
use crate::store::domain::identity_store::{require_photo, IdentityStore, StoreError, StoreReader};

/// Flags redundant detections in one photo and commits the flags.
///
/// Must finish before any detection of the photo is resolved: resolution
/// reads the duplicate flag to decide whether to take part at all.
pub struct DeduplicatePhotoUseCase {
    store: Arc<dyn IdentityStore>,
    deduplicator: FrameDeduplicator,
}

impl DeduplicatePhotoUseCase {
    pub fn new(store: Arc<dyn IdentityStore>, deduplicator: FrameDeduplicator) -> Self {
        Self {
            store,
            deduplicator,
        }
    }

    /// Returns the photo's surviving (non-duplicate) detections, ordered by id.
    pub fn execute(&self, photo_id: PhotoId) -> Result<Vec<Detection>, StoreError> {
        let mut tx = self.store.begin()?;
        require_photo(&*tx, photo_id)?;
        let detections = tx.detections_for_photo(photo_id)?;

        let duplicates = self.deduplicator.duplicates(&detections);
        let mut survivors = Vec::with_capacity(detections.len());
        let mut changed = 0;
        for mut detection in detections {
            let flag = duplicates.contains(&detection.id);
            if detection.is_duplicate != flag {
                detection.is_duplicate = flag;
                tx.update_detection(detection.clone())?;
                changed += 1;
            }
            if !flag {
                survivors.push(detection);
            }
        }
        tx.commit()?;

        if !duplicates.is_empty() {
            log::debug!(
                "Photo {photo_id}: {} duplicate detection(s), {changed} flag(s) changed",
                duplicates.len()
            );
        }
        survivors.sort_by_key(|d| d.id);
        Ok(survivors)
    }
}
