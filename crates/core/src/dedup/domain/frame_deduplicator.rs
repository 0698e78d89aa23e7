use std::collections::HashSet;

use crate::shared::constants::DEFAULT_IOU_THRESHOLD;
use crate::shared::detection::Detection;
use crate::shared::ids::DetectionId;

/// Confidence-ordered greedy suppression of boxes the detector reported twice.
///
/// Equivalent to single-class NMS: every survivor is the highest-confidence
/// member of its overlap cluster. Nothing is removed, only flagged.
pub struct FrameDeduplicator {
    iou_threshold: f64,
}

impl FrameDeduplicator {
    pub fn new(iou_threshold: f64) -> Self {
        Self { iou_threshold }
    }

    /// Ids of the detections in one photo that duplicate a kept detection.
    ///
    /// Ties in confidence are broken by detection id so reruns agree.
    pub fn duplicates(&self, detections: &[Detection]) -> HashSet<DetectionId> {
        let mut duplicates = HashSet::new();
        if detections.len() <= 1 {
            return duplicates;
        }

        let mut ordered: Vec<&Detection> = detections.iter().collect();
        ordered.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut keepers: Vec<&Detection> = Vec::with_capacity(ordered.len());
        for d in ordered {
            let dominated = keepers
                .iter()
                .any(|k| d.bbox.iou(&k.bbox) > self.iou_threshold);
            if dominated {
                duplicates.insert(d.id);
            } else {
                keepers.push(d);
            }
        }
        duplicates
    }
}

impl Default for FrameDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::bounding_box::BoundingBox;
    use crate::shared::detection::ResolutionState;
    use crate::shared::ids::PhotoId;

    fn det(id: u64, x: u32, y: u32, w: u32, h: u32, confidence: f64) -> Detection {
        Detection {
            id: DetectionId(id),
            photo_id: PhotoId(1),
            bbox: BoundingBox::new(x, y, w, h),
            confidence,
            label: "doe".into(),
            is_duplicate: false,
            burst_group: None,
            identity_id: None,
            resolution: ResolutionState::Unresolved,
        }
    }

    #[test]
    fn test_empty_and_single_are_skipped() {
        let dedup = FrameDeduplicator::default();
        assert!(dedup.duplicates(&[]).is_empty());
        assert!(dedup.duplicates(&[det(1, 0, 0, 10, 10, 0.9)]).is_empty());
    }

    #[test]
    fn test_lower_confidence_overlap_is_duplicate() {
        let dedup = FrameDeduplicator::default();
        // IoU = 90*100 / (2*10000 - 9000) ≈ 0.818
        let dets = [det(1, 0, 0, 100, 100, 0.7), det(2, 10, 0, 100, 100, 0.95)];
        let dups = dedup.duplicates(&dets);
        assert_eq!(dups, HashSet::from([DetectionId(1)]));
    }

    #[test]
    fn test_separate_animals_both_kept() {
        let dedup = FrameDeduplicator::default();
        let dets = [det(1, 0, 0, 100, 100, 0.9), det(2, 300, 0, 100, 100, 0.8)];
        assert!(dedup.duplicates(&dets).is_empty());
    }

    #[test]
    fn test_overlap_at_threshold_is_not_duplicate() {
        // b inside a: IoU = 7500 / 15000 = 0.5 exactly
        let dedup = FrameDeduplicator::new(0.5);
        let dets = [det(1, 0, 0, 150, 100, 0.9), det(2, 0, 0, 75, 100, 0.8)];
        assert!(dedup.duplicates(&dets).is_empty());
    }

    #[test]
    fn test_suppression_is_not_transitive() {
        // b overlaps a and c, a and c do not overlap; b has lowest confidence.
        let dedup = FrameDeduplicator::new(0.3);
        let dets = [
            det(1, 0, 0, 100, 100, 0.9),
            det(2, 40, 0, 100, 100, 0.5),
            det(3, 80, 0, 100, 100, 0.8),
        ];
        let dups = dedup.duplicates(&dets);
        assert_eq!(dups, HashSet::from([DetectionId(2)]));
    }

    #[test]
    fn test_equal_confidence_keeps_lowest_id() {
        let dedup = FrameDeduplicator::default();
        let dets = [det(5, 0, 0, 100, 100, 0.8), det(3, 0, 0, 100, 100, 0.8)];
        assert_eq!(dedup.duplicates(&dets), HashSet::from([DetectionId(5)]));
    }

    #[test]
    fn test_idempotent_across_runs_and_input_order() {
        let dedup = FrameDeduplicator::default();
        let mut dets = vec![
            det(1, 0, 0, 100, 100, 0.6),
            det(2, 5, 5, 100, 100, 0.9),
            det(3, 400, 400, 50, 50, 0.4),
            det(4, 402, 398, 50, 50, 0.4),
        ];
        let first = dedup.duplicates(&dets);
        let second = dedup.duplicates(&dets);
        dets.reverse();
        let third = dedup.duplicates(&dets);
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(first, HashSet::from([DetectionId(1), DetectionId(4)]));
    }
}
