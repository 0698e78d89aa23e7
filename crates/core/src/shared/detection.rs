use serde::{Deserialize, Serialize};

use super::bounding_box::BoundingBox;
use super::ids::{BurstGroupId, DetectionId, IdentityId, PhotoId};

/// Where a detection sits in the resolution lifecycle.
///
/// Everything except `Unresolved` is terminal until an explicit unresolve.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ResolutionState {
    #[default]
    Unresolved,
    BurstLinked,
    Matched,
    NewIdentity,
    /// Input was unusable (no crop, too small, unmapped label). Not retried.
    Skipped(String),
    /// Transient errors exhausted the retry budget.
    Failed(String),
}

impl ResolutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResolutionState::Unresolved)
    }

    /// Whether this detection counted as a sighting on its identity.
    pub fn counts_as_sighting(&self) -> bool {
        matches!(self, ResolutionState::Matched | ResolutionState::NewIdentity)
    }
}

/// One bounding box found in one photo.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: DetectionId,
    pub photo_id: PhotoId,
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub label: String,
    pub is_duplicate: bool,
    pub burst_group: Option<BurstGroupId>,
    pub identity_id: Option<IdentityId>,
    #[serde(default)]
    pub resolution: ResolutionState,
}

impl Detection {
    /// Clear every resolution field, returning the detection to the queue.
    pub fn reset(&mut self) {
        self.burst_group = None;
        self.identity_id = None;
        self.resolution = ResolutionState::Unresolved;
    }
}

/// Detector output for one box, before the store assigns an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f64,
    pub label: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ResolutionState::Unresolved.is_terminal());
        assert!(ResolutionState::BurstLinked.is_terminal());
        assert!(ResolutionState::Failed("x".into()).is_terminal());
    }

    #[test]
    fn test_only_resolved_events_count_as_sightings() {
        assert!(ResolutionState::Matched.counts_as_sighting());
        assert!(ResolutionState::NewIdentity.counts_as_sighting());
        assert!(!ResolutionState::BurstLinked.counts_as_sighting());
        assert!(!ResolutionState::Skipped("small".into()).counts_as_sighting());
    }

    #[test]
    fn test_state_serializes_with_reason() {
        let json = serde_json::to_string(&ResolutionState::Failed("oom".into())).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"oom"}"#);
        let back: ResolutionState = serde_json::from_str(r#"{"state":"matched"}"#).unwrap();
        assert_eq!(back, ResolutionState::Matched);
    }
}
