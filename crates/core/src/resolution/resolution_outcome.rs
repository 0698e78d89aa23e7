use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::shared::detection::{Detection, ResolutionState};
use crate::shared::ids::{BurstGroupId, DetectionId, IdentityId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    BurstLinked,
    Matched,
    NewIdentity,
    Skipped,
    Failed,
}

impl ResolutionStatus {
    pub const ALL: [ResolutionStatus; 5] = [
        ResolutionStatus::BurstLinked,
        ResolutionStatus::Matched,
        ResolutionStatus::NewIdentity,
        ResolutionStatus::Skipped,
        ResolutionStatus::Failed,
    ];

    /// `None` for a detection still waiting to be resolved.
    pub fn from_state(state: &ResolutionState) -> Option<Self> {
        match state {
            ResolutionState::Unresolved => None,
            ResolutionState::BurstLinked => Some(Self::BurstLinked),
            ResolutionState::Matched => Some(Self::Matched),
            ResolutionState::NewIdentity => Some(Self::NewIdentity),
            ResolutionState::Skipped(_) => Some(Self::Skipped),
            ResolutionState::Failed(_) => Some(Self::Failed),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BurstLinked => "burst-linked",
            Self::Matched => "matched",
            Self::NewIdentity => "new-identity",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the detection a resolution task was started for.
///
/// For `NewIdentity`, `score` and `component_scores` describe the best
/// candidate that fell below the threshold, if there was one.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolutionOutcome {
    pub detection_id: DetectionId,
    pub status: ResolutionStatus,
    pub identity_id: Option<IdentityId>,
    pub score: Option<f64>,
    pub component_scores: BTreeMap<String, f64>,
    pub burst_group: Option<BurstGroupId>,
    /// Detections linked by this resolution, the initiating one included.
    pub burst_size: usize,
    pub reason: Option<String>,
}

impl ResolutionOutcome {
    /// Outcome of a duplicate detection, which is never resolved.
    pub fn duplicate(detection_id: DetectionId) -> Self {
        Self::unresolvable(
            detection_id,
            ResolutionStatus::Skipped,
            "duplicate detection in photo".into(),
        )
    }

    /// Outcome of a detection that could not be resolved.
    pub fn unresolvable(detection_id: DetectionId, status: ResolutionStatus, reason: String) -> Self {
        Self {
            detection_id,
            status,
            identity_id: None,
            score: None,
            component_scores: BTreeMap::new(),
            burst_group: None,
            burst_size: 0,
            reason: Some(reason),
        }
    }

    /// Outcome already stored on a detection in a terminal state.
    ///
    /// Scores are not persisted, so they are absent here.
    pub fn recorded(detection: &Detection) -> Option<Self> {
        let status = ResolutionStatus::from_state(&detection.resolution)?;
        let reason = match &detection.resolution {
            ResolutionState::Skipped(r) | ResolutionState::Failed(r) => Some(r.clone()),
            _ => None,
        };
        Some(Self {
            detection_id: detection.id,
            status,
            identity_id: detection.identity_id,
            score: None,
            component_scores: BTreeMap::new(),
            burst_group: detection.burst_group,
            burst_size: 0,
            reason,
        })
    }
}
