use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

use crate::shared::category::Category;
use crate::shared::ids::{DetectionId, IdentityId};

#[derive(Error, Debug)]
pub enum SimilarityLogError {
    #[error("similarity log write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("similarity record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("similarity log writer has stopped")]
    Closed,
}

/// One query-vs-candidate comparison, kept for threshold tuning.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimilarityRecord {
    pub detection_id: DetectionId,
    pub identity_id: IdentityId,
    pub category: Category,
    pub components: BTreeMap<String, f64>,
    pub score: f64,
    pub ensemble: bool,
    pub matched: bool,
}

/// Sink for similarity records. Failures are reported, never acted on.
pub trait SimilarityLog: Send + Sync {
    fn record(&self, record: &SimilarityRecord) -> Result<(), SimilarityLogError>;
}

/// Discards every record.
pub struct NullSimilarityLog;

impl SimilarityLog for NullSimilarityLog {
    fn record(&self, _record: &SimilarityRecord) -> Result<(), SimilarityLogError> {
        Ok(())
    }
}
