use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::PhotoId;

/// A camera capture. Read-only once ingested.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub path: PathBuf,
    pub location: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
}

impl Photo {
    /// Time of the sighting: capture time, or upload time when the camera gave none.
    pub fn sighting_time(&self) -> DateTime<Utc> {
        self.captured_at.unwrap_or(self.uploaded_at)
    }
}

/// Photo metadata as delivered by ingestion, before an id is assigned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewPhoto {
    pub path: PathBuf,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
}
