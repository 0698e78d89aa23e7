//! Persistence ports for photos, detections and identities.
//!
//! Reads go through [`StoreReader`], implemented both by the store and by
//! an open transaction so the same query code runs inside and outside a
//! commit boundary. Every write happens inside a [`StoreTransaction`];
//! dropping a transaction without committing discards all of its writes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::shared::category::Category;
use crate::shared::detection::{Detection, RawDetection};
use crate::shared::identity::{Identity, NewIdentity};
use crate::shared::ids::{BurstGroupId, DetectionId, IdentityId, PhotoId};
use crate::shared::photo::{NewPhoto, Photo};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("photo {0} not found")]
    PhotoNotFound(PhotoId),
    #[error("detection {0} not found")]
    DetectionNotFound(DetectionId),
    #[error("identity {0} not found")]
    IdentityNotFound(IdentityId),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("store busy: {0}")]
    Contention(String),
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Contention and I/O failures may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Contention(_) | StoreError::Io { .. })
    }
}

pub trait StoreReader {
    fn photo(&self, id: PhotoId) -> Result<Option<Photo>, StoreError>;

    fn detection(&self, id: DetectionId) -> Result<Option<Detection>, StoreError>;

    fn detections_for_photo(&self, id: PhotoId) -> Result<Vec<Detection>, StoreError>;

    fn detections_for_identity(&self, id: IdentityId) -> Result<Vec<Detection>, StoreError>;

    fn detections_in_burst_group(&self, id: BurstGroupId) -> Result<Vec<Detection>, StoreError>;

    /// Photos at `location` captured within `[from, to]`, ordered by capture time.
    fn photos_between(
        &self,
        location: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Photo>, StoreError>;

    fn identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError>;

    fn identities_by_category(&self, category: Category) -> Result<Vec<Identity>, StoreError>;
}

/// An all-or-nothing unit of work. Writes are invisible outside until commit.
pub trait StoreTransaction: StoreReader {
    fn update_detection(&mut self, detection: Detection) -> Result<(), StoreError>;

    fn insert_identity(&mut self, identity: NewIdentity) -> Result<Identity, StoreError>;

    fn update_identity(&mut self, identity: Identity) -> Result<(), StoreError>;

    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Durable repository of photos, detections and identity profiles.
pub trait IdentityStore: StoreReader + Send + Sync {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;

    /// Record one photo and its raw detections, unresolved and not yet deduplicated.
    fn ingest(
        &self,
        photo: NewPhoto,
        detections: Vec<RawDetection>,
    ) -> Result<(Photo, Vec<Detection>), StoreError>;

    fn photos(&self) -> Result<Vec<Photo>, StoreError>;

    fn identities(&self) -> Result<Vec<Identity>, StoreError>;

    fn detections_where(
        &self,
        predicate: &dyn Fn(&Detection) -> bool,
    ) -> Result<Vec<Detection>, StoreError>;
}

/// Load a detection or fail with `DetectionNotFound`.
pub fn require_detection<R: StoreReader + ?Sized>(
    reader: &R,
    id: DetectionId,
) -> Result<Detection, StoreError> {
    reader
        .detection(id)?
        .ok_or(StoreError::DetectionNotFound(id))
}

pub fn require_photo<R: StoreReader + ?Sized>(
    reader: &R,
    id: PhotoId,
) -> Result<Photo, StoreError> {
    reader.photo(id)?.ok_or(StoreError::PhotoNotFound(id))
}

pub fn require_identity<R: StoreReader + ?Sized>(
    reader: &R,
    id: IdentityId,
) -> Result<Identity, StoreError> {
    reader.identity(id)?.ok_or(StoreError::IdentityNotFound(id))
}
