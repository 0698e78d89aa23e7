//! Mutex-guarded identity store with an optional JSON snapshot file.
//!
//! Transactions hold the store lock for their lifetime, buffer writes in an
//! overlay, and apply them on commit. When a snapshot path is configured the
//! whole state is rewritten atomically (temp file + rename) after each
//! commit; if that write fails the in-memory commit is undone.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shared::category::Category;
use crate::shared::detection::{Detection, RawDetection, ResolutionState};
use crate::shared::identity::{Identity, NewIdentity};
use crate::shared::ids::{BurstGroupId, DetectionId, IdentityId, PhotoId};
use crate::shared::photo::{NewPhoto, Photo};
use crate::store::domain::identity_store::{
    IdentityStore, StoreError, StoreReader, StoreTransaction,
};

pub struct InMemoryIdentityStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl InMemoryIdentityStore {
    /// A volatile store, used by tests and dry runs.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            snapshot: None,
        }
    }

    /// Open a store backed by `path`, loading it if the file exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let text = fs::read_to_string(path).map_err(|e| StoreError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            let snapshot: Snapshot =
                serde_json::from_str(&text).map_err(|e| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    source: e,
                })?;
            StoreState::from_snapshot(snapshot)
        } else {
            StoreState::default()
        };
        log::debug!(
            "Opened identity store {} ({} photos, {} detections, {} identities)",
            path.display(),
            state.photos.len(),
            state.detections.len(),
            state.identities.len()
        );
        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path.to_path_buf()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreState, &Overlay) -> T) -> Result<T, StoreError> {
        let state = self.lock()?;
        Ok(f(&state, &Overlay::default()))
    }
}

impl Default for InMemoryIdentityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreReader for InMemoryIdentityStore {
    fn photo(&self, id: PhotoId) -> Result<Option<Photo>, StoreError> {
        self.read(|s, _| s.photos.get(&id).cloned())
    }

    fn detection(&self, id: DetectionId) -> Result<Option<Detection>, StoreError> {
        self.read(|s, o| s.detection(o, id))
    }

    fn detections_for_photo(&self, id: PhotoId) -> Result<Vec<Detection>, StoreError> {
        self.read(|s, o| s.detections_for_photo(o, id))
    }

    fn detections_for_identity(&self, id: IdentityId) -> Result<Vec<Detection>, StoreError> {
        self.read(|s, o| s.detections_matching(o, |d| d.identity_id == Some(id)))
    }

    fn detections_in_burst_group(&self, id: BurstGroupId) -> Result<Vec<Detection>, StoreError> {
        self.read(|s, o| s.detections_matching(o, |d| d.burst_group == Some(id)))
    }

    fn photos_between(
        &self,
        location: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Photo>, StoreError> {
        self.read(|s, _| s.photos_between(location, from, to))
    }

    fn identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        self.read(|s, o| s.identity(o, id))
    }

    fn identities_by_category(&self, category: Category) -> Result<Vec<Identity>, StoreError> {
        self.read(|s, o| s.identities_matching(o, |i| i.category == category))
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        let state = self.lock()?;
        let next_identity_id = state.next_identity_id;
        Ok(Box::new(InMemoryTransaction {
            state,
            snapshot: self.snapshot.as_deref(),
            overlay: Overlay::default(),
            next_identity_id,
        }))
    }

    fn ingest(
        &self,
        photo: NewPhoto,
        detections: Vec<RawDetection>,
    ) -> Result<(Photo, Vec<Detection>), StoreError> {
        let mut state = self.lock()?;
        let (photo, stored) = state.insert_photo(photo, detections);

        if let Some(path) = &self.snapshot {
            if let Err(e) = state.persist(path) {
                state.remove_photo(photo.id);
                return Err(e);
            }
        }
        log::debug!(
            "Ingested photo {} with {} detections",
            photo.id,
            stored.len()
        );
        Ok((photo, stored))
    }

    fn photos(&self) -> Result<Vec<Photo>, StoreError> {
        self.read(|s, _| s.photos.values().cloned().collect())
    }

    fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.read(|s, o| s.identities_matching(o, |_| true))
    }

    fn detections_where(
        &self,
        predicate: &dyn Fn(&Detection) -> bool,
    ) -> Result<Vec<Detection>, StoreError> {
        self.read(|s, o| s.detections_matching(o, predicate))
    }
}

/// Uncommitted writes. `None` in `identities` marks a deletion.
#[derive(Default)]
struct Overlay {
    detections: BTreeMap<DetectionId, Detection>,
    identities: BTreeMap<IdentityId, Option<Identity>>,
}

struct InMemoryTransaction<'a> {
    state: MutexGuard<'a, StoreState>,
    snapshot: Option<&'a Path>,
    overlay: Overlay,
    next_identity_id: u64,
}

impl StoreReader for InMemoryTransaction<'_> {
    fn photo(&self, id: PhotoId) -> Result<Option<Photo>, StoreError> {
        Ok(self.state.photos.get(&id).cloned())
    }

    fn detection(&self, id: DetectionId) -> Result<Option<Detection>, StoreError> {
        Ok(self.state.detection(&self.overlay, id))
    }

    fn detections_for_photo(&self, id: PhotoId) -> Result<Vec<Detection>, StoreError> {
        Ok(self.state.detections_for_photo(&self.overlay, id))
    }

    fn detections_for_identity(&self, id: IdentityId) -> Result<Vec<Detection>, StoreError> {
        Ok(self
            .state
            .detections_matching(&self.overlay, |d| d.identity_id == Some(id)))
    }

    fn detections_in_burst_group(&self, id: BurstGroupId) -> Result<Vec<Detection>, StoreError> {
        Ok(self
            .state
            .detections_matching(&self.overlay, |d| d.burst_group == Some(id)))
    }

    fn photos_between(
        &self,
        location: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Photo>, StoreError> {
        Ok(self.state.photos_between(location, from, to))
    }

    fn identity(&self, id: IdentityId) -> Result<Option<Identity>, StoreError> {
        Ok(self.state.identity(&self.overlay, id))
    }

    fn identities_by_category(&self, category: Category) -> Result<Vec<Identity>, StoreError> {
        Ok(self
            .state
            .identities_matching(&self.overlay, |i| i.category == category))
    }
}

impl StoreTransaction for InMemoryTransaction<'_> {
    fn update_detection(&mut self, detection: Detection) -> Result<(), StoreError> {
        if !self.state.detections.contains_key(&detection.id) {
            return Err(StoreError::DetectionNotFound(detection.id));
        }
        self.overlay.detections.insert(detection.id, detection);
        Ok(())
    }

    fn insert_identity(&mut self, identity: NewIdentity) -> Result<Identity, StoreError> {
        self.next_identity_id += 1;
        let identity = identity.into_identity(IdentityId(self.next_identity_id));
        self.overlay
            .identities
            .insert(identity.id, Some(identity.clone()));
        Ok(identity)
    }

    fn update_identity(&mut self, identity: Identity) -> Result<(), StoreError> {
        if self.state.identity(&self.overlay, identity.id).is_none() {
            return Err(StoreError::IdentityNotFound(identity.id));
        }
        self.overlay.identities.insert(identity.id, Some(identity));
        Ok(())
    }

    fn delete_identity(&mut self, id: IdentityId) -> Result<(), StoreError> {
        if self.state.identity(&self.overlay, id).is_none() {
            return Err(StoreError::IdentityNotFound(id));
        }
        self.overlay.identities.insert(id, None);
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let overlay = std::mem::take(&mut self.overlay);
        let next_identity_id = self.next_identity_id;
        let undo = self.state.apply(overlay, next_identity_id);

        if let Some(path) = self.snapshot {
            if let Err(e) = self.state.persist(path) {
                log::warn!("Snapshot write failed, rolling back commit: {e}");
                self.state.revert(undo);
                return Err(e);
            }
        }
        Ok(())
    }
}

/// Previous values of everything a commit overwrote.
struct Undo {
    detections: Vec<Detection>,
    identities: Vec<(IdentityId, Option<Identity>)>,
    next_identity_id: u64,
}

#[derive(Default)]
struct StoreState {
    photos: BTreeMap<PhotoId, Photo>,
    detections: BTreeMap<DetectionId, Detection>,
    identities: BTreeMap<IdentityId, Identity>,
    by_photo: HashMap<PhotoId, Vec<DetectionId>>,
    by_location: HashMap<String, BTreeSet<(DateTime<Utc>, PhotoId)>>,
    next_photo_id: u64,
    next_detection_id: u64,
    next_identity_id: u64,
}

impl StoreState {
    fn detection(&self, overlay: &Overlay, id: DetectionId) -> Option<Detection> {
        overlay
            .detections
            .get(&id)
            .or_else(|| self.detections.get(&id))
            .cloned()
    }

    fn detections_for_photo(&self, overlay: &Overlay, id: PhotoId) -> Vec<Detection> {
        self.by_photo
            .get(&id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|d| self.detection(overlay, *d))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn detections_matching(
        &self,
        overlay: &Overlay,
        predicate: impl Fn(&Detection) -> bool,
    ) -> Vec<Detection> {
        self.detections
            .iter()
            .map(|(id, base)| overlay.detections.get(id).unwrap_or(base))
            .filter(|d| predicate(*d))
            .cloned()
            .collect()
    }

    fn identity(&self, overlay: &Overlay, id: IdentityId) -> Option<Identity> {
        match overlay.identities.get(&id) {
            Some(pending) => pending.clone(),
            None => self.identities.get(&id).cloned(),
        }
    }

    fn identities_matching(
        &self,
        overlay: &Overlay,
        predicate: impl Fn(&Identity) -> bool,
    ) -> Vec<Identity> {
        let ids: BTreeSet<IdentityId> = self
            .identities
            .keys()
            .chain(overlay.identities.keys())
            .copied()
            .collect();
        ids.into_iter()
            .filter_map(|id| self.identity(overlay, id))
            .filter(|i| predicate(i))
            .collect()
    }

    fn photos_between(&self, location: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Photo> {
        if from > to {
            return Vec::new();
        }
        self.by_location
            .get(location)
            .map(|index| {
                index
                    .range((from, PhotoId(0))..=(to, PhotoId(u64::MAX)))
                    .filter_map(|(_, id)| self.photos.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn insert_photo(&mut self, new: NewPhoto, raw: Vec<RawDetection>) -> (Photo, Vec<Detection>) {
        self.next_photo_id += 1;
        let photo = Photo {
            id: PhotoId(self.next_photo_id),
            path: new.path,
            location: new.location,
            captured_at: new.captured_at,
            uploaded_at: new.uploaded_at,
        };

        let mut stored = Vec::with_capacity(raw.len());
        for r in raw {
            self.next_detection_id += 1;
            stored.push(Detection {
                id: DetectionId(self.next_detection_id),
                photo_id: photo.id,
                bbox: r.bbox,
                confidence: r.confidence,
                label: r.label,
                is_duplicate: false,
                burst_group: None,
                identity_id: None,
                resolution: ResolutionState::Unresolved,
            });
        }

        for d in &stored {
            self.index_detection(d.clone());
        }
        self.index_photo(photo.clone());
        (photo, stored)
    }

    fn remove_photo(&mut self, id: PhotoId) {
        if let Some(photo) = self.photos.remove(&id) {
            if let (Some(location), Some(at)) = (&photo.location, photo.captured_at) {
                if let Some(index) = self.by_location.get_mut(location) {
                    index.remove(&(at, id));
                }
            }
        }
        for d in self.by_photo.remove(&id).unwrap_or_default() {
            self.detections.remove(&d);
        }
    }

    fn index_photo(&mut self, photo: Photo) {
        if let (Some(location), Some(at)) = (&photo.location, photo.captured_at) {
            self.by_location
                .entry(location.clone())
                .or_default()
                .insert((at, photo.id));
        }
        self.photos.insert(photo.id, photo);
    }

    fn index_detection(&mut self, detection: Detection) {
        self.by_photo
            .entry(detection.photo_id)
            .or_default()
            .push(detection.id);
        self.detections.insert(detection.id, detection);
    }

    fn apply(&mut self, overlay: Overlay, next_identity_id: u64) -> Undo {
        let mut undo = Undo {
            detections: Vec::with_capacity(overlay.detections.len()),
            identities: Vec::with_capacity(overlay.identities.len()),
            next_identity_id: self.next_identity_id,
        };
        for (id, detection) in overlay.detections {
            if let Some(previous) = self.detections.insert(id, detection) {
                undo.detections.push(previous);
            }
        }
        for (id, pending) in overlay.identities {
            let previous = match pending {
                Some(identity) => self.identities.insert(id, identity),
                None => self.identities.remove(&id),
            };
            undo.identities.push((id, previous));
        }
        self.next_identity_id = next_identity_id;
        undo
    }

    fn revert(&mut self, undo: Undo) {
        for detection in undo.detections {
            self.detections.insert(detection.id, detection);
        }
        for (id, previous) in undo.identities {
            match previous {
                Some(identity) => self.identities.insert(id, identity),
                None => self.identities.remove(&id),
            };
        }
        self.next_identity_id = undo.next_identity_id;
    }

    fn persist(&self, path: &Path) -> Result<(), StoreError> {
        let io_err = |p: &Path, e: std::io::Error| StoreError::Io {
            path: p.to_path_buf(),
            source: e,
        };
        let snapshot = SnapshotRef {
            next_photo_id: self.next_photo_id,
            next_detection_id: self.next_detection_id,
            next_identity_id: self.next_identity_id,
            photos: self.photos.values().collect(),
            detections: self.detections.values().collect(),
            identities: self.identities.values().collect(),
        };
        let bytes = serde_json::to_vec(&snapshot).map_err(|e| StoreError::Corrupt {
            path: path.to_path_buf(),
            source: e,
        })?;

        let temp_path = path.with_extension("tmp");
        let result = fs::File::create(&temp_path)
            .and_then(|mut file| {
                file.write_all(&bytes)?;
                file.sync_all()
            })
            .map_err(|e| io_err(&temp_path, e))
            .and_then(|()| fs::rename(&temp_path, path).map_err(|e| io_err(path, e)));

        if result.is_err() {
            let _ = fs::remove_file(&temp_path);
        }
        result
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = StoreState {
            next_photo_id: snapshot.next_photo_id,
            next_detection_id: snapshot.next_detection_id,
            next_identity_id: snapshot.next_identity_id,
            ..StoreState::default()
        };
        for photo in snapshot.photos {
            state.index_photo(photo);
        }
        for detection in snapshot.detections {
            state.index_detection(detection);
        }
        for identity in snapshot.identities {
            state.identities.insert(identity.id, identity);
        }
        state
    }
}

#[derive(Deserialize)]
struct Snapshot {
    next_photo_id: u64,
    next_detection_id: u64,
    next_identity_id: u64,
    photos: Vec<Photo>,
    detections: Vec<Detection>,
    identities: Vec<Identity>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    next_photo_id: u64,
    next_detection_id: u64,
    next_identity_id: u64,
    photos: Vec<&'a Photo>,
    detections: Vec<&'a Detection>,
    identities: Vec<&'a Identity>,
}
