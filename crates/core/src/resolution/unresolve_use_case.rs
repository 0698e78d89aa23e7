use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use crate::shared::detection::{Detection, ResolutionState};
use crate::shared::identity::Sighting;
use crate::shared::ids::{DetectionId, IdentityId};
use crate::store::domain::identity_store::{
    require_detection, require_identity, require_photo, IdentityStore, StoreError, StoreReader,
    StoreTransaction,
};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UnresolveReport {
    /// Detections returned to `unresolved`.
    pub detections: Vec<DetectionId>,
    /// Identities whose statistics were rebuilt from their remaining members.
    pub updated_identities: Vec<IdentityId>,
    /// Identities left without any sighting event, and removed.
    pub deleted_identities: Vec<IdentityId>,
}

/// Sends detections back to the resolution queue and takes their
/// contribution out of identity statistics.
pub struct UnresolveUseCase {
    store: Arc<dyn IdentityStore>,
}

impl UnresolveUseCase {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Unresolve one detection together with the rest of its sighting event.
    pub fn detection(&self, id: DetectionId) -> Result<UnresolveReport, StoreError> {
        let mut tx = self.store.begin()?;
        let detection = require_detection(&*tx, id)?;
        let event = match detection.burst_group {
            Some(group) => tx.detections_in_burst_group(group)?,
            None => vec![detection],
        };
        let report = reset_members(&mut *tx, event)?;
        tx.commit()?;
        log::info!(
            "Unresolved {} detection(s) starting from {id}",
            report.detections.len()
        );
        Ok(report)
    }

    /// Unresolve every detection of an identity. The identity is removed.
    pub fn identity(&self, id: IdentityId) -> Result<UnresolveReport, StoreError> {
        let mut tx = self.store.begin()?;
        require_identity(&*tx, id)?;
        let members = tx.detections_for_identity(id)?;
        let report = reset_members(&mut *tx, members)?;
        tx.commit()?;
        log::info!(
            "Unresolved identity {id} ({} detection(s))",
            report.detections.len()
        );
        Ok(report)
    }
}

fn reset_members<T: StoreTransaction + ?Sized>(
    tx: &mut T,
    members: Vec<Detection>,
) -> Result<UnresolveReport, StoreError> {
    let mut report = UnresolveReport::default();
    let mut affected = BTreeSet::new();
    for mut detection in members {
        if detection.resolution == ResolutionState::Unresolved && detection.identity_id.is_none()
        {
            continue;
        }
        if let Some(identity_id) = detection.identity_id {
            affected.insert(identity_id);
        }
        report.detections.push(detection.id);
        detection.reset();
        tx.update_detection(detection)?;
    }

    for identity_id in affected {
        if recompute_identity(&mut *tx, identity_id)? {
            report.updated_identities.push(identity_id);
        } else {
            report.deleted_identities.push(identity_id);
        }
    }
    Ok(report)
}

/// Rebuild an identity's statistics from the members it has in `tx`.
///
/// Returns `false` if no sighting event remained, in which case the identity
/// is deleted and any leftover burst-linked members are reset.
pub(crate) fn recompute_identity<T: StoreTransaction + ?Sized>(
    tx: &mut T,
    id: IdentityId,
) -> Result<bool, StoreError> {
    let mut identity = require_identity(&*tx, id)?;
    let members = tx.detections_for_identity(id)?;

    let mut sightings = Vec::with_capacity(members.len());
    for member in &members {
        let photo = require_photo(&*tx, member.photo_id)?;
        sightings.push(Sighting {
            confidence: member.confidence,
            seen_at: photo.sighting_time(),
            is_event: member.resolution.counts_as_sighting(),
        });
    }

    if identity.recompute(&sightings) {
        tx.update_identity(identity)?;
        return Ok(true);
    }

    if !members.is_empty() {
        log::debug!(
            "Identity {id}: resetting {} burst-linked member(s) with no remaining event",
            members.len()
        );
    }
    for mut member in members {
        member.reset();
        tx.update_detection(member)?;
    }
    tx.delete_identity(id)?;
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::bounding_box::BoundingBox;
    use crate::shared::category::Category;
    use crate::shared::detection::RawDetection;
    use crate::shared::embedding::{Embedding, EmbeddingSet};
    use crate::shared::identity::{Identity, NewIdentity};
    use crate::shared::ids::BurstGroupId;
    use crate::shared::photo::NewPhoto;
    use crate::store::infrastructure::in_memory_store::InMemoryIdentityStore;
    use approx::assert_relative_eq;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ingest(store: &InMemoryIdentityStore, secs: i64, confidence: f64) -> DetectionId {
        let (_, detections) = store
            .ingest(
                NewPhoto {
                    path: format!("{secs}.jpg").into(),
                    location: Some("ridge".into()),
                    captured_at: Some(at(secs)),
                    uploaded_at: at(secs),
                },
                vec![RawDetection {
                    bbox: BoundingBox::new(0, 0, 80, 80),
                    confidence,
                    label: "doe".into(),
                }],
            )
            .unwrap();
        detections[0].id
    }

    fn new_identity(store: &InMemoryIdentityStore, confidence: f64, secs: i64) -> Identity {
        let mut embeddings = EmbeddingSet::new();
        embeddings.insert("reid", "1", Embedding::normalized(vec![1.0, 0.0]).unwrap());
        let mut tx = store.begin().unwrap();
        let identity = tx
            .insert_identity(NewIdentity {
                category: Category::Doe,
                embeddings,
                confidence,
                seen_at: at(secs),
            })
            .unwrap();
        tx.commit().unwrap();
        identity
    }

    fn assign(
        store: &InMemoryIdentityStore,
        id: DetectionId,
        identity: IdentityId,
        state: ResolutionState,
        group: Option<BurstGroupId>,
    ) {
        let mut tx = store.begin().unwrap();
        let mut detection = tx.detection(id).unwrap().unwrap();
        detection.identity_id = Some(identity);
        detection.resolution = state;
        detection.burst_group = group;
        tx.update_detection(detection).unwrap();
        tx.commit().unwrap();
    }

    /// Identity with a new-identity event at t=0 (0.9) and a match at t=600 (0.5).
    fn two_events(store: &InMemoryIdentityStore) -> (IdentityId, DetectionId, DetectionId) {
        let first = ingest(store, 0, 0.9);
        let second = ingest(store, 600, 0.5);
        let identity = new_identity(store, 0.9, 0);
        assign(store, first, identity.id, ResolutionState::NewIdentity, Some(BurstGroupId::new()));
        assign(store, second, identity.id, ResolutionState::Matched, Some(BurstGroupId::new()));

        let mut tx = store.begin().unwrap();
        let mut updated = tx.identity(identity.id).unwrap().unwrap();
        updated.record_sighting(0.5, at(600));
        tx.update_identity(updated).unwrap();
        tx.commit().unwrap();
        (identity.id, first, second)
    }

    #[test]
    fn test_unresolving_a_match_rolls_back_statistics() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let (identity, _, second) = two_events(&store);

        let report = UnresolveUseCase::new(store.clone()).detection(second).unwrap();

        assert_eq!(report.detections, vec![second]);
        assert_eq!(report.updated_identities, vec![identity]);
        assert!(report.deleted_identities.is_empty());

        let profile = store.identity(identity).unwrap().unwrap();
        assert_eq!(profile.sighting_count, 1);
        assert_relative_eq!(profile.confidence, 0.9);
        assert_eq!(profile.last_seen, at(0));

        let detection = store.detection(second).unwrap().unwrap();
        assert_eq!(detection.resolution, ResolutionState::Unresolved);
        assert_eq!(detection.identity_id, None);
        assert_eq!(detection.burst_group, None);
    }

    #[test]
    fn test_unresolving_a_sibling_takes_the_whole_burst() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let origin = ingest(&store, 0, 0.9);
        let sibling = ingest(&store, 2, 0.7);
        let identity = new_identity(&store, 0.9, 0);
        let group = BurstGroupId::new();
        assign(&store, origin, identity.id, ResolutionState::NewIdentity, Some(group));
        assign(&store, sibling, identity.id, ResolutionState::BurstLinked, Some(group));

        let report = UnresolveUseCase::new(store.clone()).detection(sibling).unwrap();

        assert_eq!(report.detections, vec![origin, sibling]);
        assert_eq!(report.deleted_identities, vec![identity.id]);
        assert!(store.identity(identity.id).unwrap().is_none());
    }

    #[test]
    fn test_unresolving_the_only_event_resets_linked_leftovers() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let origin = ingest(&store, 0, 0.9);
        let stray = ingest(&store, 3, 0.6);
        let identity = new_identity(&store, 0.9, 0);
        assign(&store, origin, identity.id, ResolutionState::NewIdentity, None);
        // linked under a different group, so not part of origin's event
        assign(
            &store,
            stray,
            identity.id,
            ResolutionState::BurstLinked,
            Some(BurstGroupId::new()),
        );

        let report = UnresolveUseCase::new(store.clone()).detection(origin).unwrap();

        assert_eq!(report.detections, vec![origin]);
        assert_eq!(report.deleted_identities, vec![identity.id]);
        let stray = store.detection(stray).unwrap().unwrap();
        assert_eq!(stray.resolution, ResolutionState::Unresolved);
        assert_eq!(stray.identity_id, None);
    }

    #[test]
    fn test_unresolving_an_identity_deletes_it() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let (identity, first, second) = two_events(&store);

        let report = UnresolveUseCase::new(store.clone()).identity(identity).unwrap();

        assert_eq!(report.detections, vec![first, second]);
        assert_eq!(report.deleted_identities, vec![identity]);
        assert!(store.identities().unwrap().is_empty());
    }

    #[test]
    fn test_unresolve_twice_is_a_no_op() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let (_, _, second) = two_events(&store);
        let use_case = UnresolveUseCase::new(store.clone());

        use_case.detection(second).unwrap();
        let again = use_case.detection(second).unwrap();
        assert_eq!(again, UnresolveReport::default());
    }

    #[test]
    fn test_unknown_identity_is_an_error() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let result = UnresolveUseCase::new(store).identity(IdentityId(9));
        assert!(matches!(result, Err(StoreError::IdentityNotFound(IdentityId(9)))));
    }
}
