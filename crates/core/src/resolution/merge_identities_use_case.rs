use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::resolution::unresolve_use_case::recompute_identity;
use crate::shared::category::Category;
use crate::shared::detection::Detection;
use crate::shared::ids::{BurstGroupId, IdentityId};
use crate::store::domain::identity_store::{
    require_identity, IdentityStore, StoreError, StoreReader, StoreTransaction,
};

#[derive(Error, Debug)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot merge identity {absorb} ({absorb_category}) into {keep} ({keep_category})")]
    CategoryMismatch {
        keep: IdentityId,
        keep_category: Category,
        absorb: IdentityId,
        absorb_category: Category,
    },
    #[error("cannot merge identity {0} into itself")]
    SameIdentity(IdentityId),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub kept: IdentityId,
    /// `None` when the identity to absorb no longer existed.
    pub absorbed: Option<IdentityId>,
    /// Detections moved to the kept identity.
    pub moved: usize,
}

/// Folds duplicate identities together, the correction path for burst races
/// and for operator-identified duplicates.
pub struct MergeIdentitiesUseCase {
    store: Arc<dyn IdentityStore>,
}

impl MergeIdentitiesUseCase {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    /// Move every member of `absorb` to `keep` and delete `absorb`.
    ///
    /// A no-op when `absorb` is already gone, so repeating a merge is safe.
    pub fn merge(&self, keep: IdentityId, absorb: IdentityId) -> Result<MergeReport, MergeError> {
        if keep == absorb {
            return Err(MergeError::SameIdentity(keep));
        }
        let mut tx = self.store.begin()?;
        let report = merge_in(&mut *tx, keep, absorb)?;
        if report.absorbed.is_some() {
            tx.commit()?;
            log::info!(
                "Merged identity {absorb} into {keep} ({} detection(s) moved)",
                report.moved
            );
        }
        Ok(report)
    }

    /// Merge identities that share a burst group into the oldest of them.
    ///
    /// Splits come from tolerated burst races. Running this again after a
    /// successful pass finds nothing to do.
    pub fn reconcile_bursts(&self) -> Result<Vec<MergeReport>, MergeError> {
        let linked = self
            .store
            .detections_where(&|d: &Detection| {
                d.burst_group.is_some() && d.identity_id.is_some()
            })?;

        let mut groups: BTreeMap<BurstGroupId, BTreeSet<IdentityId>> = BTreeMap::new();
        for detection in &linked {
            if let (Some(group), Some(identity)) = (detection.burst_group, detection.identity_id) {
                groups.entry(group).or_default().insert(identity);
            }
        }

        let mut redirect: BTreeMap<IdentityId, IdentityId> = BTreeMap::new();
        let mut reports = Vec::new();
        for (group, identities) in groups {
            let current: BTreeSet<IdentityId> = identities
                .into_iter()
                .map(|id| follow(&redirect, id))
                .collect();
            let mut ids = current.into_iter();
            let Some(keep) = ids.next() else {
                continue;
            };
            for absorb in ids {
                match self.merge(keep, absorb) {
                    Ok(report) => {
                        redirect.insert(absorb, keep);
                        reports.push(report);
                    }
                    Err(MergeError::CategoryMismatch { .. }) => {
                        log::warn!(
                            "Burst group {group} spans identities of different categories ({keep}, {absorb}); left for manual review"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if !reports.is_empty() {
            log::info!("Reconciled {} split burst identity pair(s)", reports.len());
        }
        Ok(reports)
    }
}

fn follow(redirect: &BTreeMap<IdentityId, IdentityId>, mut id: IdentityId) -> IdentityId {
    while let Some(next) = redirect.get(&id) {
        id = *next;
    }
    id
}

fn merge_in<T: StoreTransaction + ?Sized>(
    tx: &mut T,
    keep: IdentityId,
    absorb: IdentityId,
) -> Result<MergeReport, MergeError> {
    let mut kept = require_identity(&*tx, keep)?;
    let Some(absorbed) = tx.identity(absorb)? else {
        log::debug!("Identity {absorb} already merged or removed");
        return Ok(MergeReport {
            kept: keep,
            absorbed: None,
            moved: 0,
        });
    };
    if kept.category != absorbed.category {
        return Err(MergeError::CategoryMismatch {
            keep,
            keep_category: kept.category,
            absorb,
            absorb_category: absorbed.category,
        });
    }

    let members = tx.detections_for_identity(absorb)?;
    let moved = members.len();
    for mut member in members {
        member.identity_id = Some(keep);
        tx.update_detection(member)?;
    }

    if kept.embeddings.fill_missing(&absorbed.embeddings) > 0 {
        kept.extractor_tag = kept.embeddings.extractor_tag();
    }
    tx.update_identity(kept)?;
    tx.delete_identity(absorb)?;
    recompute_identity(&mut *tx, keep)?;

    Ok(MergeReport {
        kept: keep,
        absorbed: Some(absorb),
        moved,
    })
}
