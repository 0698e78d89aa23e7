//! Resolves one detection to an existing or new identity.
//!
//! Flow: skip duplicates and detections already in a terminal state, map the
//! label to a category, and reuse an identity already assigned to a burst
//! sibling when there is one. Otherwise crop, embed, match, and commit the
//! identity change together with every burst member's link in a single
//! transaction. Transient extractor and store failures retry the whole
//! attempt with backoff; when the budget runs out the detection is marked
//! failed.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::burst::domain::burst_grouper::{Burst, BurstGrouper};
use crate::embedding::domain::crop_source::CropSource;
use crate::embedding::domain::embedding_extractor::ExtractError;
use crate::embedding::infrastructure::extractor_registry::ExtractorRegistry;
use crate::matching::domain::identity_matcher::{IdentityMatcher, MatchDecision, MatcherConfig};
use crate::matching::domain::similarity_log::{NullSimilarityLog, SimilarityLog};
use crate::resolution::resolution_logger::{NullResolutionLogger, ResolutionLogger};
use crate::resolution::resolution_outcome::{ResolutionOutcome, ResolutionStatus};
use crate::resolution::retry::{RetryFailure, RetryPolicy};
use crate::shared::category::Category;
use crate::shared::config::ResolverConfig;
use crate::shared::detection::{Detection, ResolutionState};
use crate::shared::embedding::EmbeddingSet;
use crate::shared::identity::{Identity, NewIdentity};
use crate::shared::ids::{BurstGroupId, DetectionId};
use crate::store::domain::identity_store::{
    require_detection, require_identity, require_photo, IdentityStore, StoreError, StoreReader,
    StoreTransaction,
};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Re-read the burst inside the commit transaction and link to an
    /// identity a concurrent resolution assigned in the meantime.
    pub recheck_burst: bool,
    /// Give matched identities any extractor slots they lack or hold stale.
    pub refresh_embeddings: bool,
}

impl ResolveOptions {
    pub fn from_resolver(config: &ResolverConfig) -> Self {
        Self {
            recheck_burst: config.recheck_burst_in_transaction,
            refresh_embeddings: config.refresh_embeddings,
        }
    }
}

/// Failure of one resolution attempt.
enum AttemptError {
    Store(StoreError),
    Extract(ExtractError),
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Store(e) => e.is_transient(),
            AttemptError::Extract(e) => e.is_transient(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptError::Store(e) => write!(f, "{e}"),
            AttemptError::Extract(e) => write!(f, "{e}"),
        }
    }
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        AttemptError::Store(e)
    }
}

impl From<ExtractError> for AttemptError {
    fn from(e: ExtractError) -> Self {
        AttemptError::Extract(e)
    }
}

pub struct ResolveDetectionUseCase {
    store: Arc<dyn IdentityStore>,
    crops: Arc<dyn CropSource>,
    extractors: Arc<ExtractorRegistry>,
    grouper: BurstGrouper,
    matcher: IdentityMatcher,
    retry: RetryPolicy,
    options: ResolveOptions,
    logger: Arc<dyn ResolutionLogger>,
}

impl ResolveDetectionUseCase {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        crops: Arc<dyn CropSource>,
        extractors: Arc<ExtractorRegistry>,
        config: &ResolverConfig,
    ) -> Self {
        Self {
            store,
            crops,
            extractors,
            grouper: BurstGrouper::new(config.burst_window_secs),
            matcher: IdentityMatcher::new(
                MatcherConfig::from_resolver(config),
                Arc::new(NullSimilarityLog),
            ),
            retry: RetryPolicy::new(&config.retry),
            options: ResolveOptions::from_resolver(config),
            logger: Arc::new(NullResolutionLogger),
        }
    }

    pub fn with_similarity_log(mut self, log: Arc<dyn SimilarityLog>) -> Self {
        self.matcher = IdentityMatcher::new(*self.matcher.config(), log);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ResolutionLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Resolve `id` and report what happened to it.
    ///
    /// Errors only for store failures that cannot be recorded on the
    /// detection itself, such as an unknown id.
    pub fn execute(&self, id: DetectionId) -> Result<ResolutionOutcome, ResolveError> {
        let attempt = self.retry.run(
            &format!("resolving detection {id}"),
            || self.attempt(id),
            AttemptError::is_transient,
        );

        let outcome = match attempt {
            Ok(outcome) => outcome,
            Err(RetryFailure {
                error: AttemptError::Store(e),
                ..
            }) if !e.is_transient() => return Err(e.into()),
            Err(RetryFailure { error, attempts }) => {
                let reason = if attempts > 1 {
                    format!("{error} (gave up after {attempts} attempts)")
                } else {
                    error.to_string()
                };
                self.retry
                    .run(
                        &format!("recording failure of detection {id}"),
                        || self.record_terminal(id, ResolutionStatus::Failed, reason.clone()),
                        StoreError::is_transient,
                    )
                    .map_err(|f| f.error)?
            }
        };

        log::debug!(
            "Detection {id}: {} (identity {:?}, score {:?})",
            outcome.status,
            outcome.identity_id,
            outcome.score
        );
        self.logger.record(&outcome);
        Ok(outcome)
    }

    fn attempt(&self, id: DetectionId) -> Result<ResolutionOutcome, AttemptError> {
        let detection = require_detection(self.store.as_ref(), id)?;
        if detection.is_duplicate {
            return Ok(ResolutionOutcome::duplicate(id));
        }
        if let Some(outcome) = ResolutionOutcome::recorded(&detection) {
            log::debug!("Detection {id} already resolved, returning stored outcome");
            return Ok(outcome);
        }

        let category = match Category::from_label(&detection.label) {
            Ok(category) => category,
            Err(e) => {
                return Ok(self.record_terminal(id, ResolutionStatus::Skipped, e.to_string())?)
            }
        };

        if let Some(outcome) = self.link_to_claimed_burst(&detection)? {
            return Ok(outcome);
        }

        let photo = require_photo(self.store.as_ref(), detection.photo_id)?;
        let crop = match self.crops.crop(&photo.path, &detection.bbox) {
            Ok(crop) => crop,
            Err(e) => {
                return Ok(self.record_terminal(id, ResolutionStatus::Skipped, e.to_string())?)
            }
        };

        let extractors = self.extractors.extractor_set()?;
        let Some(embeddings) = extractors.extract(&crop)? else {
            return Ok(self.record_terminal(
                id,
                ResolutionStatus::Skipped,
                "crop unusable for embedding (below minimum size or blank)".into(),
            )?);
        };

        let candidates = self.store.identities_by_category(category)?;
        let decision = self.matcher.find_match(
            id,
            category,
            &embeddings,
            &extractors.profile(),
            &candidates,
        );

        Ok(self.commit_resolution(id, category, embeddings, decision, photo.sighting_time())?)
    }

    /// Link to the identity a burst sibling already holds, without extracting.
    fn link_to_claimed_burst(
        &self,
        detection: &Detection,
    ) -> Result<Option<ResolutionOutcome>, StoreError> {
        let burst = self.grouper.collect(self.store.as_ref(), detection)?;
        if burst.assigned_identity().is_none() {
            return Ok(None);
        }

        let mut tx = self.store.begin()?;
        let current = require_detection(&*tx, detection.id)?;
        if let Some(outcome) = ResolutionOutcome::recorded(&current) {
            return Ok(Some(outcome));
        }
        let burst = self.grouper.collect(&*tx, &current)?;
        match burst.assigned_identity() {
            Some((identity_id, group)) => {
                let mut identity = require_identity(&*tx, identity_id)?;
                let outcome =
                    link_burst(&mut *tx, &burst, &mut identity, group.unwrap_or_default())?;
                tx.commit()?;
                Ok(Some(outcome))
            }
            None => Ok(None),
        }
    }

    fn commit_resolution(
        &self,
        id: DetectionId,
        category: Category,
        embeddings: EmbeddingSet,
        decision: MatchDecision,
        seen_at: DateTime<Utc>,
    ) -> Result<ResolutionOutcome, StoreError> {
        let mut tx = self.store.begin()?;
        let current = require_detection(&*tx, id)?;
        if let Some(outcome) = ResolutionOutcome::recorded(&current) {
            return Ok(outcome);
        }
        let burst = self.grouper.collect(&*tx, &current)?;

        if self.options.recheck_burst {
            if let Some((identity_id, group)) = burst.assigned_identity() {
                log::info!(
                    "Detection {id}: burst was linked to identity {identity_id} during extraction"
                );
                let mut identity = require_identity(&*tx, identity_id)?;
                let outcome =
                    link_burst(&mut *tx, &burst, &mut identity, group.unwrap_or_default())?;
                tx.commit()?;
                return Ok(outcome);
            }
        }

        // An existing group id keeps a split burst visible to reconciliation.
        let group = burst
            .members()
            .find_map(|d| d.burst_group)
            .unwrap_or_default();

        let (mut identity, status, best) = match decision {
            MatchDecision::Matched(result) => {
                let Some(mut identity) = tx.identity(result.identity_id)? else {
                    return Err(StoreError::Contention(format!(
                        "identity {} was removed during resolution",
                        result.identity_id
                    )));
                };
                identity.record_sighting(current.confidence, seen_at);
                if self.options.refresh_embeddings {
                    let refreshed = identity.refresh_embeddings(&embeddings);
                    if refreshed > 0 {
                        log::debug!("Identity {}: refreshed {refreshed} embedding slot(s)", identity.id);
                    }
                }
                (identity, ResolutionStatus::Matched, Some(result))
            }
            MatchDecision::NoMatch { best } => {
                let identity = tx.insert_identity(NewIdentity {
                    category,
                    embeddings,
                    confidence: current.confidence,
                    seen_at,
                })?;
                (identity, ResolutionStatus::NewIdentity, best)
            }
        };

        let origin_state = if status == ResolutionStatus::Matched {
            ResolutionState::Matched
        } else {
            ResolutionState::NewIdentity
        };
        let linked = link_members(&mut *tx, &burst, &mut identity, group, origin_state)?;
        let identity_id = identity.id;
        tx.update_identity(identity)?;
        tx.commit()?;

        Ok(ResolutionOutcome {
            detection_id: id,
            status,
            identity_id: Some(identity_id),
            score: best.as_ref().map(|b| b.score),
            component_scores: best.map(|b| b.components).unwrap_or_default(),
            burst_group: Some(group),
            burst_size: linked,
            reason: None,
        })
    }

    /// Mark an unresolved detection skipped or failed in its own transaction.
    fn record_terminal(
        &self,
        id: DetectionId,
        status: ResolutionStatus,
        reason: String,
    ) -> Result<ResolutionOutcome, StoreError> {
        let mut tx = self.store.begin()?;
        let mut detection = require_detection(&*tx, id)?;
        if let Some(outcome) = ResolutionOutcome::recorded(&detection) {
            return Ok(outcome);
        }
        detection.resolution = if status == ResolutionStatus::Failed {
            ResolutionState::Failed(reason.clone())
        } else {
            ResolutionState::Skipped(reason.clone())
        };
        tx.update_detection(detection)?;
        tx.commit()?;
        Ok(ResolutionOutcome::unresolvable(id, status, reason))
    }
}

/// Link every unclaimed member of `burst` to `identity` as burst-linked.
fn link_burst<T: StoreTransaction + ?Sized>(
    tx: &mut T,
    burst: &Burst,
    identity: &mut Identity,
    group: BurstGroupId,
) -> Result<ResolutionOutcome, StoreError> {
    let linked = link_members(&mut *tx, burst, identity, group, ResolutionState::BurstLinked)?;
    let identity_id = identity.id;
    tx.update_identity(identity.clone())?;
    Ok(ResolutionOutcome {
        detection_id: burst.origin.id,
        status: ResolutionStatus::BurstLinked,
        identity_id: Some(identity_id),
        score: None,
        component_scores: Default::default(),
        burst_group: Some(group),
        burst_size: linked,
        reason: None,
    })
}

/// Assign `identity` and `group` to every burst member without an identity.
///
/// The origin takes `origin_state`; siblings become burst-linked and only
/// widen the identity's time bounds. Returns the number of members linked.
fn link_members<T: StoreTransaction + ?Sized>(
    tx: &mut T,
    burst: &Burst,
    identity: &mut Identity,
    group: BurstGroupId,
    origin_state: ResolutionState,
) -> Result<usize, StoreError> {
    let members: Vec<Detection> = burst.unclaimed().cloned().collect();
    for mut member in members.iter().cloned() {
        let is_origin = member.id == burst.origin.id;
        if !is_origin {
            let photo = require_photo(&*tx, member.photo_id)?;
            identity.extend_bounds(photo.sighting_time());
        }
        member.identity_id = Some(identity.id);
        member.burst_group = Some(group);
        member.resolution = if is_origin {
            origin_state.clone()
        } else {
            ResolutionState::BurstLinked
        };
        tx.update_detection(member)?;
    }
    Ok(members.len())
}
