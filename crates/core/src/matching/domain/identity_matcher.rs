//! Decides whether a detection's embeddings belong to a known identity.
//!
//! Candidates are restricted to the query's category. Each candidate gets
//! one score: the weighted ensemble of primary and auxiliary cosines when
//! every running auxiliary is available on both sides, otherwise the
//! primary cosine alone. Scores are raw cosines in [-1, 1] throughout.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::embedding::domain::extractor_set::ExtractorProfile;
use crate::matching::domain::similarity_log::{SimilarityLog, SimilarityRecord};
use crate::shared::category::Category;
use crate::shared::config::{EnsembleWeights, ResolverConfig};
use crate::shared::embedding::EmbeddingSet;
use crate::shared::identity::Identity;
use crate::shared::ids::{DetectionId, IdentityId};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatcherConfig {
    pub threshold: f64,
    pub weights: EnsembleWeights,
}

impl MatcherConfig {
    pub fn from_resolver(config: &ResolverConfig) -> Self {
        Self {
            threshold: config.match_threshold,
            weights: config.ensemble,
        }
    }

    /// Scores equal to the threshold are matches.
    pub fn accepts(&self, score: f64) -> bool {
        score >= self.threshold
    }
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self::from_resolver(&ResolverConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MatchResult {
    pub identity_id: IdentityId,
    pub score: f64,
    /// Cosine per extractor name.
    pub components: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MatchDecision {
    Matched(MatchResult),
    /// `best` is the highest-scoring candidate that fell short, if any.
    NoMatch { best: Option<MatchResult> },
}

struct Scored {
    score: f64,
    components: BTreeMap<String, f64>,
    ensemble: bool,
}

pub struct IdentityMatcher {
    config: MatcherConfig,
    log: Arc<dyn SimilarityLog>,
}

impl IdentityMatcher {
    pub fn new(config: MatcherConfig, log: Arc<dyn SimilarityLog>) -> Self {
        Self { config, log }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Best candidate of `category` for `query`, or no match.
    ///
    /// Ties go to the lowest identity id. Candidates of other categories or
    /// with no current-version primary vector are never scored.
    pub fn find_match(
        &self,
        detection_id: DetectionId,
        category: Category,
        query: &EmbeddingSet,
        profile: &ExtractorProfile,
        candidates: &[Identity],
    ) -> MatchDecision {
        let mut scored: Vec<(IdentityId, Scored)> = candidates
            .iter()
            .filter(|c| c.category == category)
            .filter_map(|c| self.score(query, profile, c).map(|s| (c.id, s)))
            .collect();
        scored.sort_by_key(|(id, _)| *id);

        let mut best: Option<MatchResult> = None;
        for (identity_id, s) in &scored {
            if best.as_ref().map_or(true, |b| s.score > b.score) {
                best = Some(MatchResult {
                    identity_id: *identity_id,
                    score: s.score,
                    components: s.components.clone(),
                });
            }
        }

        let decision = match best {
            Some(result) if self.config.accepts(result.score) => MatchDecision::Matched(result),
            best => MatchDecision::NoMatch { best },
        };

        let matched_id = match &decision {
            MatchDecision::Matched(result) => Some(result.identity_id),
            MatchDecision::NoMatch { .. } => None,
        };
        for (identity_id, s) in scored {
            let record = SimilarityRecord {
                detection_id,
                identity_id,
                category,
                components: s.components,
                score: s.score,
                ensemble: s.ensemble,
                matched: matched_id == Some(identity_id),
            };
            if let Err(e) = self.log.record(&record) {
                log::warn!("Dropping similarity record for detection {detection_id}: {e}");
            }
        }

        decision
    }

    fn score(
        &self,
        query: &EmbeddingSet,
        profile: &ExtractorProfile,
        candidate: &Identity,
    ) -> Option<Scored> {
        let primary = &profile.primary;
        let query_primary = query.current(&primary.name, &primary.version)?;
        let Some(candidate_primary) = candidate.embeddings.current(&primary.name, &primary.version)
        else {
            log::debug!(
                "Identity {} has no {}@{} vector, not comparable",
                candidate.id,
                primary.name,
                primary.version
            );
            return None;
        };

        let primary_score = query_primary.cosine(candidate_primary);
        let mut components = BTreeMap::from([(primary.name.clone(), primary_score)]);

        let auxiliary_scores: Option<Vec<(String, f64)>> = if profile.auxiliaries.is_empty() {
            None
        } else {
            profile
                .auxiliaries
                .iter()
                .map(|aux| {
                    let q = query.current(&aux.name, &aux.version)?;
                    let c = candidate.embeddings.current(&aux.name, &aux.version)?;
                    Some((aux.name.clone(), q.cosine(c)))
                })
                .collect()
        };

        let Some(auxiliary_scores) = auxiliary_scores else {
            return Some(Scored {
                score: primary_score,
                components,
                ensemble: false,
            });
        };

        let auxiliary_family = auxiliary_scores.iter().map(|(_, s)| s).sum::<f64>()
            / auxiliary_scores.len() as f64;
        components.extend(auxiliary_scores);
        let weights = self.config.weights;
        let score = (weights.primary * primary_score + weights.auxiliary * auxiliary_family)
            .clamp(-1.0, 1.0);
        Some(Scored {
            score,
            components,
            ensemble: true,
        })
    }
}
