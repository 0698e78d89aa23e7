use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::category::Category;
use super::embedding::EmbeddingSet;
use super::ids::IdentityId;

/// A persistent profile for one believed-unique animal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub category: Category,
    pub embeddings: EmbeddingSet,
    pub extractor_tag: String,
    pub confidence: f64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sighting_count: u32,
}

/// Fields for an identity about to be created; the store assigns the id.
#[derive(Clone, Debug, PartialEq)]
pub struct NewIdentity {
    pub category: Category,
    pub embeddings: EmbeddingSet,
    pub confidence: f64,
    pub seen_at: DateTime<Utc>,
}

impl NewIdentity {
    pub fn into_identity(self, id: IdentityId) -> Identity {
        Identity {
            id,
            category: self.category,
            extractor_tag: self.embeddings.extractor_tag(),
            embeddings: self.embeddings,
            confidence: self.confidence,
            first_seen: self.seen_at,
            last_seen: self.seen_at,
            sighting_count: 1,
        }
    }
}

/// One member detection's contribution to identity statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sighting {
    pub confidence: f64,
    pub seen_at: DateTime<Utc>,
    /// False for burst siblings, which extend the time bounds but are not events.
    pub is_event: bool,
}

impl Identity {
    /// Fold one more sighting event into the running statistics.
    pub fn record_sighting(&mut self, confidence: f64, seen_at: DateTime<Utc>) {
        let n = self.sighting_count as f64;
        self.confidence = (self.confidence * n + confidence) / (n + 1.0);
        self.sighting_count += 1;
        self.extend_bounds(seen_at);
    }

    pub fn extend_bounds(&mut self, seen_at: DateTime<Utc>) {
        if seen_at < self.first_seen {
            self.first_seen = seen_at;
        }
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }

    /// Rebuild statistics from the full member list.
    ///
    /// Returns `false` when no sighting event remains, meaning the identity
    /// no longer has any evidence and should be removed.
    pub fn recompute(&mut self, members: &[Sighting]) -> bool {
        let events: Vec<&Sighting> = members.iter().filter(|s| s.is_event).collect();
        if events.is_empty() {
            return false;
        }
        self.sighting_count = events.len() as u32;
        self.confidence = events.iter().map(|s| s.confidence).sum::<f64>() / events.len() as f64;

        // events is non-empty, so members is too
        let mut first = members[0].seen_at;
        let mut last = members[0].seen_at;
        for s in members {
            first = first.min(s.seen_at);
            last = last.max(s.seen_at);
        }
        self.first_seen = first;
        self.last_seen = last;
        true
    }

    /// Adopt embedding slots the identity lacks or holds at a stale version.
    pub fn refresh_embeddings(&mut self, fresh: &EmbeddingSet) -> usize {
        let written = self.embeddings.fill_from(fresh);
        if written > 0 {
            self.extractor_tag = self.embeddings.extractor_tag();
        }
        written
    }
}
