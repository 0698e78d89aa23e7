use chrono::{DateTime, Duration, Utc};

use crate::shared::constants::{DEFAULT_BURST_WINDOW_SECS, MAX_BURST_WINDOW_SECS};
use crate::shared::detection::Detection;
use crate::shared::ids::{BurstGroupId, IdentityId};
use crate::store::domain::identity_store::{require_photo, StoreError, StoreReader};

/// Detections believed to show one sighting event.
#[derive(Clone, Debug, PartialEq)]
pub struct Burst {
    pub origin: Detection,
    /// Same label, other photos, same location, inside the window. Ordered by id.
    pub siblings: Vec<Detection>,
}

impl Burst {
    pub fn len(&self) -> usize {
        self.siblings.len() + 1
    }

    pub fn members(&self) -> impl Iterator<Item = &Detection> {
        std::iter::once(&self.origin).chain(self.siblings.iter())
    }

    /// The identity already given to a sibling, with that sibling's burst group.
    ///
    /// Lowest detection id wins when siblings disagree.
    pub fn assigned_identity(&self) -> Option<(IdentityId, Option<BurstGroupId>)> {
        self.siblings
            .iter()
            .find_map(|d| d.identity_id.map(|id| (id, d.burst_group)))
    }

    /// Members still free to be linked: anything without an identity.
    pub fn unclaimed(&self) -> impl Iterator<Item = &Detection> {
        self.members().filter(|d| d.identity_id.is_none())
    }
}

/// Finds same-label detections captured close together at one location.
pub struct BurstGrouper {
    window: Duration,
}

impl BurstGrouper {
    /// `window_secs` is clamped to `[0, MAX_BURST_WINDOW_SECS]`.
    pub fn new(window_secs: i64) -> Self {
        Self {
            window: Duration::seconds(window_secs.clamp(0, MAX_BURST_WINDOW_SECS)),
        }
    }

    /// The burst around `detection`. Just the detection when its photo has
    /// no capture time or no location.
    pub fn collect<R: StoreReader + ?Sized>(
        &self,
        reader: &R,
        detection: &Detection,
    ) -> Result<Burst, StoreError> {
        let photo = require_photo(reader, detection.photo_id)?;
        let (Some(location), Some(captured_at)) = (&photo.location, photo.captured_at) else {
            return Ok(Burst {
                origin: detection.clone(),
                siblings: Vec::new(),
            });
        };

        let mut siblings = Vec::new();
        let nearby = reader.photos_between(
            location,
            captured_at
                .checked_sub_signed(self.window)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            captured_at
                .checked_add_signed(self.window)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )?;
        for other in nearby.iter().filter(|p| p.id != photo.id) {
            siblings.extend(
                reader
                    .detections_for_photo(other.id)?
                    .into_iter()
                    .filter(|d| !d.is_duplicate && d.label == detection.label),
            );
        }
        siblings.sort_by_key(|d| d.id);

        Ok(Burst {
            origin: detection.clone(),
            siblings,
        })
    }
}

impl Default for BurstGrouper {
    fn default() -> Self {
        Self::new(DEFAULT_BURST_WINDOW_SECS)
    }
}
