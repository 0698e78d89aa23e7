use std::sync::Arc;

use crate::embedding::domain::embedding_extractor::{EmbeddingExtractor, ExtractError};
use crate::shared::crop::Crop;
use crate::shared::embedding::EmbeddingSet;

/// Name and version of one extractor, as recorded next to stored vectors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractorKey {
    pub name: String,
    pub version: String,
}

impl ExtractorKey {
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }

    fn of(extractor: &dyn EmbeddingExtractor) -> Self {
        Self::new(extractor.name(), extractor.version())
    }
}

/// Which extractors are running, split by role.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractorProfile {
    pub primary: ExtractorKey,
    pub auxiliaries: Vec<ExtractorKey>,
}

/// The configured primary extractor plus any auxiliaries.
#[derive(Clone)]
pub struct ExtractorSet {
    primary: Arc<dyn EmbeddingExtractor>,
    auxiliaries: Vec<Arc<dyn EmbeddingExtractor>>,
}

impl ExtractorSet {
    pub fn new(
        primary: Arc<dyn EmbeddingExtractor>,
        auxiliaries: Vec<Arc<dyn EmbeddingExtractor>>,
    ) -> Self {
        Self {
            primary,
            auxiliaries,
        }
    }

    pub fn profile(&self) -> ExtractorProfile {
        ExtractorProfile {
            primary: ExtractorKey::of(self.primary.as_ref()),
            auxiliaries: self
                .auxiliaries
                .iter()
                .map(|a| ExtractorKey::of(a.as_ref()))
                .collect(),
        }
    }

    /// Embed `crop` with every extractor.
    ///
    /// `Ok(None)` when the primary finds the crop unusable. Auxiliary
    /// failures only shrink the returned set; primary failures propagate.
    /// Auxiliaries run on scoped threads alongside the primary.
    pub fn extract(&self, crop: &Crop) -> Result<Option<EmbeddingSet>, ExtractError> {
        let (primary, auxiliary) = std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .auxiliaries
                .iter()
                .map(|aux| scope.spawn(move || aux.extract(crop)))
                .collect();
            let primary = self.primary.extract(crop);
            let auxiliary: Vec<_> = handles.into_iter().map(|h| h.join()).collect();
            (primary, auxiliary)
        });

        let Some(vector) = primary? else {
            return Ok(None);
        };

        let mut set = EmbeddingSet::new();
        set.insert(self.primary.name(), self.primary.version(), vector);

        for (aux, outcome) in self.auxiliaries.iter().zip(auxiliary) {
            match outcome {
                Ok(Ok(Some(vector))) => {
                    if vector.dimension() == aux.dimension() {
                        set.insert(aux.name(), aux.version(), vector);
                    } else {
                        log::warn!(
                            "Auxiliary extractor '{}' returned {} dims, expected {}",
                            aux.name(),
                            vector.dimension(),
                            aux.dimension()
                        );
                    }
                }
                Ok(Ok(None)) => log::debug!("Auxiliary extractor '{}' found crop unusable", aux.name()),
                Ok(Err(e)) => log::warn!("Auxiliary extractor '{}' failed: {e}", aux.name()),
                Err(_) => log::warn!("Auxiliary extractor '{}' panicked", aux.name()),
            }
        }
        Ok(Some(set))
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }
}
