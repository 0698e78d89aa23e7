use std::sync::{Arc, OnceLock};

use crate::embedding::domain::embedding_extractor::{EmbeddingExtractor, ExtractError};
use crate::embedding::domain::extractor_set::ExtractorSet;
use crate::embedding::infrastructure::model_resolver;
use crate::embedding::infrastructure::onnx_embedding_extractor::OnnxEmbeddingExtractor;
use crate::shared::config::{ExtractorConfig, ExtractorRole, ResolverConfig};

type LoadResult = Result<Arc<dyn EmbeddingExtractor>, ExtractError>;
type Loader = dyn Fn(&ExtractorConfig) -> LoadResult + Send + Sync;

/// Loads each configured extractor at most once, on first use.
///
/// Concurrent first callers block on the same initialization; every later
/// caller shares the loaded model. A load failure is remembered as well, so
/// a broken model file is not retried per detection.
pub struct ExtractorRegistry {
    configs: Vec<ExtractorConfig>,
    loader: Box<Loader>,
    slots: Vec<OnceLock<LoadResult>>,
}

impl ExtractorRegistry {
    /// Registry that loads ONNX models resolved through the model cache.
    pub fn onnx(config: &ResolverConfig) -> Self {
        let model_dir = config.model_dir.clone();
        let min_crop_px = config.min_crop_px;
        Self::with_loader(config.extractors.clone(), move |extractor| {
            let path = model_resolver::resolve(
                &extractor.model,
                extractor.url.as_deref(),
                model_dir.as_deref(),
            )
            .map_err(|e| ExtractError::ModelLoad {
                extractor: extractor.name.clone(),
                message: e.to_string(),
            })?;
            let loaded = OnnxEmbeddingExtractor::new(extractor, &path, min_crop_px)?;
            Ok(Arc::new(loaded) as Arc<dyn EmbeddingExtractor>)
        })
    }

    pub fn with_loader<F>(configs: Vec<ExtractorConfig>, loader: F) -> Self
    where
        F: Fn(&ExtractorConfig) -> LoadResult + Send + Sync + 'static,
    {
        let slots = configs.iter().map(|_| OnceLock::new()).collect();
        Self {
            configs,
            loader: Box::new(loader),
            slots,
        }
    }

    /// Registry over already-constructed extractors.
    pub fn preloaded(
        primary: Arc<dyn EmbeddingExtractor>,
        auxiliaries: Vec<Arc<dyn EmbeddingExtractor>>,
    ) -> Self {
        let mut configs = Vec::with_capacity(auxiliaries.len() + 1);
        let mut slots = Vec::with_capacity(auxiliaries.len() + 1);
        for (extractor, role) in std::iter::once((primary, ExtractorRole::Primary))
            .chain(auxiliaries.into_iter().map(|a| (a, ExtractorRole::Auxiliary)))
        {
            configs.push(ExtractorConfig {
                name: extractor.name().to_string(),
                version: extractor.version().to_string(),
                role,
                model: String::new(),
                url: None,
                input_size: 0,
                dimension: Some(extractor.dimension()),
                mean: [0.0; 3],
                std: [1.0; 3],
            });
            slots.push(OnceLock::from(Ok(extractor)));
        }
        Self {
            configs,
            loader: Box::new(|config: &ExtractorConfig| -> LoadResult {
                Err(ExtractError::ModelLoad {
                    extractor: config.name.clone(),
                    message: "not preloaded".into(),
                })
            }),
            slots,
        }
    }

    fn load(&self, index: usize) -> LoadResult {
        self.slots[index]
            .get_or_init(|| {
                let config = &self.configs[index];
                log::info!("Loading extractor '{}' v{}", config.name, config.version);
                let result = (self.loader)(config);
                if let Err(e) = &result {
                    log::warn!("{e}");
                }
                result
            })
            .clone()
    }

    /// The primary plus every auxiliary that loaded.
    ///
    /// Fails only when the primary cannot be loaded.
    pub fn extractor_set(&self) -> Result<ExtractorSet, ExtractError> {
        let primary_index = self
            .configs
            .iter()
            .position(|c| c.role == ExtractorRole::Primary)
            .ok_or_else(|| ExtractError::ModelLoad {
                extractor: "primary".into(),
                message: "no primary extractor configured".into(),
            })?;
        let primary = self.load(primary_index)?;

        let auxiliaries = self
            .configs
            .iter()
            .enumerate()
            .filter(|(_, c)| c.role == ExtractorRole::Auxiliary)
            .filter_map(|(i, _)| self.load(i).ok())
            .collect();

        Ok(ExtractorSet::new(primary, auxiliaries))
    }
}
