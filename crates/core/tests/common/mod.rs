#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use trailid_core::embedding::domain::crop_source::{CropError, CropSource};
use trailid_core::embedding::domain::embedding_extractor::{EmbeddingExtractor, ExtractError};
use trailid_core::embedding::infrastructure::extractor_registry::ExtractorRegistry;
use trailid_core::resolution::resolve_detection_use_case::ResolveDetectionUseCase;
use trailid_core::shared::bounding_box::BoundingBox;
use trailid_core::shared::config::{ResolverConfig, RetryConfig};
use trailid_core::shared::crop::Crop;
use trailid_core::shared::detection::RawDetection;
use trailid_core::shared::embedding::Embedding;
use trailid_core::shared::ids::DetectionId;
use trailid_core::shared::photo::NewPhoto;
use trailid_core::store::domain::identity_store::IdentityStore;

/// Crop pixels all equal the box's x offset, so tests pick an animal's
/// appearance by where they place its box.
pub struct PatternCrops;

impl CropSource for PatternCrops {
    fn crop(&self, _path: &Path, bbox: &BoundingBox) -> Result<Crop, CropError> {
        let len = (bbox.width * bbox.height * 3) as usize;
        Ok(Crop::new(vec![(bbox.x % 256) as u8; len], bbox.width, bbox.height))
    }
}

/// Maps a crop's first byte to one of four orthogonal directions.
pub struct CountingExtractor {
    calls: AtomicUsize,
}

impl CountingExtractor {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl EmbeddingExtractor for CountingExtractor {
    fn name(&self) -> &str {
        "reid"
    }

    fn version(&self) -> &str {
        "1"
    }

    fn dimension(&self) -> usize {
        4
    }

    fn extract(&self, crop: &Crop) -> Result<Option<Embedding>, ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut v = vec![0.0; 4];
        v[(crop.data()[0] / 64) as usize] = 1.0;
        Ok(Embedding::normalized(v))
    }
}

/// Appearance x offsets that land on distinct directions.
pub const STRIPED: u32 = 0;
pub const SPOTTED: u32 = 64;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn config() -> ResolverConfig {
    ResolverConfig {
        retry: RetryConfig {
            max_attempts: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
        },
        ..ResolverConfig::default()
    }
}

pub fn resolver(
    store: Arc<dyn IdentityStore>,
    extractor: Arc<CountingExtractor>,
) -> ResolveDetectionUseCase {
    ResolveDetectionUseCase::new(
        store,
        Arc::new(PatternCrops),
        Arc::new(ExtractorRegistry::preloaded(extractor, vec![])),
        &config(),
    )
}

/// Ingest one photo at `location` with boxes `(x, confidence, label)`.
pub fn photo(
    store: &dyn IdentityStore,
    location: &str,
    secs: i64,
    boxes: &[(u32, f64, &str)],
) -> Vec<DetectionId> {
    let raw = boxes
        .iter()
        .map(|&(x, confidence, label)| RawDetection {
            bbox: BoundingBox::new(x, 0, 60, 60),
            confidence,
            label: label.to_string(),
        })
        .collect();
    let (_, detections) = store
        .ingest(
            NewPhoto {
                path: format!("{location}/{secs}.jpg").into(),
                location: Some(location.to_string()),
                captured_at: Some(at(secs)),
                uploaded_at: at(secs),
            },
            raw,
        )
        .unwrap();
    detections.into_iter().map(|d| d.id).collect()
}
