use std::sync::atomic::{AtomicUsize, Ordering};

use crate::resolution::deduplicate_photo_use_case::DeduplicatePhotoUseCase;
use crate::resolution::resolution_executor::{
    ExecutionConfig, ExecutionReport, ResolutionExecutor,
};
use crate::resolution::resolution_outcome::ResolutionOutcome;
use crate::resolution::resolve_detection_use_case::{ResolveDetectionUseCase, ResolveError};
use crate::shared::ids::{DetectionId, PhotoId};
use crate::store::domain::identity_store::StoreError;

const JOBS_PER_WORKER: usize = 4;

type WorkerResult = (DetectionId, Result<ResolutionOutcome, ResolveError>);

/// Deduplicates photos on the calling thread, then resolves their pending
/// detections on a pool of worker threads fed by a bounded channel.
///
/// Layout: `main [dedup → queue] → N workers [resolve] → results`
pub struct ThreadedResolutionExecutor;

impl ThreadedResolutionExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ThreadedResolutionExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionExecutor for ThreadedResolutionExecutor {
    fn execute(
        &self,
        photos: &[PhotoId],
        dedup: &DeduplicatePhotoUseCase,
        resolver: &ResolveDetectionUseCase,
        config: ExecutionConfig,
    ) -> Result<ExecutionReport, StoreError> {
        let mut report = ExecutionReport::default();
        let mut pending = Vec::new();
        for &photo in photos {
            if config.cancelled.load(Ordering::Relaxed) {
                return Ok(report);
            }
            let survivors = dedup.execute(photo)?;
            report.photos += 1;
            pending.extend(
                survivors
                    .into_iter()
                    .filter(|d| !d.resolution.is_terminal())
                    .map(|d| d.id),
            );
        }

        let total = pending.len();
        if total == 0 {
            return Ok(report);
        }
        let workers = config.workers.clamp(1, total);
        log::info!(
            "Resolving {total} detection(s) from {} photo(s) on {workers} worker(s)",
            report.photos
        );

        let (job_tx, job_rx) = crossbeam_channel::bounded::<DetectionId>(workers * JOBS_PER_WORKER);
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<WorkerResult>();
        let completed = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let completed = &completed;
                let config = &config;
                scope.spawn(move || {
                    for id in job_rx {
                        if config.cancelled.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = resolver.execute(id);
                        let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                        if let Some(ref cb) = config.on_progress {
                            cb(done, total);
                        }
                        if result_tx.send((id, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(job_rx);
            drop(result_tx);

            for id in pending {
                if config.cancelled.load(Ordering::Relaxed) || job_tx.send(id).is_err() {
                    break;
                }
            }
            drop(job_tx);
        });

        for (id, result) in result_rx {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(e) => {
                    log::error!("Detection {id}: {e}");
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        report.outcomes.sort_by_key(|o| o.detection_id);
        report.errors.sort_by_key(|(id, _)| *id);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::domain::frame_deduplicator::FrameDeduplicator;
    use crate::embedding::domain::crop_source::{CropError, CropSource};
    use crate::embedding::domain::embedding_extractor::{EmbeddingExtractor, ExtractError};
    use crate::embedding::infrastructure::extractor_registry::ExtractorRegistry;
    use crate::resolution::resolution_outcome::ResolutionStatus;
    use crate::shared::bounding_box::BoundingBox;
    use crate::shared::config::ResolverConfig;
    use crate::shared::crop::Crop;
    use crate::shared::detection::RawDetection;
    use crate::shared::embedding::Embedding;
    use crate::shared::photo::NewPhoto;
    use crate::store::domain::identity_store::{IdentityStore, StoreReader};
    use crate::store::infrastructure::in_memory_store::InMemoryIdentityStore;
    use chrono::{TimeZone, Utc};
    use std::path::Path;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    /// Crop pixels carry the box's x offset so the extractor can tell animals apart.
    struct TaggedCrops;

    impl CropSource for TaggedCrops {
        fn crop(&self, _path: &Path, bbox: &BoundingBox) -> Result<Crop, CropError> {
            let len = (bbox.width * bbox.height * 3) as usize;
            Ok(Crop::new(vec![(bbox.x % 256) as u8; len], bbox.width, bbox.height))
        }
    }

    struct AxisExtractor;

    impl EmbeddingExtractor for AxisExtractor {
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
            let mut v = vec![0.0; 4];
            v[(crop.data()[0] / 64) as usize] = 1.0;
            Ok(Embedding::normalized(v))
        }
    }

    fn photo(store: &InMemoryIdentityStore, secs: i64, boxes: &[(u32, f64)]) -> PhotoId {
        let detections = boxes
            .iter()
            .map(|&(x, confidence)| RawDetection {
                bbox: BoundingBox::new(x, 0, 60, 60),
                confidence,
                label: "doe".into(),
            })
            .collect();
        store
            .ingest(
                NewPhoto {
                    path: format!("{secs}.jpg").into(),
                    location: Some("creek".into()),
                    captured_at: Some(Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()),
                    uploaded_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
                },
                detections,
            )
            .unwrap()
            .0
            .id
    }

    fn run(
        store: Arc<InMemoryIdentityStore>,
        photos: &[PhotoId],
        config: ExecutionConfig,
    ) -> ExecutionReport {
        let dedup = DeduplicatePhotoUseCase::new(store.clone(), FrameDeduplicator::default());
        let resolver = ResolveDetectionUseCase::new(
            store,
            Arc::new(TaggedCrops),
            Arc::new(ExtractorRegistry::preloaded(Arc::new(AxisExtractor), vec![])),
            &ResolverConfig::default(),
        );
        ThreadedResolutionExecutor::new()
            .execute(photos, &dedup, &resolver, config)
            .unwrap()
    }

    #[test]
    fn test_resolves_every_surviving_detection() {
        let store = Arc::new(InMemoryIdentityStore::new());
        // photo 1: one animal reported twice; photo 2 is the same burst
        let p1 = photo(&store, 0, &[(0, 0.9), (2, 0.5)]);
        let p2 = photo(&store, 3, &[(1, 0.8)]);
        // an hour later, a different animal
        let p3 = photo(&store, 3600, &[(128, 0.7)]);

        let report = run(store.clone(), &[p1, p2, p3], ExecutionConfig::new(4));

        assert_eq!(report.photos, 3);
        assert!(report.errors.is_empty());
        let ids: Vec<u64> = report.outcomes.iter().map(|o| o.detection_id.0).collect();
        assert_eq!(ids, vec![1, 3, 4]);
        assert!(store.detection(DetectionId(2)).unwrap().unwrap().is_duplicate);

        let burst: Vec<_> = [1, 3]
            .iter()
            .map(|&i| store.detection(DetectionId(i)).unwrap().unwrap())
            .collect();
        assert_eq!(burst[0].identity_id, burst[1].identity_id);
        assert_eq!(burst[0].burst_group, burst[1].burst_group);
        assert_eq!(store.identities().unwrap().len(), 2);
        assert_eq!(
            report
                .outcomes
                .iter()
                .filter(|o| o.status == ResolutionStatus::NewIdentity)
                .count(),
            2
        );
    }

    #[test]
    fn test_second_run_has_nothing_pending() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let p1 = photo(&store, 0, &[(0, 0.9)]);

        run(store.clone(), &[p1], ExecutionConfig::new(2));
        let again = run(store, &[p1], ExecutionConfig::new(2));
        assert!(again.outcomes.is_empty());
        assert_eq!(again.photos, 1);
    }

    #[test]
    fn test_progress_reaches_total() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let photos: Vec<PhotoId> = (0..5).map(|i| photo(&store, i * 600, &[(0, 0.9)])).collect();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let mut config = ExecutionConfig::new(3);
        config.on_progress = Some(Box::new(move |done, total| {
            sink.lock().unwrap().push((done, total));
        }));
        run(store, &photos, config);

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen.last(), Some(&(5, 5)));
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_cancelled_run_resolves_nothing() {
        let store = Arc::new(InMemoryIdentityStore::new());
        let p1 = photo(&store, 0, &[(0, 0.9)]);
        let config = ExecutionConfig {
            cancelled: Arc::new(AtomicBool::new(true)),
            ..ExecutionConfig::new(1)
        };
        let report = run(store.clone(), &[p1], config);
        assert!(report.outcomes.is_empty());
        assert!(store.identities().unwrap().is_empty());
    }
}
