use std::error::Error;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use trailid_core::dedup::domain::frame_deduplicator::FrameDeduplicator;
use trailid_core::embedding::infrastructure::extractor_registry::ExtractorRegistry;
use trailid_core::embedding::infrastructure::image_crop_source::ImageCropSource;
use trailid_core::matching::infrastructure::jsonl_similarity_log::JsonlSimilarityLog;
use trailid_core::resolution::deduplicate_photo_use_case::DeduplicatePhotoUseCase;
use trailid_core::resolution::infrastructure::threaded_resolution_executor::ThreadedResolutionExecutor;
use trailid_core::resolution::merge_identities_use_case::MergeIdentitiesUseCase;
use trailid_core::resolution::resolution_executor::{ExecutionConfig, ResolutionExecutor};
use trailid_core::resolution::resolution_logger::{CountingResolutionLogger, ResolutionLogger};
use trailid_core::resolution::resolution_outcome::ResolutionStatus;
use trailid_core::resolution::resolve_detection_use_case::ResolveDetectionUseCase;
use trailid_core::resolution::unresolve_use_case::UnresolveUseCase;
use trailid_core::shared::category::Category;
use trailid_core::shared::config::ResolverConfig;
use trailid_core::shared::detection::{Detection, RawDetection, ResolutionState};
use trailid_core::shared::identity::Identity;
use trailid_core::shared::ids::{DetectionId, IdentityId, PhotoId};
use trailid_core::shared::photo::NewPhoto;
use trailid_core::store::domain::identity_store::{
    require_identity, IdentityStore, StoreError, StoreReader,
};
use trailid_core::store::infrastructure::in_memory_store::InMemoryIdentityStore;

/// Identity resolution for trail-camera wildlife detections.
#[derive(Parser)]
#[command(name = "trailid")]
struct Cli {
    /// Identity store file (created on first write).
    #[arg(long, global = true, default_value = "trailid-store.json")]
    store: PathBuf,

    /// Resolver configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a JSON batch of photos and their raw detections.
    Ingest {
        /// File holding `[{"photo": {...}, "detections": [...]}, ...]`.
        batch: PathBuf,
    },
    /// Deduplicate and resolve every pending detection.
    Process {
        /// Worker threads (overrides the config; 0 = all cores).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List identities.
    Identities {
        /// Only this category (buck, doe, fawn, ...).
        #[arg(long, value_parser = parse_category)]
        category: Option<Category>,
    },
    /// Show one identity and its detections.
    Show { identity: u64 },
    /// Send detections back to the resolution queue.
    Unresolve {
        /// A detection; the rest of its burst comes with it.
        #[arg(long, conflicts_with = "identity", required_unless_present = "identity")]
        detection: Option<u64>,
        /// Every detection of this identity. The identity is removed.
        #[arg(long)]
        identity: Option<u64>,
    },
    /// Fold `absorb` into `keep`.
    Merge { keep: u64, absorb: u64 },
    /// Merge identities that ended up sharing a burst group.
    Reconcile,
    /// List skipped and failed detections with their reasons.
    Failures {
        /// Only failed detections.
        #[arg(long)]
        failed_only: bool,
    },
}

#[derive(Deserialize)]
struct BatchEntry {
    photo: NewPhoto,
    #[serde(default)]
    detections: Vec<RawDetection>,
}

#[derive(Serialize)]
struct IdentitySummary<'a> {
    id: IdentityId,
    category: Category,
    sighting_count: u32,
    confidence: f64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    extractors: &'a str,
}

impl<'a> From<&'a Identity> for IdentitySummary<'a> {
    fn from(identity: &'a Identity) -> Self {
        Self {
            id: identity.id,
            category: identity.category,
            sighting_count: identity.sighting_count,
            confidence: identity.confidence,
            first_seen: identity.first_seen,
            last_seen: identity.last_seen,
            extractors: &identity.extractor_tag,
        }
    }
}

#[derive(Serialize)]
struct IdentityDetail<'a> {
    #[serde(flatten)]
    summary: IdentitySummary<'a>,
    detections: Vec<DetectionLine<'a>>,
}

#[derive(Serialize)]
struct DetectionLine<'a> {
    id: DetectionId,
    photo: PhotoId,
    status: Option<ResolutionStatus>,
    confidence: f64,
    label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

impl<'a> From<&'a Detection> for DetectionLine<'a> {
    fn from(d: &'a Detection) -> Self {
        let reason = match &d.resolution {
            ResolutionState::Skipped(r) | ResolutionState::Failed(r) => Some(r.as_str()),
            _ => None,
        };
        Self {
            id: d.id,
            photo: d.photo_id,
            status: ResolutionStatus::from_state(&d.resolution),
            confidence: d.confidence,
            label: &d.label,
            reason,
        }
    }
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store: Arc<dyn IdentityStore> = Arc::new(InMemoryIdentityStore::open(&cli.store)?);

    match cli.command {
        Command::Ingest { batch } => run_ingest(&*store, &batch),
        Command::Process { workers } => run_process(store, config, workers),
        Command::Identities { category } => run_identities(&*store, category),
        Command::Show { identity } => run_show(&*store, IdentityId(identity)),
        Command::Unresolve {
            detection,
            identity,
        } => {
            let use_case = UnresolveUseCase::new(store);
            let report = match (detection, identity) {
                (Some(d), _) => use_case.detection(DetectionId(d))?,
                (None, Some(i)) => use_case.identity(IdentityId(i))?,
                (None, None) => return Err("pass --detection or --identity".into()),
            };
            print_json(&report)
        }
        Command::Merge { keep, absorb } => {
            let report =
                MergeIdentitiesUseCase::new(store).merge(IdentityId(keep), IdentityId(absorb))?;
            print_json(&report)
        }
        Command::Reconcile => {
            let reports = MergeIdentitiesUseCase::new(store).reconcile_bursts()?;
            if reports.is_empty() {
                log::info!("No split bursts found");
            }
            reports.iter().try_for_each(print_json)
        }
        Command::Failures { failed_only } => run_failures(&*store, failed_only),
    }
}

fn load_config(path: Option<&Path>) -> Result<ResolverConfig, Box<dyn Error>> {
    let config = match path {
        Some(path) => ResolverConfig::load(path)?,
        None => ResolverConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run_ingest(store: &dyn IdentityStore, batch: &Path) -> Result<(), Box<dyn Error>> {
    let entries = read_batch(batch)?;
    let mut detections = 0;
    for entry in &entries {
        let (photo, ingested) = store.ingest(entry.photo.clone(), entry.detections.clone())?;
        log::debug!(
            "Ingested photo {} ({}) with {} detection(s)",
            photo.id,
            photo.path.display(),
            ingested.len()
        );
        detections += ingested.len();
    }
    log::info!(
        "Ingested {} photo(s), {detections} detection(s) from {}",
        entries.len(),
        batch.display()
    );
    Ok(())
}

fn read_batch(path: &Path) -> Result<Vec<BatchEntry>, Box<dyn Error>> {
    let text = fs::read_to_string(path)
        .map_err(|e| format!("Cannot read batch {}: {e}", path.display()))?;
    let entries: Vec<BatchEntry> = serde_json::from_str(&text)
        .map_err(|e| format!("Invalid batch {}: {e}", path.display()))?;
    Ok(entries)
}

fn run_process(
    store: Arc<dyn IdentityStore>,
    mut config: ResolverConfig,
    workers: Option<usize>,
) -> Result<(), Box<dyn Error>> {
    if config.primary_extractor().is_none() {
        return Err("No primary extractor configured; pass --config with an `extractors` list".into());
    }
    if let Some(workers) = workers {
        config.workers = workers;
    }

    let logger = Arc::new(CountingResolutionLogger::new());
    let mut resolver = ResolveDetectionUseCase::new(
        store.clone(),
        Arc::new(ImageCropSource),
        Arc::new(ExtractorRegistry::onnx(&config)),
        &config,
    )
    .with_logger(logger.clone());
    if let Some(path) = &config.similarity_log {
        resolver = resolver.with_similarity_log(Arc::new(JsonlSimilarityLog::open(path)?));
    }
    let dedup = DeduplicatePhotoUseCase::new(
        store.clone(),
        FrameDeduplicator::new(config.iou_threshold),
    );

    let photos: Vec<PhotoId> = store.photos()?.iter().map(|p| p.id).collect();
    let mut execution = ExecutionConfig::new(config.worker_count());
    execution.on_progress = Some(Box::new(|done, total| {
        eprint!("\rResolving detection {done}/{total}");
    }));

    let report = ThreadedResolutionExecutor::new().execute(&photos, &dedup, &resolver, execution)?;
    if !report.outcomes.is_empty() {
        eprintln!();
    }

    for outcome in &report.outcomes {
        print_json(outcome)?;
    }
    for (id, error) in &report.errors {
        log::error!("Detection {id} could not be recorded: {error}");
    }
    logger.summary();

    if report.errors.is_empty() {
        Ok(())
    } else {
        Err(format!("{} detection(s) could not be recorded", report.errors.len()).into())
    }
}

fn run_identities(
    store: &dyn IdentityStore,
    category: Option<Category>,
) -> Result<(), Box<dyn Error>> {
    let identities = match category {
        Some(category) => store.identities_by_category(category)?,
        None => store.identities()?,
    };
    identities
        .iter()
        .try_for_each(|identity| print_json(&IdentitySummary::from(identity)))
}

fn run_show(store: &dyn IdentityStore, id: IdentityId) -> Result<(), Box<dyn Error>> {
    let identity = require_identity(store, id)?;
    let detections = store.detections_for_identity(id)?;
    let detail = IdentityDetail {
        summary: IdentitySummary::from(&identity),
        detections: detections.iter().map(DetectionLine::from).collect(),
    };
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, &detail)?;
    writeln!(out)?;
    Ok(())
}

fn run_failures(store: &dyn IdentityStore, failed_only: bool) -> Result<(), Box<dyn Error>> {
    let unresolvable = unresolvable_detections(store, failed_only)?;
    if unresolvable.is_empty() {
        log::info!("No skipped or failed detections");
    }
    unresolvable
        .iter()
        .try_for_each(|d| print_json(&DetectionLine::from(d)))
}

fn unresolvable_detections(
    store: &dyn IdentityStore,
    failed_only: bool,
) -> Result<Vec<Detection>, StoreError> {
    store.detections_where(&|d: &Detection| match d.resolution {
        ResolutionState::Failed(_) => true,
        ResolutionState::Skipped(_) => !failed_only && !d.is_duplicate,
        _ => false,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    let mut out = io::stdout().lock();
    serde_json::to_writer(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn parse_category(s: &str) -> Result<Category, String> {
    s.parse().map_err(|e: trailid_core::shared::category::CategoryError| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::CommandFactory;
    use tempfile::TempDir;
    use trailid_core::shared::bounding_box::BoundingBox;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_unresolve_requires_a_target() {
        assert!(Cli::try_parse_from(["trailid", "unresolve"]).is_err());
        assert!(
            Cli::try_parse_from(["trailid", "unresolve", "--detection", "1", "--identity", "2"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["trailid", "unresolve", "--identity", "2"]).is_ok());
    }

    #[test]
    fn test_category_flag_rejects_unknown_names() {
        assert!(Cli::try_parse_from(["trailid", "identities", "--category", "doe"]).is_ok());
        assert!(Cli::try_parse_from(["trailid", "identities", "--category", "moose"]).is_err());
    }

    #[test]
    fn test_read_batch_fills_optional_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("batch.json");
        fs::write(
            &path,
            r#"[
                {
                    "photo": {
                        "path": "cam1/0001.jpg",
                        "location": "creek",
                        "captured_at": "2024-10-01T06:30:00Z",
                        "uploaded_at": "2024-10-01T07:00:00Z"
                    },
                    "detections": [
                        {"bbox": {"x": 10, "y": 20, "width": 80, "height": 60},
                         "confidence": 0.91, "label": "doe"}
                    ]
                },
                {"photo": {"path": "cam1/0002.jpg", "uploaded_at": "2024-10-01T07:00:00Z"}}
            ]"#,
        )
        .unwrap();

        let entries = read_batch(&path).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].detections[0].bbox, BoundingBox::new(10, 20, 80, 60));
        assert_eq!(
            entries[0].photo.captured_at,
            Some(Utc.with_ymd_and_hms(2024, 10, 1, 6, 30, 0).unwrap())
        );
        assert!(entries[1].detections.is_empty());
        assert_eq!(entries[1].photo.location, None);
    }

    #[test]
    fn test_read_batch_reports_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{").unwrap();
        let err = read_batch(&path).err().unwrap().to_string();
        assert!(err.contains("broken.json"));
    }

    #[test]
    fn test_failures_listing_hides_duplicates() {
        let store = InMemoryIdentityStore::new();
        let (_, detections) = store
            .ingest(
                NewPhoto {
                    path: "a.jpg".into(),
                    location: None,
                    captured_at: None,
                    uploaded_at: Utc.with_ymd_and_hms(2024, 10, 1, 7, 0, 0).unwrap(),
                },
                (0..3)
                    .map(|i| RawDetection {
                        bbox: BoundingBox::new(i * 100, 0, 60, 60),
                        confidence: 0.5,
                        label: "doe".into(),
                    })
                    .collect(),
            )
            .unwrap();
        let states = [
            (ResolutionState::Failed("inference failed".into()), false),
            (ResolutionState::Skipped("image missing".into()), false),
            (ResolutionState::Skipped("duplicate".into()), true),
        ];
        let mut tx = store.begin().unwrap();
        for (mut d, (state, duplicate)) in detections.into_iter().zip(states) {
            d.resolution = state;
            d.is_duplicate = duplicate;
            tx.update_detection(d).unwrap();
        }
        tx.commit().unwrap();

        assert_eq!(unresolvable_detections(&store, false).unwrap().len(), 2);
        assert_eq!(unresolvable_detections(&store, true).unwrap().len(), 1);
    }
}
