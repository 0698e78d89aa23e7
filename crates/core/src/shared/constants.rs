/// Overlap above which a lower-confidence box in the same photo is a duplicate.
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.5;

/// Half-width of the burst window around a photo's capture time.
pub const DEFAULT_BURST_WINDOW_SECS: i64 = 5;

/// Longest burst window accepted. A day-long "burst" is already meaningless.
pub const MAX_BURST_WINDOW_SECS: i64 = 86_400;

/// Crops shorter than this on either axis are not embedded.
pub const DEFAULT_MIN_CROP_PX: u32 = 50;

/// Minimum ensemble cosine for a match. Tuned against observed score distributions.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.40;

pub const DEFAULT_PRIMARY_WEIGHT: f64 = 0.6;
pub const DEFAULT_AUXILIARY_WEIGHT: f64 = 0.4;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Application directory name under the platform cache dir.
pub const APP_DIR_NAME: &str = "TrailId";

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif", "webp"];
