use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use crate::resolution::resolution_outcome::{ResolutionOutcome, ResolutionStatus};

/// Cross-cutting observer for resolution outcomes.
///
/// Lets callers count, print or forward outcomes without the use cases
/// knowing where they go. Shared across worker threads.
pub trait ResolutionLogger: Send + Sync {
    fn record(&self, outcome: &ResolutionOutcome);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

/// Discards all outcomes.
pub struct NullResolutionLogger;

impl ResolutionLogger for NullResolutionLogger {
    fn record(&self, _outcome: &ResolutionOutcome) {}
}

/// Per-status counters with a summary report, for operators.
pub struct CountingResolutionLogger {
    counts: [AtomicUsize; 5],
    start_time: Instant,
}

impl CountingResolutionLogger {
    pub fn new() -> Self {
        Self {
            counts: Default::default(),
            start_time: Instant::now(),
        }
    }

    fn slot(status: ResolutionStatus) -> usize {
        match status {
            ResolutionStatus::BurstLinked => 0,
            ResolutionStatus::Matched => 1,
            ResolutionStatus::NewIdentity => 2,
            ResolutionStatus::Skipped => 3,
            ResolutionStatus::Failed => 4,
        }
    }

    pub fn count(&self, status: ResolutionStatus) -> usize {
        self.counts[Self::slot(status)].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Returns the formatted summary string, or `None` if nothing was recorded.
    pub fn summary_string(&self) -> Option<String> {
        let total = self.total();
        if total == 0 {
            return None;
        }
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let mut lines = vec![format!(
            "Resolution summary ({total} detections, {elapsed:.1}s total):"
        )];
        for status in ResolutionStatus::ALL {
            lines.push(format!("  {:13}: {}", status.as_str(), self.count(status)));
        }
        if self.count(ResolutionStatus::Failed) > 0 {
            lines.push("  Failed detections need attention: run `trailid failures`".into());
        }
        Some(lines.join("\n"))
    }
}

impl Default for CountingResolutionLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolutionLogger for CountingResolutionLogger {
    fn record(&self, outcome: &ResolutionOutcome) {
        self.counts[Self::slot(outcome.status)].fetch_add(1, Ordering::Relaxed);
        if outcome.status == ResolutionStatus::Failed {
            log::warn!(
                "Detection {} failed: {}",
                outcome.detection_id,
                outcome.reason.as_deref().unwrap_or("unknown error")
            );
        }
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n\n{text}");
        }
    }
}
