//! Per-image outcomes of a reclaim cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Why an image survived this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    /// Younger than its environment's retention window.
    TooYoung,
    /// No environment tag, or an environment without a retention window.
    UnmanagedEnvironment,
    /// Eligible, but the per-cycle delete cap was already reached.
    DeleteLimitReached,
}

/// A snapshot that could not be deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotFailure {
    pub snapshot_id: String,
    pub error: String,
}

/// Result of the teardown routine for one image.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Teardown {
    pub deleted: Vec<String>,
    pub failed: Vec<SnapshotFailure>,
}

/// Terminal state of one image for this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ImageOutcome {
    Kept {
        reason: KeepReason,
    },
    /// Deregistered and every snapshot deleted.
    Deleted {
        snapshots_deleted: Vec<String>,
    },
    /// Deregistered, but some snapshots could not be deleted. Not retried.
    PartiallyCleaned {
        snapshots_deleted: Vec<String>,
        snapshots_failed: Vec<SnapshotFailure>,
    },
    /// Deregistration failed; snapshots were left untouched.
    DeregisterFailed {
        error: String,
    },
    /// Creation timestamp could not be parsed; image skipped.
    InvalidTimestamp {
        value: String,
        error: String,
    },
    /// Dry run: eligible for deletion, nothing was touched.
    WouldDelete {
        snapshots: Vec<String>,
    },
}

impl ImageOutcome {
    pub fn from_teardown(teardown: Teardown) -> Self {
        if teardown.failed.is_empty() {
            ImageOutcome::Deleted {
                snapshots_deleted: teardown.deleted,
            }
        } else {
            ImageOutcome::PartiallyCleaned {
                snapshots_deleted: teardown.deleted,
                snapshots_failed: teardown.failed,
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ImageOutcome::Kept { .. } => "kept",
            ImageOutcome::Deleted { .. } => "deleted",
            ImageOutcome::PartiallyCleaned { .. } => "partially_cleaned",
            ImageOutcome::DeregisterFailed { .. } => "deregister_failed",
            ImageOutcome::InvalidTimestamp { .. } => "invalid_timestamp",
            ImageOutcome::WouldDelete { .. } => "would_delete",
        }
    }

    /// Whether the image was deregistered this cycle.
    pub fn is_deregistered(&self) -> bool {
        matches!(
            self,
            ImageOutcome::Deleted { .. } | ImageOutcome::PartiallyCleaned { .. }
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ImageOutcome::PartiallyCleaned { .. }
                | ImageOutcome::DeregisterFailed { .. }
                | ImageOutcome::InvalidTimestamp { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageReport {
    pub image_id: String,
    pub environment: Option<String>,
    /// Age at evaluation time; absent when it was not computed.
    pub age_hours: Option<f64>,
    #[serde(flatten)]
    pub outcome: ImageOutcome,
}

/// Results from a single reclaim cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReclaimReport {
    pub evaluated_at: DateTime<Utc>,
    pub dry_run: bool,
    pub images: Vec<ImageReport>,
    /// The cycle hit its time limit before evaluating every image.
    pub truncated: bool,
    /// Images left for the next cycle because of truncation.
    pub unevaluated: usize,
}

impl ReclaimReport {
    pub fn new(evaluated_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            evaluated_at,
            dry_run,
            images: Vec::new(),
            truncated: false,
            unevaluated: 0,
        }
    }

    pub fn get(&self, image_id: &str) -> Option<&ImageReport> {
        self.images.iter().find(|r| r.image_id == image_id)
    }

    pub fn outcome(&self, image_id: &str) -> Option<&ImageOutcome> {
        self.get(image_id).map(|r| &r.outcome)
    }

    /// Images deregistered this cycle (fully or partially cleaned).
    pub fn deleted_count(&self) -> usize {
        self.images
            .iter()
            .filter(|r| r.outcome.is_deregistered())
            .count()
    }

    pub fn kept_count(&self) -> usize {
        self.images
            .iter()
            .filter(|r| matches!(r.outcome, ImageOutcome::Kept { .. }))
            .count()
    }

    pub fn failure_count(&self) -> usize {
        self.images.iter().filter(|r| r.outcome.is_failure()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }

    pub fn has_deletions(&self) -> bool {
        self.deleted_count() > 0
    }
}
